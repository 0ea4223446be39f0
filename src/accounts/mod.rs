use crate::state::AppState;
use axum::Router;

pub mod codes;
pub mod dto;
pub mod extractors;
pub mod handlers;
pub mod limiter;
pub mod password;
pub mod repo;
pub mod repo_types;
pub mod services;
pub mod session;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::auth_routes())
        .merge(handlers::session_routes())
        .merge(handlers::account_routes())
        .merge(handlers::admin_routes())
}

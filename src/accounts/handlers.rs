use axum::{
    extract::{FromRef, Path, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use tracing::{info, instrument};
use uuid::Uuid;

use super::dto::{
    ChangePasswordRequest, ConfirmEmailChangeRequest, EmailChangeRequest, Empty,
    FavoriteResponse, LoginRequest, ResendRequest, SessionResponse, SignupRequest, SignupResponse,
    Success, SuspendRequest, UpdateProfileRequest, VerifyRequest,
};
use super::extractors::{AdminUser, ClientIp, MaybeSession, Payload, SessionUser};
use super::limiter::{self, RateLimitAction};
use super::services;
use super::session::{materialize, SessionKeys, SessionSnapshot};
use crate::error::{AccountError, AccountResult};
use crate::state::AppState;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/verify", post(verify))
        .route("/auth/verify/resend", post(resend_verification))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
}

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/session", get(get_session))
        .route("/session/refresh", post(refresh_session))
}

pub fn account_routes() -> Router<AppState> {
    Router::new()
        .route("/account/password", post(change_password))
        .route("/account/email", post(request_email_change))
        .route("/account/email/confirm", post(confirm_email_change))
        .route("/account/profile", patch(update_profile))
        .route("/account/favorites/:recipe_id", post(toggle_favorite))
}

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/admin/users/:id/suspend",
            post(suspend_user).delete(unsuspend_user),
        )
        .route("/admin/users/:id", delete(delete_user))
}

/// Response that installs `snapshot` as the session cookie.
fn with_session(state: &AppState, snapshot: SessionSnapshot) -> AccountResult<Response> {
    let cookie = SessionKeys::from_ref(state).install(&snapshot)?;
    Ok(with_cookie(
        cookie,
        Success::new(SessionResponse {
            session: Some(snapshot),
        }),
    ))
}

fn with_cookie<T: serde::Serialize>(cookie: HeaderValue, body: Success<T>) -> Response {
    ([(header::SET_COOKIE, cookie)], Json(body)).into_response()
}

// ---- auth ----

#[instrument(skip(state, payload))]
pub async fn signup(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Payload(payload): Payload<SignupRequest>,
) -> AccountResult<Json<Success<SignupResponse>>> {
    limiter::consume(&state.db, &ip, RateLimitAction::Signup).await?;
    let email = services::signup(&state, &payload).await?;
    Ok(Json(Success::new(SignupResponse {
        email,
        message: "Verification code sent",
    })))
}

#[instrument(skip(state, payload))]
pub async fn resend_verification(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Payload(payload): Payload<ResendRequest>,
) -> AccountResult<Json<Success<Empty>>> {
    limiter::consume(&state.db, &ip, RateLimitAction::Otp).await?;
    services::resend_verification(&state, &payload).await?;
    Ok(Json(Success::new(Empty {})))
}

#[instrument(skip(state, payload))]
pub async fn verify(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Payload(payload): Payload<VerifyRequest>,
) -> AccountResult<Response> {
    limiter::consume(&state.db, &ip, RateLimitAction::Otp).await?;
    let snapshot = services::verify_signup(&state, &payload).await?;
    with_session(&state, snapshot)
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Payload(payload): Payload<LoginRequest>,
) -> AccountResult<Response> {
    limiter::consume(&state.db, &ip, RateLimitAction::Login).await?;
    let snapshot = services::login(&state, &payload).await?;
    with_session(&state, snapshot)
}

#[instrument(skip_all)]
pub async fn logout(State(state): State<AppState>, MaybeSession(session): MaybeSession) -> AccountResult<Response> {
    if let Some(session) = session {
        info!(user_id = %session.id, "user logged out");
    }
    let cookie = SessionKeys::from_ref(&state).destroy()?;
    Ok(with_cookie(cookie, Success::new(Empty {})))
}

// ---- session ----

/// Cookie snapshot, re-read from the store when the cookie copy is partial.
pub async fn get_session(
    State(state): State<AppState>,
    MaybeSession(session): MaybeSession,
) -> AccountResult<Json<Success<SessionResponse>>> {
    let session = match session {
        Some(partial) if partial.partial => Some(materialize(&state.db, partial.id).await?),
        other => other,
    };
    Ok(Json(Success::new(SessionResponse { session })))
}

#[instrument(skip(state, session), fields(user_id = %session.id))]
pub async fn refresh_session(
    State(state): State<AppState>,
    SessionUser(session): SessionUser,
) -> AccountResult<Response> {
    match services::refresh_session(&state, session.id).await {
        Ok(snapshot) => with_session(&state, snapshot),
        Err(e @ (AccountError::Unauthorized | AccountError::Suspended { .. })) => {
            let cookie = SessionKeys::from_ref(&state).destroy()?;
            Ok(([(header::SET_COOKIE, cookie)], e).into_response())
        }
        Err(e) => Err(e),
    }
}

// ---- account ----

#[instrument(skip(state, session, payload), fields(user_id = %session.id))]
pub async fn change_password(
    State(state): State<AppState>,
    SessionUser(session): SessionUser,
    Payload(payload): Payload<ChangePasswordRequest>,
) -> AccountResult<Response> {
    let snapshot = services::change_password(&state, session.id, &payload).await?;
    with_session(&state, snapshot)
}

#[instrument(skip(state, session, payload), fields(user_id = %session.id))]
pub async fn request_email_change(
    State(state): State<AppState>,
    SessionUser(session): SessionUser,
    Payload(payload): Payload<EmailChangeRequest>,
) -> AccountResult<Json<Success<Empty>>> {
    services::request_email_change(&state, session.id, &payload).await?;
    Ok(Json(Success::new(Empty {})))
}

#[instrument(skip(state, session, payload), fields(user_id = %session.id))]
pub async fn confirm_email_change(
    State(state): State<AppState>,
    SessionUser(session): SessionUser,
    Payload(payload): Payload<ConfirmEmailChangeRequest>,
) -> AccountResult<Response> {
    limiter::consume(&state.db, &session.id.to_string(), RateLimitAction::Otp).await?;
    let snapshot = services::confirm_email_change(&state, session.id, &payload).await?;
    with_session(&state, snapshot)
}

#[instrument(skip(state, session, payload), fields(user_id = %session.id))]
pub async fn update_profile(
    State(state): State<AppState>,
    SessionUser(session): SessionUser,
    Payload(payload): Payload<UpdateProfileRequest>,
) -> AccountResult<Response> {
    let snapshot = services::update_profile(&state, session.id, &payload).await?;
    with_session(&state, snapshot)
}

#[instrument(skip(state, session), fields(user_id = %session.id))]
pub async fn toggle_favorite(
    State(state): State<AppState>,
    SessionUser(session): SessionUser,
    Path(recipe_id): Path<Uuid>,
) -> AccountResult<Response> {
    let outcome = services::toggle_favorite(&state, session.id, recipe_id).await?;
    let cookie = SessionKeys::from_ref(&state).install(&outcome.session)?;
    Ok(with_cookie(
        cookie,
        Success::new(FavoriteResponse {
            recipe_id,
            is_favorite: outcome.is_favorite,
            achievement_unlocked: outcome.achievement_unlocked,
            session: outcome.session,
        }),
    ))
}

// ---- admin ----

#[instrument(skip(state, payload))]
pub async fn suspend_user(
    State(state): State<AppState>,
    AdminUser(admin_id): AdminUser,
    Path(id): Path<Uuid>,
    Payload(payload): Payload<SuspendRequest>,
) -> AccountResult<Json<Success<Empty>>> {
    services::suspend_account(&state, admin_id, id, Some(payload.until)).await?;
    Ok(Json(Success::new(Empty {})))
}

#[instrument(skip(state))]
pub async fn unsuspend_user(
    State(state): State<AppState>,
    AdminUser(admin_id): AdminUser,
    Path(id): Path<Uuid>,
) -> AccountResult<Json<Success<Empty>>> {
    services::suspend_account(&state, admin_id, id, None).await?;
    Ok(Json(Success::new(Empty {})))
}

#[instrument(skip(state))]
pub async fn delete_user(
    State(state): State<AppState>,
    AdminUser(admin_id): AdminUser,
    Path(id): Path<Uuid>,
) -> AccountResult<Json<Success<Empty>>> {
    services::delete_account(&state, admin_id, id).await?;
    Ok(Json(Success::new(Empty {})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, http::StatusCode};
    use tower::ServiceExt;

    fn app() -> Router {
        crate::accounts::router().with_state(AppState::fake())
    }

    async fn body_json(res: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn anonymous_session_is_null() {
        let res = app()
            .oneshot(Request::get("/session").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let json = body_json(res).await;
        assert_eq!(json["success"], true);
        assert!(json["session"].is_null());
    }

    #[tokio::test]
    async fn garbage_cookie_reads_as_anonymous() {
        let req = Request::get("/session")
            .header(header::COOKIE, "session=garbage.token.value")
            .body(Body::empty())
            .unwrap();
        let json = body_json(app().oneshot(req).await.unwrap()).await;
        assert!(json["session"].is_null());
    }

    #[tokio::test]
    async fn signed_cookie_is_echoed() {
        let state = AppState::fake();
        let snapshot = SessionSnapshot {
            id: Uuid::new_v4(),
            name: "Ada".into(),
            email: "ada@x.com".into(),
            is_admin: false,
            favorites: vec![],
            favorite_cuisines: vec![],
            country: None,
            dietary_preference: Default::default(),
            avatar: "Ada".into(),
            suspended_until: None,
            name_changed_at: None,
            password_attempts_remaining: 3,
            partial: false,
        };
        let token = SessionKeys::from_ref(&state).sign(&snapshot).unwrap();
        let req = Request::get("/session")
            .header(header::COOKIE, format!("session={token}"))
            .body(Body::empty())
            .unwrap();
        let res = crate::accounts::router()
            .with_state(state)
            .oneshot(req)
            .await
            .unwrap();
        let json = body_json(res).await;
        assert_eq!(json["session"]["email"], "ada@x.com");
    }

    #[tokio::test]
    async fn logout_clears_cookie() {
        let res = app()
            .oneshot(Request::post("/auth/logout").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let cookie = res.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cookie.contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn account_routes_require_a_session() {
        let req = Request::post("/account/password")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"currentPassword":"a","newPassword":"b"}"#))
            .unwrap();
        let res = app().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(res).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Not signed in");
    }

    #[tokio::test]
    async fn admin_routes_require_a_session() {
        let req = Request::delete(format!("/admin/users/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let res = app().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
}

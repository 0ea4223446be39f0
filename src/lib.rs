pub mod accounts;
pub mod app;
pub mod config;
pub mod error;
pub mod mailer;
pub mod realtime;
pub mod state;

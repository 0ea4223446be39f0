use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::error;

/// Every failure a gateway operation can surface to a caller.
///
/// Display strings are what the caller sees, so they never carry store
/// internals. `NoSuchAccount` and `BadPassword` render identically.
#[derive(Error, Debug)]
pub enum AccountError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Not signed in")]
    Unauthorized,

    #[error("Not allowed")]
    Forbidden,

    #[error("Not found")]
    NotFound,

    #[error("Invalid email or password")]
    NoSuchAccount,

    #[error("Invalid email or password")]
    BadPassword { remaining: Option<i32> },

    #[error("Email address not verified")]
    Unverified,

    #[error("Account suspended")]
    Suspended { until: OffsetDateTime },

    #[error("Verification code expired")]
    CodeExpired,

    #[error("Invalid verification code")]
    CodeMismatch,

    #[error("Too many requests, try again later")]
    RateLimited { retry_at: Option<OffsetDateTime> },

    #[error("Account saved but the email could not be sent; request a new code")]
    EmailDispatchFailed,

    #[error("Service unavailable")]
    Unavailable(#[source] anyhow::Error),
}

pub type AccountResult<T> = Result<T, AccountError>;

impl AccountError {
    pub fn status(&self) -> StatusCode {
        match self {
            AccountError::Validation(_)
            | AccountError::CodeExpired
            | AccountError::CodeMismatch => StatusCode::BAD_REQUEST,
            AccountError::Conflict(_) => StatusCode::CONFLICT,
            AccountError::Unauthorized
            | AccountError::NoSuchAccount
            | AccountError::BadPassword { .. } => StatusCode::UNAUTHORIZED,
            AccountError::Forbidden
            | AccountError::Unverified
            | AccountError::Suspended { .. } => StatusCode::FORBIDDEN,
            AccountError::NotFound => StatusCode::NOT_FOUND,
            AccountError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AccountError::EmailDispatchFailed => StatusCode::BAD_GATEWAY,
            AccountError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn body(&self) -> Value {
        let mut body = json!({ "success": false, "error": self.to_string() });
        match self {
            AccountError::BadPassword {
                remaining: Some(remaining),
            } => {
                body["remainingAttempts"] = json!(remaining);
            }
            AccountError::Suspended { until } => {
                body["suspendedUntil"] = json!(until.unix_timestamp());
            }
            AccountError::RateLimited {
                retry_at: Some(at),
            } => {
                body["retryAt"] = json!(at.unix_timestamp());
            }
            _ => {}
        }
        body
    }
}

impl From<sqlx::Error> for AccountError {
    fn from(e: sqlx::Error) -> Self {
        AccountError::Unavailable(e.into())
    }
}

impl From<anyhow::Error> for AccountError {
    fn from(e: anyhow::Error) -> Self {
        AccountError::Unavailable(e)
    }
}

impl IntoResponse for AccountError {
    fn into_response(self) -> Response {
        if let AccountError::Unavailable(e) = &self {
            error!(error = ?e, "store or transport failure");
        }
        (self.status(), Json(self.body())).into_response()
    }
}

/// Maps a unique-constraint race to a `Conflict`, everything else to `Unavailable`.
pub(crate) fn conflict_on_unique(e: sqlx::Error, message: &str) -> AccountError {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            AccountError::Conflict(message.to_string())
        }
        _ => AccountError::from(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_failures_share_one_message() {
        assert_eq!(
            AccountError::NoSuchAccount.to_string(),
            AccountError::BadPassword { remaining: None }.to_string()
        );
        assert_eq!(
            AccountError::NoSuchAccount.status(),
            AccountError::BadPassword { remaining: None }.status()
        );
    }

    #[test]
    fn unavailable_hides_internals() {
        let err = AccountError::Unavailable(anyhow::anyhow!("relation \"users\" does not exist"));
        let body = err.body();
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"], json!("Service unavailable"));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn bad_password_reports_remaining_attempts() {
        let body = AccountError::BadPassword { remaining: Some(2) }.body();
        assert_eq!(body["remainingAttempts"], json!(2));
    }

    #[test]
    fn rate_limited_maps_to_429() {
        let err = AccountError::RateLimited { retry_at: None };
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(err.body().get("retryAt").is_none());
    }

    #[test]
    fn non_unique_store_errors_are_unavailable() {
        let err = conflict_on_unique(sqlx::Error::RowNotFound, "taken");
        assert!(matches!(err, AccountError::Unavailable(_)));
    }
}

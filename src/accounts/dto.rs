use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::password::MIN_PASSWORD_LEN;
use super::repo_types::DietaryPreference;
use super::session::SessionSnapshot;
use crate::error::{AccountError, AccountResult};

pub const NAME_MIN_LEN: usize = 2;
pub const NAME_MAX_LEN: usize = 32;

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub email: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct ResendRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailChangeRequest {
    pub new_email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmEmailChangeRequest {
    pub new_email: String,
    pub code: String,
}

/// Profile patch. An empty `country` clears it.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileRequest {
    pub name: Option<String>,
    pub country: Option<String>,
    pub dietary_preference: Option<DietaryPreference>,
    pub favorite_cuisines: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct SuspendRequest {
    #[serde(with = "time::serde::rfc3339")]
    pub until: OffsetDateTime,
}

/// Uniform success envelope: `{"success": true, ...data}`.
#[derive(Debug, Serialize)]
pub struct Success<T> {
    pub success: bool,
    #[serde(flatten)]
    pub data: T,
}

impl<T> Success<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Empty {}

#[derive(Debug, Serialize)]
pub struct SignupResponse {
    pub email: String,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session: Option<SessionSnapshot>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteResponse {
    pub recipe_id: Uuid,
    pub is_favorite: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub achievement_unlocked: Option<&'static str>,
    pub session: SessionSnapshot,
}

// ---- validation ----

pub fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Trimmed, lower-cased email, or `Validation` if malformed.
pub fn normalize_email(raw: &str) -> AccountResult<String> {
    let email = raw.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(AccountError::Validation("Invalid email".into()));
    }
    Ok(email)
}

pub fn normalize_name(raw: &str) -> AccountResult<String> {
    let name = raw.trim();
    let len = name.chars().count();
    if !(NAME_MIN_LEN..=NAME_MAX_LEN).contains(&len) {
        return Err(AccountError::Validation(format!(
            "Name must be between {NAME_MIN_LEN} and {NAME_MAX_LEN} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(AccountError::Validation("Name contains invalid characters".into()));
    }
    Ok(name.to_string())
}

pub fn validate_password(password: &str) -> AccountResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AccountError::Validation("Password too short".into()));
    }
    Ok(())
}

pub fn normalize_code(raw: &str) -> AccountResult<String> {
    let code = raw.trim();
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(AccountError::Validation("Code must be 6 digits".into()));
    }
    Ok(code.to_string())
}

pub fn normalize_cuisines(raw: &[String]) -> Vec<String> {
    let mut cuisines: Vec<String> = raw
        .iter()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .collect();
    cuisines.sort();
    cuisines.dedup();
    cuisines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_is_trimmed_and_lowercased() {
        assert_eq!(normalize_email("  Ada@Example.COM ").unwrap(), "ada@example.com");
        assert!(normalize_email("no-at-sign").is_err());
        assert!(normalize_email("a@b").is_err());
    }

    #[test]
    fn name_bounds() {
        assert!(normalize_name("A").is_err());
        assert_eq!(normalize_name("  Ada  ").unwrap(), "Ada");
        assert!(normalize_name(&"x".repeat(NAME_MAX_LEN + 1)).is_err());
        assert!(normalize_name("bad\u{7}name").is_err());
    }

    #[test]
    fn password_minimum() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("long-enough").is_ok());
    }

    #[test]
    fn code_must_be_six_digits() {
        assert_eq!(normalize_code(" 012345 ").unwrap(), "012345");
        assert!(normalize_code("12345").is_err());
        assert!(normalize_code("12345a").is_err());
    }

    #[test]
    fn cuisines_deduplicated() {
        let got = normalize_cuisines(&["Thai".into(), " thai".into(), "".into(), "Greek".into()]);
        assert_eq!(got, vec!["greek".to_string(), "thai".to_string()]);
    }

    #[test]
    fn success_envelope_flattens_data() {
        let body = Success::new(SignupResponse {
            email: "a@x.com".into(),
            message: "sent",
        });
        let json = serde_json::to_value(body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["email"], "a@x.com");
    }

    #[test]
    fn profile_patch_accepts_camel_case() {
        let req: UpdateProfileRequest = serde_json::from_str(
            r#"{"dietaryPreference":"gluten_free","favoriteCuisines":["thai"]}"#,
        )
        .unwrap();
        assert_eq!(req.dietary_preference, Some(DietaryPreference::GlutenFree));
        assert!(req.name.is_none());
    }
}

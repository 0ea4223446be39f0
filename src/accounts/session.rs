//! Session snapshots and the signed cookie that carries them.
//!
//! The cookie is a cache of the store, issued only by the server and never
//! readable from client scripts. Every mutation re-materializes from the
//! store after commit and re-installs the cookie.

use axum::{
    extract::FromRef,
    http::{header, HeaderMap, HeaderValue},
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::accounts::limiter::{self, RateLimitAction};
use crate::accounts::repo::{list_favorite_cuisines, list_favorites};
use crate::accounts::repo_types::{Account, DietaryPreference};
use crate::error::{AccountError, AccountResult};
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "session";

/// Browsers drop `Set-Cookie` lines longer than this, keeping the old cookie.
pub const MAX_COOKIE_BYTES: usize = 4096;

/// Read-optimized projection of an account for the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub is_admin: bool,
    pub favorites: Vec<Uuid>,
    pub favorite_cuisines: Vec<String>,
    pub country: Option<String>,
    pub dietary_preference: DietaryPreference,
    pub avatar: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "time::serde::timestamp::option")]
    pub suspended_until: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "time::serde::timestamp::option")]
    pub name_changed_at: Option<OffsetDateTime>,
    pub password_attempts_remaining: i32,
    /// Set when the cookie copy omits the favorite collections to stay under
    /// [`MAX_COOKIE_BYTES`]. Readers must re-materialize before using them.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

impl SessionSnapshot {
    /// Copy without the unbounded collections.
    pub fn without_collections(&self) -> Self {
        Self {
            favorites: Vec::new(),
            favorite_cuisines: Vec::new(),
            partial: true,
            ..self.clone()
        }
    }
}

/// JWT payload: the snapshot plus registered claims.
#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    #[serde(flatten)]
    user: SessionSnapshot,
    iat: i64,
    exp: i64,
    iss: String,
    aud: String,
}

#[derive(Clone)]
pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
    ttl: Duration,
    secure: bool,
}

impl FromRef<AppState> for SessionKeys {
    fn from_ref(state: &AppState) -> Self {
        let cfg = &state.config.session;
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
            ttl: Duration::days(cfg.ttl_days),
            secure: cfg.secure_cookie,
        }
    }
}

impl SessionKeys {
    pub fn sign(&self, snapshot: &SessionSnapshot) -> anyhow::Result<String> {
        let now = OffsetDateTime::now_utc();
        let claims = SessionClaims {
            user: snapshot.clone(),
            iat: now.unix_timestamp(),
            exp: (now + self.ttl).unix_timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        debug!(user_id = %snapshot.id, "session signed");
        Ok(token)
    }

    pub fn verify(&self, token: &str) -> anyhow::Result<SessionSnapshot> {
        let mut validation = Validation::default();
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let data = decode::<SessionClaims>(token, &self.decoding, &validation)?;
        Ok(data.claims.user)
    }

    /// `Set-Cookie` value carrying `snapshot`. A snapshot too large for one
    /// cookie is stored without its collections and marked `partial`.
    pub fn install(&self, snapshot: &SessionSnapshot) -> AccountResult<HeaderValue> {
        let cookie = self.cookie(&self.sign(snapshot)?, self.ttl.whole_seconds())?;
        if cookie.len() <= MAX_COOKIE_BYTES {
            return Ok(cookie);
        }
        warn!(
            user_id = %snapshot.id,
            bytes = cookie.len(),
            "session exceeds cookie limit, storing without collections"
        );
        let cookie = self.cookie(
            &self.sign(&snapshot.without_collections())?,
            self.ttl.whole_seconds(),
        )?;
        if cookie.len() > MAX_COOKIE_BYTES {
            error!(user_id = %snapshot.id, bytes = cookie.len(), "compact session still exceeds cookie limit");
            return Err(AccountError::Unavailable(anyhow::anyhow!(
                "session cookie of {} bytes exceeds {MAX_COOKIE_BYTES}",
                cookie.len()
            )));
        }
        Ok(cookie)
    }

    /// `Set-Cookie` value that removes the session.
    pub fn destroy(&self) -> AccountResult<HeaderValue> {
        self.cookie("", 0)
    }

    fn cookie(&self, value: &str, max_age: i64) -> AccountResult<HeaderValue> {
        let secure = if self.secure { "; Secure" } else { "" };
        let raw = format!(
            "{SESSION_COOKIE}={value}; Path=/; Max-Age={max_age}; HttpOnly; SameSite=Lax{secure}"
        );
        HeaderValue::from_str(&raw)
            .map_err(|e| AccountError::Unavailable(anyhow::anyhow!("session cookie header: {e}")))
    }

    /// Snapshot from the request cookies. Missing, malformed, tampered or
    /// expired cookies all read as anonymous.
    pub fn read(&self, headers: &HeaderMap) -> Option<SessionSnapshot> {
        let token = cookie_value(headers, SESSION_COOKIE)?;
        match self.verify(token) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                debug!(error = %e, "discarding unreadable session cookie");
                None
            }
        }
    }
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, v)| *k == name && !v.is_empty())
        .map(|(_, v)| v)
}

/// Build a fresh snapshot from the store. Never reuses a previous snapshot.
pub async fn materialize(db: &PgPool, account_id: Uuid) -> AccountResult<SessionSnapshot> {
    let mut conn = db.acquire().await?;
    let account = Account::find_by_id(&mut conn, account_id)
        .await?
        .ok_or(AccountError::Unauthorized)?;
    let favorites = list_favorites(&mut conn, account_id).await?;
    let favorite_cuisines = list_favorite_cuisines(&mut conn, account_id).await?;
    let remaining = limiter::daily_remaining(
        &mut conn,
        &account_id.to_string(),
        RateLimitAction::PasswordChange,
        OffsetDateTime::now_utc().date(),
    )
    .await?;
    Ok(snapshot_of(&account, favorites, favorite_cuisines, remaining))
}

pub fn snapshot_of(
    account: &Account,
    favorites: Vec<Uuid>,
    favorite_cuisines: Vec<String>,
    password_attempts_remaining: i32,
) -> SessionSnapshot {
    SessionSnapshot {
        id: account.id,
        name: account.name.clone(),
        email: account.email.clone(),
        is_admin: account.is_admin,
        favorites,
        favorite_cuisines,
        country: account.country.clone(),
        dietary_preference: account.diet(),
        avatar: account.avatar.clone(),
        suspended_until: account.suspended_until,
        name_changed_at: account.name_changed_at,
        password_attempts_remaining,
        partial: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn keys() -> SessionKeys {
        SessionKeys::from_ref(&AppState::fake())
    }

    fn snapshot() -> SessionSnapshot {
        SessionSnapshot {
            id: Uuid::new_v4(),
            name: "Ada".into(),
            email: "ada@x.com".into(),
            is_admin: false,
            favorites: vec![Uuid::new_v4()],
            favorite_cuisines: vec!["thai".into()],
            country: Some("NZ".into()),
            dietary_preference: DietaryPreference::Vegetarian,
            avatar: "Ada".into(),
            suspended_until: None,
            name_changed_at: None,
            password_attempts_remaining: 3,
            partial: false,
        }
    }

    fn with_cookie(raw: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(raw).unwrap());
        headers
    }

    #[tokio::test]
    async fn signed_snapshot_reads_back() {
        let keys = keys();
        let snap = snapshot();
        let token = keys.sign(&snap).unwrap();
        let headers = with_cookie(&format!("theme=dark; session={token}"));
        assert_eq!(keys.read(&headers), Some(snap));
    }

    #[test]
    fn snapshot_json_is_camel_case() {
        let json = serde_json::to_value(snapshot()).unwrap();
        assert!(json.get("isAdmin").is_some());
        assert!(json.get("favoriteCuisines").is_some());
        assert_eq!(json["dietaryPreference"], "vegetarian");
        assert!(json.get("suspendedUntil").is_none());
    }

    #[tokio::test]
    async fn tampered_or_garbage_cookie_is_anonymous() {
        let keys = keys();
        let mine: Vec<String> = keys.sign(&snapshot()).unwrap().split('.').map(String::from).collect();
        let mut admin = snapshot();
        admin.is_admin = true;
        let forged: Vec<String> = keys.sign(&admin).unwrap().split('.').map(String::from).collect();
        let tampered = format!("{}.{}.{}", mine[0], forged[1], mine[2]);
        assert_eq!(keys.read(&with_cookie(&format!("session={tampered}"))), None);
        assert_eq!(keys.read(&with_cookie("session=not-a-jwt")), None);
        assert_eq!(keys.read(&with_cookie("session=")), None);
        assert_eq!(keys.read(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn other_secret_is_rejected() {
        let token = keys().sign(&snapshot()).unwrap();
        let mut state = AppState::fake();
        let mut config = (*state.config).clone();
        config.session.secret = "another".into();
        state.config = std::sync::Arc::new(config);
        let other = SessionKeys::from_ref(&state);
        assert!(other.verify(&token).is_err());
    }

    #[tokio::test]
    async fn install_sets_http_only_cookie_with_seven_day_max_age() {
        let cookie = keys().install(&snapshot()).unwrap();
        let raw = cookie.to_str().unwrap();
        assert!(raw.starts_with("session="));
        assert!(raw.contains("Path=/"));
        assert!(raw.contains("Max-Age=604800"));
        assert!(raw.contains("HttpOnly"));
        assert!(!raw.contains("Secure"));
    }

    #[tokio::test]
    async fn oversized_snapshot_is_stored_without_collections() {
        let keys = keys();
        let mut big = snapshot();
        big.favorites = (0..120).map(|_| Uuid::new_v4()).collect();
        let cookie = keys.install(&big).unwrap();
        assert!(cookie.len() <= MAX_COOKIE_BYTES);

        let raw = cookie.to_str().unwrap();
        let token = raw
            .strip_prefix("session=")
            .and_then(|rest| rest.split(';').next())
            .unwrap();
        let read = keys.verify(token).unwrap();
        assert!(read.partial);
        assert!(read.favorites.is_empty());
        assert_eq!(read.id, big.id);
        assert_eq!(read.email, big.email);
    }

    #[tokio::test]
    async fn small_snapshot_keeps_collections() {
        let keys = keys();
        let snap = snapshot();
        let raw = keys.install(&snap).unwrap();
        let token = raw
            .to_str()
            .unwrap()
            .strip_prefix("session=")
            .and_then(|rest| rest.split(';').next())
            .unwrap()
            .to_string();
        let read = keys.verify(&token).unwrap();
        assert!(!read.partial);
        assert_eq!(read, snap);
    }

    #[tokio::test]
    async fn destroy_expires_cookie() {
        let raw = keys().destroy().unwrap();
        let raw = raw.to_str().unwrap();
        assert!(raw.starts_with("session=;"));
        assert!(raw.contains("Max-Age=0"));
    }
}

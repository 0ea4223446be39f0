use std::{convert::Infallible, net::SocketAddr};

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, ConnectInfo, FromRef, FromRequest, FromRequestParts, Request},
    http::{request::Parts, HeaderMap},
    Json,
};
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use super::repo_types::Account;
use super::session::{SessionKeys, SessionSnapshot};
use crate::error::AccountError;
use crate::state::AppState;

/// JSON body whose rejections use the `{success, error}` shape.
pub struct Payload<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for Payload<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    T: Send,
    S: Send + Sync,
{
    type Rejection = AccountError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| AccountError::Validation(e.body_text()))?;
        Ok(Payload(value))
    }
}

/// Session snapshot if the request carries a valid cookie.
pub struct MaybeSession(pub Option<SessionSnapshot>);

#[async_trait]
impl<S> FromRequestParts<S> for MaybeSession
where
    S: Send + Sync,
    SessionKeys: FromRef<S>,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = SessionKeys::from_ref(state);
        Ok(MaybeSession(keys.read(&parts.headers)))
    }
}

/// Signed-in caller. The snapshot identifies the account; gateway
/// operations still re-read the store before acting.
pub struct SessionUser(pub SessionSnapshot);

#[async_trait]
impl<S> FromRequestParts<S> for SessionUser
where
    S: Send + Sync,
    SessionKeys: FromRef<S>,
{
    type Rejection = AccountError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = SessionKeys::from_ref(state);
        keys.read(&parts.headers)
            .map(SessionUser)
            .ok_or(AccountError::Unauthorized)
    }
}

/// Caller whose account is an active administrator according to the store.
pub struct AdminUser(pub Uuid);

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AccountError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let SessionUser(session) = SessionUser::from_request_parts(parts, state).await?;
        let mut conn = state.db.acquire().await?;
        let account = Account::find_by_id(&mut conn, session.id).await?;
        match account {
            Some(a) if a.is_admin && a.verified && a.suspension(OffsetDateTime::now_utc()).is_none() => {
                Ok(AdminUser(a.id))
            }
            _ => {
                warn!(user_id = %session.id, "admin route refused");
                Err(AccountError::Forbidden)
            }
        }
    }
}

/// Client address used as the key for per-IP limiters.
///
/// Forwarding headers are honoured only when `trust_proxy` is configured;
/// otherwise any caller could pick a fresh address per request.
pub struct ClientIp(pub String);

/// Whether forwarding headers come from a trusted reverse proxy.
#[derive(Debug, Clone, Copy)]
pub struct TrustProxy(pub bool);

impl FromRef<AppState> for TrustProxy {
    fn from_ref(state: &AppState) -> Self {
        TrustProxy(state.config.trust_proxy)
    }
}

pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| {
                headers
                    .get("x-real-ip")
                    .and_then(|v| v.to_str().ok())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
            });
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
    TrustProxy: FromRef<S>,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TrustProxy(trust_proxy) = TrustProxy::from_ref(state);
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(ClientIp(client_ip(&parts.headers, peer, trust_proxy)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn forwarded(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", value.parse().unwrap());
        headers
    }

    #[test]
    fn forwarded_header_ignored_without_trusted_proxy() {
        let peer = Some(SocketAddr::from(([192, 0, 2, 1], 4000)));
        let headers = forwarded("203.0.113.7");
        assert_eq!(client_ip(&headers, peer, false), "192.0.2.1");
        assert_eq!(client_ip(&forwarded("198.51.100.9"), peer, false), "192.0.2.1");
        assert_eq!(client_ip(&headers, None, false), "unknown");
    }

    #[test]
    fn trusted_proxy_uses_first_forwarded_hop() {
        let peer = Some(SocketAddr::from(([10, 0, 0, 1], 4000)));
        let headers = forwarded("203.0.113.7, 10.0.0.1");
        assert_eq!(client_ip(&headers, peer, true), "203.0.113.7");

        let mut real = HeaderMap::new();
        real.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        assert_eq!(client_ip(&real, peer, true), "198.51.100.2");
        assert_eq!(client_ip(&HeaderMap::new(), peer, true), "10.0.0.1");
    }

    #[tokio::test]
    async fn extractor_reads_trust_setting_from_state() {
        let mut req = Request::builder()
            .header("x-forwarded-for", "203.0.113.7")
            .body(())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4000))));
        let (mut parts, _) = req.into_parts();

        let mut state = AppState::fake();
        let ClientIp(ip) = ClientIp::from_request_parts(&mut parts, &state).await.unwrap();
        assert_eq!(ip, "192.0.2.1");

        let mut config = (*state.config).clone();
        config.trust_proxy = true;
        state.config = std::sync::Arc::new(config);
        let ClientIp(ip) = ClientIp::from_request_parts(&mut parts, &state).await.unwrap();
        assert_eq!(ip, "203.0.113.7");
    }

    #[tokio::test]
    async fn malformed_json_is_a_validation_error() {
        #[derive(Debug, serde::Deserialize)]
        struct Body {
            #[allow(dead_code)]
            email: String,
        }
        let req = Request::builder()
            .header("content-type", "application/json")
            .body(axum::body::Body::from("{\"email\": 5}"))
            .unwrap();
        let res = Payload::<Body>::from_request(req, &()).await;
        assert!(matches!(res, Err(AccountError::Validation(_))));
    }

    #[tokio::test]
    async fn session_user_rejects_anonymous() {
        let state = AppState::fake();
        let (mut parts, _) = Request::builder().body(()).unwrap().into_parts();
        let res = SessionUser::from_request_parts(&mut parts, &state).await;
        assert!(matches!(res, Err(AccountError::Unauthorized)));

        let MaybeSession(session) = MaybeSession::from_request_parts(&mut parts, &state)
            .await
            .unwrap();
        assert!(session.is_none());
    }
}

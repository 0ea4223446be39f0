use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_days: i64,
    /// Adds `Secure` to the session cookie. Off for plain-http local setups.
    pub secure_cookie: bool,
}

/// Administrator identity configured out-of-band.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub session: SessionConfig,
    pub admin: Option<AdminConfig>,
    pub mail: Option<MailConfig>,
    /// Take the client address from `X-Forwarded-For`/`X-Real-IP`. Only safe
    /// behind a reverse proxy that overwrites those headers.
    pub trust_proxy: bool,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let session = SessionConfig {
            secret: std::env::var("SESSION_SECRET")?,
            issuer: std::env::var("SESSION_ISSUER").unwrap_or_else(|_| "recipebox".into()),
            audience: std::env::var("SESSION_AUDIENCE").unwrap_or_else(|_| "recipebox-web".into()),
            ttl_days: std::env::var("SESSION_TTL_DAYS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(7),
            secure_cookie: std::env::var("SESSION_SECURE_COOKIE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
        };

        let admin = match (std::env::var("ADMIN_EMAIL"), std::env::var("ADMIN_PASSWORD")) {
            (Ok(email), Ok(password)) if !email.trim().is_empty() && !password.is_empty() => {
                Some(AdminConfig {
                    email: email.trim().to_lowercase(),
                    password,
                })
            }
            _ => None,
        };

        let mail = match std::env::var("MAIL_API_URL") {
            Ok(api_url) => Some(MailConfig {
                api_url,
                api_key: std::env::var("MAIL_API_KEY")?,
                from: std::env::var("MAIL_FROM").unwrap_or_else(|_| "no-reply@recipebox.app".into()),
            }),
            Err(_) => None,
        };

        let trust_proxy = std::env::var("TRUST_PROXY")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            database_url,
            session,
            admin,
            mail,
            trust_proxy,
        })
    }
}

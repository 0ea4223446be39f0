use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument};

use crate::config::MailConfig;

/// A transactional email carrying a one-time code.
#[derive(Debug, Clone)]
pub struct CodeEmail<'a> {
    pub to: &'a str,
    pub code: &'a str,
    pub subject: &'a str,
    pub preamble: &'a str,
}

impl CodeEmail<'_> {
    pub fn text(&self) -> String {
        format!(
            "{}\n\nYour code: {}\n\nThe code expires in 10 minutes. If you did not ask for it, ignore this email.",
            self.preamble, self.code
        )
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_code(&self, email: &CodeEmail<'_>) -> anyhow::Result<()>;
}

/// Sends through an HTTP email API (`POST {api_url}` with a bearer key).
#[derive(Clone)]
pub struct HttpMailer {
    client: reqwest::Client,
    config: MailConfig,
}

#[derive(Serialize)]
struct OutboundMessage<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: String,
}

impl HttpMailer {
    pub fn new(config: MailConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("build mail http client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    #[instrument(skip(self, email), fields(to = %email.to))]
    async fn send_code(&self, email: &CodeEmail<'_>) -> anyhow::Result<()> {
        let message = OutboundMessage {
            from: &self.config.from,
            to: [email.to],
            subject: email.subject,
            text: email.text(),
        };
        self.client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&message)
            .send()
            .await
            .context("mail api request")?
            .error_for_status()
            .context("mail api status")?;
        info!("verification email sent");
        Ok(())
    }
}

/// Development mailer: writes the message to the log instead of sending it.
#[derive(Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_code(&self, email: &CodeEmail<'_>) -> anyhow::Result<()> {
        info!(to = %email.to, subject = %email.subject, code = %email.code, "mail delivery disabled; logging code");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_contains_preamble_and_code() {
        let email = CodeEmail {
            to: "a@x.com",
            code: "012345",
            subject: "Verify",
            preamble: "Welcome to Recipebox!",
        };
        let text = email.text();
        assert!(text.starts_with("Welcome to Recipebox!"));
        assert!(text.contains("012345"));
    }

    #[tokio::test]
    async fn log_mailer_never_fails() {
        let email = CodeEmail {
            to: "a@x.com",
            code: "999999",
            subject: "s",
            preamble: "p",
        };
        assert!(LogMailer.send_code(&email).await.is_ok());
    }
}

//! Outbound notification mail over SMTP via lettre.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use crate::config::env_or;
use crate::error::{ConfigError, NotifyError};

/// Sends a plain-text message to one address.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// SMTP settings, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Returns `None` if `SMTP_HOST` is not set (outbound mail disabled).
    /// A set but unparsable `SMTP_PORT` is an error.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(host) = std::env::var("SMTP_HOST").ok().filter(|h| !h.trim().is_empty()) else {
            return Ok(None);
        };
        let port: u16 = env_or("SMTP_PORT", 587)?;

        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("SMTP_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("SMTP_FROM").unwrap_or_else(|_| username.clone());

        Ok(Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        }))
    }
}

/// lettre-backed sender. The blocking transport runs on the blocking pool.
pub struct SmtpMailSender {
    config: SmtpConfig,
}

impl SmtpMailSender {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

fn build_message(from: &str, to: &str, subject: &str, body: &str) -> Result<Message, NotifyError> {
    Message::builder()
        .from(from.parse().map_err(|e| NotifyError::InvalidAddress {
            address: from.to_string(),
            reason: format!("{e}"),
        })?)
        .to(to.parse().map_err(|e| NotifyError::InvalidAddress {
            address: to.to_string(),
            reason: format!("{e}"),
        })?)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| NotifyError::SendFailed(format!("Failed to build email: {e}")))
}

fn send_blocking(config: &SmtpConfig, message: &Message) -> Result<(), NotifyError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::starttls_relay(&config.host)
        .map_err(|e| NotifyError::SendFailed(format!("SMTP relay error: {e}")))?
        .port(config.port)
        .credentials(creds)
        .build();

    transport
        .send(message)
        .map_err(|e| NotifyError::SendFailed(format!("SMTP send failed: {e}")))?;
    Ok(())
}

#[async_trait]
impl MailSender for SmtpMailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        let message = build_message(&self.config.from_address, to, subject, body)?;
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || send_blocking(&config, &message))
            .await
            .map_err(|e| NotifyError::SendFailed(format!("SMTP task failed: {e}")))??;

        tracing::info!(to, "Notification email sent");
        Ok(())
    }
}

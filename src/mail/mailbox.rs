//! Mailbox access: the `Mailbox` trait and its Gmail REST implementation.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ConfigError, MailboxError};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Access tokens are refreshed this long before they expire.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// Source of unread inbound messages.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Provider IDs of up to `max` unread inbox messages.
    async fn list_unread(&self, max: u32) -> Result<Vec<String>, MailboxError>;

    /// Full RFC 822 bytes of one message.
    async fn fetch_raw(&self, id: &str) -> Result<Vec<u8>, MailboxError>;

    /// Mark messages read in one call.
    async fn mark_read(&self, ids: &[String]) -> Result<(), MailboxError>;
}

// ── Configuration ───────────────────────────────────────────────────

/// Gmail OAuth credentials, built from environment variables.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub refresh_token: SecretString,
    /// Mailbox user, `me` for the authorized account.
    pub user: String,
}

impl GmailConfig {
    /// Returns `Ok(None)` when no Gmail variable is set (sync disabled) and
    /// an error when only some of the credentials are present.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let keys = ["GMAIL_CLIENT_ID", "GMAIL_CLIENT_SECRET", "GMAIL_REFRESH_TOKEN"];
        let values: Vec<Option<String>> = keys.iter().map(|k| var(k)).collect();

        if values.iter().all(Option::is_none) {
            return Ok(None);
        }
        if let Some(pos) = values.iter().position(Option::is_none) {
            return Err(ConfigError::MissingEnvVar(keys[pos].to_string()));
        }

        let mut values = values.into_iter().flatten();
        let (Some(client_id), Some(client_secret), Some(refresh_token)) =
            (values.next(), values.next(), values.next())
        else {
            return Ok(None);
        };

        Ok(Some(Self {
            client_id,
            client_secret: SecretString::from(client_secret),
            refresh_token: SecretString::from(refresh_token),
            user: var("GMAIL_USER").unwrap_or_else(|| "me".into()),
        }))
    }
}

// ── Gmail client ────────────────────────────────────────────────────

struct CachedToken {
    value: SecretString,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Deserialize)]
struct RawMessage {
    raw: String,
}

/// Gmail REST client authenticated with an OAuth refresh token.
pub struct GmailMailbox {
    config: GmailConfig,
    client: reqwest::Client,
    api_base: String,
    token_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl GmailMailbox {
    pub fn new(config: GmailConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            api_base: GMAIL_API_BASE.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            token: Mutex::new(None),
        }
    }

    /// Builder: point at different API and token endpoints.
    pub fn with_endpoints(mut self, api_base: impl Into<String>, token_url: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.token_url = token_url.into();
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/users/{}/messages", self.api_base, self.config.user)
    }

    /// Cached access token, refreshed when missing or about to expire.
    async fn access_token(&self) -> Result<String, MailboxError> {
        let mut cached = self.token.lock().await;
        if let Some(tok) = cached.as_ref()
            && tok.expires_at > Utc::now()
        {
            return Ok(tok.value.expose_secret().to_string());
        }

        let resp = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.expose_secret()),
                ("refresh_token", self.config.refresh_token.expose_secret()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| MailboxError::Auth(format!("token refresh failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(MailboxError::Auth(format!("token refresh returned {status}: {body}")));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| MailboxError::Auth(format!("bad token response: {e}")))?;

        let lifetime = (token.expires_in - TOKEN_EXPIRY_MARGIN_SECS).max(0);
        *cached = Some(CachedToken {
            value: SecretString::from(token.access_token.clone()),
            expires_at: Utc::now() + chrono::Duration::seconds(lifetime),
        });
        debug!(expires_in = token.expires_in, "Gmail access token refreshed");
        Ok(token.access_token)
    }

    /// Map non-success statuses. Auth failures drop the cached token.
    async fn check(&self, resp: reqwest::Response, op: &str) -> Result<reqwest::Response, MailboxError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        match status.as_u16() {
            401 | 403 => {
                *self.token.lock().await = None;
                Err(MailboxError::Auth(format!("{op} returned {status}: {body}")))
            }
            429 => Err(MailboxError::RateLimited),
            _ => Err(MailboxError::Http(format!("{op} returned {status}: {body}"))),
        }
    }
}

#[async_trait]
impl Mailbox for GmailMailbox {
    async fn list_unread(&self, max: u32) -> Result<Vec<String>, MailboxError> {
        let token = self.access_token().await?;
        let resp = self
            .client
            .get(self.messages_url())
            .bearer_auth(token)
            .query(&[
                ("labelIds", "INBOX".to_string()),
                ("q", "is:unread".to_string()),
                ("maxResults", max.to_string()),
            ])
            .send()
            .await
            .map_err(|e| MailboxError::Http(format!("list messages: {e}")))?;

        let list: ListResponse = self
            .check(resp, "list messages")
            .await?
            .json()
            .await
            .map_err(|e| MailboxError::Http(format!("list messages body: {e}")))?;
        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    async fn fetch_raw(&self, id: &str) -> Result<Vec<u8>, MailboxError> {
        let token = self.access_token().await?;
        let resp = self
            .client
            .get(format!("{}/{id}", self.messages_url()))
            .bearer_auth(token)
            .query(&[("format", "raw")])
            .send()
            .await
            .map_err(|e| MailboxError::Http(format!("get message {id}: {e}")))?;

        let msg: RawMessage = self
            .check(resp, "get message")
            .await?
            .json()
            .await
            .map_err(|e| MailboxError::Http(format!("get message {id} body: {e}")))?;

        URL_SAFE_NO_PAD
            .decode(msg.raw.trim_end_matches('='))
            .map_err(|e| MailboxError::Decode {
                id: id.to_string(),
                reason: format!("base64: {e}"),
            })
    }

    async fn mark_read(&self, ids: &[String]) -> Result<(), MailboxError> {
        if ids.is_empty() {
            return Ok(());
        }
        let token = self.access_token().await?;
        let resp = self
            .client
            .post(format!("{}/batchModify", self.messages_url()))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "ids": ids,
                "removeLabelIds": ["UNREAD"],
            }))
            .send()
            .await
            .map_err(|e| MailboxError::Http(format!("batchModify: {e}")))?;
        self.check(resp, "batchModify").await?;
        debug!(count = ids.len(), "Marked messages read");
        Ok(())
    }
}

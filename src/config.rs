//! Service configuration, read from environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::mail::mailbox::GmailConfig;
use crate::mail::sync::SyncConfig;
use crate::notify::SmtpConfig;

/// Parse `key` if set, otherwise return `default`. A value that is set but
/// does not parse is an error, not a silent fallback.
pub fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            })
        }
        _ => Ok(default),
    }
}

/// Everything the binary needs to start.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    /// Rolling log directory; stdout only when unset.
    pub log_dir: Option<PathBuf>,
    /// Gmail sync is disabled when `None`.
    pub gmail: Option<GmailConfig>,
    pub sync: SyncConfig,
    /// Notification mail is disabled when `None`.
    pub smtp: Option<SmtpConfig>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("LLANOGAS_DB_PATH")
            .unwrap_or_else(|_| "./data/llanogas.db".to_string());
        let log_dir = std::env::var("LLANOGAS_LOG_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            db_path: PathBuf::from(db_path),
            http_port: env_or("LLANOGAS_HTTP_PORT", 8080)?,
            log_dir,
            gmail: GmailConfig::from_env()?,
            sync: SyncConfig::from_env()?,
            smtp: SmtpConfig::from_env()?,
        })
    }
}

//! Configuration loading from the environment.
//!
//! | variable | default |
//! |----------|---------|
//! | `DATABASE_URL` | unset (no Postgres adapters) |
//! | `PERMISSION_CACHE_TTL_SECS` | `300` |
//! | `REALTIME_TICK_MS` | `100` |
//! | `REALTIME_DOMAINS` | built-in domain presets (JSON array otherwise) |
//! | `LOG_FORMAT` | `json` |

use std::time::Duration as StdDuration;

use chrono::Duration;
use thiserror::Error;
use tracing::warn;

use stockroom_auth::DEFAULT_PERMISSION_TTL;
use stockroom_observability::LogFormat;
use stockroom_realtime::RealtimeDomainConfig;
use stockroom_realtime::config::{parse_domains, presets};

pub const DEFAULT_REALTIME_TICK: StdDuration = StdDuration::from_millis(100);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub permission_cache_ttl: Duration,
    pub realtime_tick: StdDuration,
    pub realtime_domains: Vec<RealtimeDomainConfig>,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            permission_cache_ttl: DEFAULT_PERMISSION_TTL,
            realtime_tick: DEFAULT_REALTIME_TICK,
            realtime_domains: presets(),
            log_format: LogFormat::default(),
        }
    }
}

impl Settings {
    /// Load settings from process environment variables.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup (tests, layered sources).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        settings.database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());
        if settings.database_url.is_none() {
            warn!("DATABASE_URL not set; Postgres permission source and change feed unavailable");
        }

        if let Some(raw) = lookup("PERMISSION_CACHE_TTL_SECS") {
            let secs = parse_positive("PERMISSION_CACHE_TTL_SECS", &raw)?;
            settings.permission_cache_ttl = Duration::try_seconds(secs as i64).ok_or_else(|| {
                SettingsError::Invalid {
                    key: "PERMISSION_CACHE_TTL_SECS",
                    reason: "out of range".to_string(),
                }
            })?;
        }

        if let Some(raw) = lookup("REALTIME_TICK_MS") {
            let ms = parse_positive("REALTIME_TICK_MS", &raw)?;
            settings.realtime_tick = StdDuration::from_millis(ms);
        }

        if let Some(raw) = lookup("REALTIME_DOMAINS") {
            settings.realtime_domains = parse_domains(&raw).map_err(|e| SettingsError::Invalid {
                key: "REALTIME_DOMAINS",
                reason: e.to_string(),
            })?;
        }

        if let Some(raw) = lookup("LOG_FORMAT") {
            settings.log_format = raw.parse().map_err(|e: stockroom_core::DomainError| {
                SettingsError::Invalid {
                    key: "LOG_FORMAT",
                    reason: e.to_string(),
                }
            })?;
        }

        Ok(settings)
    }

    /// Domain config by channel key.
    pub fn domain(&self, channel_key: &str) -> Option<&RealtimeDomainConfig> {
        self.realtime_domains
            .iter()
            .find(|d| d.channel_key().as_str() == channel_key)
    }
}

fn parse_positive(key: &'static str, raw: &str) -> Result<u64, SettingsError> {
    let value: u64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| SettingsError::Invalid {
        key,
        reason: e.to_string(),
    })?;
    if value == 0 {
        return Err(SettingsError::Invalid {
            key,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

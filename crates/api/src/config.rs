//! Process configuration, read once from the environment at startup.

use std::time::Duration;

use anyhow::{Context, Result};

/// Runtime settings of the `userserver` binary.
///
/// | variable | default |
/// |---|---|
/// | `ENV` | `development` |
/// | `HOST` | `localhost` |
/// | `PORT` | `3001` |
/// | `SECRET` | `secret` |
/// | `EVENT_STORE_URL` | `sqlite://events.db?mode=rwc` |
/// | `EVENT_TABLE` | `events` |
/// | `SUBSCRIBER_TIMEOUT_MS` | `5000` |
/// | `MAX_CONFLICT_RETRIES` | `3` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub env: String,
    pub host: String,
    pub port: u16,
    /// HS256 key for bearer tokens.
    pub secret: String,
    pub event_store_url: String,
    pub event_table: String,
    pub subscriber_timeout: Duration,
    pub max_conflict_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env: "development".to_string(),
            host: "localhost".to_string(),
            port: 3001,
            secret: "secret".to_string(),
            event_store_url: "sqlite://events.db?mode=rwc".to_string(),
            event_table: "events".to_string(),
            subscriber_timeout: Duration::from_millis(5000),
            max_conflict_retries: 3,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; unset keys keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let port = match lookup("PORT") {
            Some(raw) => raw.trim().parse().with_context(|| format!("PORT={raw:?} is not a port"))?,
            None => defaults.port,
        };
        let subscriber_timeout = match lookup("SUBSCRIBER_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(
                raw.trim()
                    .parse()
                    .with_context(|| format!("SUBSCRIBER_TIMEOUT_MS={raw:?} is not a number"))?,
            ),
            None => defaults.subscriber_timeout,
        };
        let max_conflict_retries = match lookup("MAX_CONFLICT_RETRIES") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("MAX_CONFLICT_RETRIES={raw:?} is not a number"))?,
            None => defaults.max_conflict_retries,
        };

        Ok(Self {
            env: lookup("ENV").unwrap_or(defaults.env),
            host: lookup("HOST").unwrap_or(defaults.host),
            port,
            secret: lookup("SECRET").unwrap_or(defaults.secret),
            event_store_url: lookup("EVENT_STORE_URL").unwrap_or(defaults.event_store_url),
            event_table: lookup("EVENT_TABLE").unwrap_or(defaults.event_table),
            subscriber_timeout,
            max_conflict_retries,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_development(&self) -> bool {
        self.env.eq_ignore_ascii_case("development")
    }
}

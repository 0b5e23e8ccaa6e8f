//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if a required var is missing or a
//! numeric var does not parse. The database URL is wrapped in
//! secrecy::SecretString to keep credentials out of logs.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::hub::HubConfig;
use crate::normalizer::NormalizerConfig;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Records kept per execution for late-joiner replay.
    pub replay_capacity: usize,
    /// Finished executions whose replay buffers stay available.
    pub retained_executions: usize,
    pub summary_max_chars: usize,
    /// Upper bound on a single record write before it is dropped.
    pub write_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// `DATABASE_URL` is optional here; commands that need the database
    /// call [`Config::require_database_url`].
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            replay_capacity: parsed_var("OBSERVATORY_REPLAY_CAPACITY", 100)?,
            retained_executions: parsed_var("OBSERVATORY_RETAINED_EXECUTIONS", 256)?,
            summary_max_chars: parsed_var(
                "OBSERVATORY_SUMMARY_MAX_CHARS",
                crate::model::DEFAULT_SUMMARY_MAX_CHARS,
            )?,
            write_timeout: Duration::from_millis(parsed_var("OBSERVATORY_WRITE_TIMEOUT_MS", 2000)?),
            heartbeat_interval: Duration::from_secs(parsed_var("OBSERVATORY_HEARTBEAT_SECS", 15)?),
        })
    }

    pub fn require_database_url(&self) -> Result<&SecretString> {
        self.database_url.as_ref().ok_or_else(|| {
            Error::Config("required environment variable DATABASE_URL is not set".to_string())
        })
    }

    pub fn hub(&self) -> HubConfig {
        HubConfig {
            replay_capacity: self.replay_capacity,
            retained_executions: self.retained_executions,
        }
    }

    /// Server-side bound for event inserts, three quarters of the write timeout
    /// so the database aborts a slow insert before the normalizer drops it.
    pub fn statement_timeout(&self) -> Duration {
        self.write_timeout * 3 / 4
    }

    pub fn normalizer(&self) -> NormalizerConfig {
        NormalizerConfig {
            summary_max_chars: self.summary_max_chars,
            write_timeout: self.write_timeout,
        }
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{name} is not a valid number: {raw}"))),
        Err(_) => Ok(default),
    }
}

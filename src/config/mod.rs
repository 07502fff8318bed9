//! Typed configuration from environment variables.
//!
//! Loads once at startup. Every variable is optional; values that are set
//! but cannot be parsed fail fast.

use crate::engine::{DEFAULT_NEEDLE_PERMITS, EngineConfig, Threads};
use crate::error::{Error, Result};
use std::str::FromStr;

#[derive(Debug)]
pub struct Config {
    pub engine: EngineConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Meaning | Default |
    /// |---|---|---|
    /// | `THREADLE_THREADS` | <0 unbounded, 0 direct, >0 fixed | -1 |
    /// | `THREADLE_DAEMON` | daemon pool threads | false |
    /// | `THREADLE_RETRIES` | default retry budget | 0 |
    /// | `THREADLE_MAX_QUEUED` | admission ceiling | unbounded |
    /// | `THREADLE_NEEDLE_PERMITS` | default needle permits | 2147483647 |
    /// | `OTEL_ENDPOINT` | OTLP collector endpoint | none |
    /// | `LOG_LEVEL` | default tracing filter | info |
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let threads = optional_var::<i64>("THREADLE_THREADS")?
            .map(Threads::from)
            .unwrap_or_default();

        Ok(Self {
            engine: EngineConfig {
                threads,
                daemon: optional_var("THREADLE_DAEMON")?.unwrap_or(false),
                retries: optional_var("THREADLE_RETRIES")?.unwrap_or(0),
                max_queued: optional_var("THREADLE_MAX_QUEUED")?.unwrap_or(usize::MAX),
                needle_permits: optional_var("THREADLE_NEEDLE_PERMITS")?
                    .unwrap_or(DEFAULT_NEEDLE_PERMITS),
            },
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn optional_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value for {name} ({raw:?}): {e}"))),
        Err(_) => Ok(None),
    }
}

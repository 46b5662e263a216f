//! Service configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use event_channel::PublisherConfig;
use saga::ListenerConfig;
use stock::LockConfig;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

/// Service configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` / `PORT`: bind address (default: `"0.0.0.0"` / `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `DATABASE_URL`: PostgreSQL backends when set, in-memory otherwise
/// - `LOCK_WAIT_MS` / `LOCK_LEASE_MS`: product lock budgets (default: `3000`)
/// - `SWEEP_INTERVAL_SECS`: lifecycle sweep period (default: `86400`)
/// - `LISTENER_POLL_MS`: listener poll period (default: `500`)
/// - `RECONCILE_INTERVAL_SECS`: reconciliation period (default: `300`)
/// - `OUTBOX_FLUSH_MS`: outbox re-publish period (default: `1000`)
/// - `PUBLISH_MAX_ATTEMPTS` / `PUBLISH_TIMEOUT_MS`: publish retry (default: `3` / `2000`)
/// - `CHANNEL_PARTITIONS`: partitions per topic (default: `8`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub lock: LockConfig,
    pub sweep_interval: Duration,
    pub listener: ListenerConfig,
    pub reconcile_interval: Duration,
    pub outbox_flush_interval: Duration,
    pub publisher: PublisherConfig,
    pub channel_partitions: u32,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`, which returns a variable's value
    /// if it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let parse = |name: &'static str| -> Result<Option<u64>, ConfigError> {
            lookup(name)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .map_err(|_| ConfigError::Invalid { name, value })
                })
                .transpose()
        };
        let millis = |name, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse(name)?.map(Duration::from_millis).unwrap_or(default))
        };
        let secs = |name, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse(name)?.map(Duration::from_secs).unwrap_or(default))
        };

        let port = match lookup("PORT") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { name: "PORT", value })?,
            None => defaults.port,
        };
        let log_format = match lookup("LOG_FORMAT") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "LOG_FORMAT",
                value,
            })?,
            None => defaults.log_format,
        };
        let max_attempts = parse("PUBLISH_MAX_ATTEMPTS")?
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX).max(1))
            .unwrap_or(defaults.publisher.max_attempts);
        let channel_partitions = parse("CHANNEL_PARTITIONS")?
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX).max(1))
            .unwrap_or(defaults.channel_partitions);

        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port,
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format,
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            lock: LockConfig {
                wait: millis("LOCK_WAIT_MS", defaults.lock.wait)?,
                lease: millis("LOCK_LEASE_MS", defaults.lock.lease)?,
            },
            sweep_interval: secs("SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            listener: ListenerConfig {
                poll_interval: millis("LISTENER_POLL_MS", defaults.listener.poll_interval)?,
                ..defaults.listener
            },
            reconcile_interval: secs("RECONCILE_INTERVAL_SECS", defaults.reconcile_interval)?,
            outbox_flush_interval: millis("OUTBOX_FLUSH_MS", defaults.outbox_flush_interval)?,
            publisher: PublisherConfig {
                max_attempts,
                ack_timeout: millis("PUBLISH_TIMEOUT_MS", defaults.publisher.ack_timeout)?,
                ..defaults.publisher
            },
            channel_partitions,
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            lock: LockConfig::default(),
            sweep_interval: Duration::from_secs(86_400),
            listener: ListenerConfig::default(),
            reconcile_interval: Duration::from_secs(300),
            outbox_flush_interval: Duration::from_millis(1000),
            publisher: PublisherConfig::default(),
            channel_partitions: 8,
        }
    }
}

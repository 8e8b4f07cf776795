use std::str::FromStr;
use std::time::Duration;

use voxweave_events::BroadcasterConfig;
use voxweave_pipeline::SchedulerConfig;

/// A configuration variable that is set but cannot be parsed.
#[derive(Debug, thiserror::Error)]
#[error("{key} has invalid value {value:?}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

/// Log output format selected with `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected `pretty` or `json`, got `{other}`")),
        }
    }
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Bound on post-shutdown cleanup in seconds (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// Base URL of the synthesis engine.
    pub engine_url: String,
    /// Per-call engine timeout in seconds (default: `120`).
    pub engine_timeout_secs: u64,
    /// Observer heartbeat period in seconds (default: `30`).
    pub heartbeat_interval_secs: u64,
    /// Observer idle eviction threshold in seconds (default: `300`).
    pub idle_timeout_secs: u64,
    /// Delay before a systemic retry in seconds (default: `5`).
    pub retry_backoff_secs: u64,
    pub log_format: LogFormat,
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn parse_var<T>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let value = var_or(key, default);
    value.trim().parse().map_err(|e: T::Err| ConfigError {
        key,
        reason: e.to_string(),
        value,
    })
}

/// Like [`parse_var`] for a duration in seconds that must be positive.
fn parse_nonzero_secs(key: &'static str, default: &str) -> Result<u64, ConfigError> {
    let secs: u64 = parse_var(key, default)?;
    if secs == 0 {
        return Err(ConfigError {
            key,
            value: secs.to_string(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(secs)
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// `ENGINE_TIMEOUT_SECS`, `HEARTBEAT_INTERVAL_SECS` and
    /// `IDLE_TIMEOUT_SECS` must be greater than zero.
    ///
    /// | Env Var                   | Default                 |
    /// |---------------------------|-------------------------|
    /// | `HOST`                    | `0.0.0.0`               |
    /// | `PORT`                    | `3000`                  |
    /// | `CORS_ORIGINS`            | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`    | `30`                    |
    /// | `SHUTDOWN_TIMEOUT_SECS`   | `30`                    |
    /// | `ENGINE_URL`              | `http://localhost:8001` |
    /// | `ENGINE_TIMEOUT_SECS`     | `120`                   |
    /// | `HEARTBEAT_INTERVAL_SECS` | `30`                    |
    /// | `IDLE_TIMEOUT_SECS`       | `300`                   |
    /// | `RETRY_BACKOFF_SECS`      | `5`                     |
    /// | `LOG_FORMAT`              | `pretty`                |
    pub fn from_env() -> Result<Self, ConfigError> {
        let cors_origins: Vec<String> = var_or("CORS_ORIGINS", "http://localhost:5173")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            host: var_or("HOST", "0.0.0.0"),
            port: parse_var("PORT", "3000")?,
            cors_origins,
            request_timeout_secs: parse_var("REQUEST_TIMEOUT_SECS", "30")?,
            shutdown_timeout_secs: parse_var("SHUTDOWN_TIMEOUT_SECS", "30")?,
            engine_url: var_or("ENGINE_URL", "http://localhost:8001"),
            engine_timeout_secs: parse_nonzero_secs("ENGINE_TIMEOUT_SECS", "120")?,
            heartbeat_interval_secs: parse_nonzero_secs("HEARTBEAT_INTERVAL_SECS", "30")?,
            idle_timeout_secs: parse_nonzero_secs("IDLE_TIMEOUT_SECS", "300")?,
            retry_backoff_secs: parse_var("RETRY_BACKOFF_SECS", "5")?,
            log_format: parse_var("LOG_FORMAT", "pretty")?,
        })
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    pub fn broadcaster_config(&self) -> BroadcasterConfig {
        BroadcasterConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            ..BroadcasterConfig::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
            engine_timeout: self.engine_timeout(),
            ..SchedulerConfig::default()
        }
    }
}

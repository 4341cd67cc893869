//! Client configuration from environment variables.

use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::connection::ReconnectConfig;

pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid server url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("server url must use ws or wss, got {0:?}")]
    UnsupportedScheme(String),
    #[error("invalid value for {var}: {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

/// Settings for the real-time connection and its timers.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// WebSocket endpoint speaking STOMP. Always a valid ws/wss url when
    /// built through [`ChatConfig::for_server`] or [`ChatConfig::from_env`].
    pub server_url: String,
    pub health_check_interval: Duration,
    pub connect_timeout: Duration,
    pub typing_idle_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_WS_URL.to_string(),
            health_check_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            typing_idle_timeout: Duration::from_millis(3000),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ChatConfig {
    /// Build a config for the given server, keeping default timers.
    pub fn for_server(url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            server_url: parse_server_url(url)?,
            ..Self::default()
        })
    }

    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PARLEY_WS_URL`: STOMP WebSocket endpoint (default: "ws://localhost:8080/ws")
    /// - `PARLEY_HEALTH_CHECK_SECS`: ping period (default: 30)
    /// - `PARLEY_CONNECT_TIMEOUT_SECS`: handshake timeout (default: 10)
    /// - `PARLEY_TYPING_IDLE_MS`: idle window before stop-typing (default: 3000)
    /// - `PARLEY_RECONNECT_DELAY_MS`: fixed delay between reconnect attempts (default: 5000)
    /// - `PARLEY_MAX_RECONNECT_ATTEMPTS`: attempts before giving up (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let server_url = match lookup("PARLEY_WS_URL") {
            Some(raw) => parse_server_url(&raw)?,
            None => defaults.server_url,
        };

        let number = |var: &'static str, default: u64| -> Result<u64, ConfigError> {
            match lookup(var) {
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidNumber { var, value }),
                None => Ok(default),
            }
        };

        let health = number("PARLEY_HEALTH_CHECK_SECS", defaults.health_check_interval.as_secs())?;
        let connect = number("PARLEY_CONNECT_TIMEOUT_SECS", defaults.connect_timeout.as_secs())?;
        let typing = number(
            "PARLEY_TYPING_IDLE_MS",
            defaults.typing_idle_timeout.as_millis() as u64,
        )?;
        let delay = number(
            "PARLEY_RECONNECT_DELAY_MS",
            defaults.reconnect.delay.as_millis() as u64,
        )?;
        let attempts = number(
            "PARLEY_MAX_RECONNECT_ATTEMPTS",
            u64::from(defaults.reconnect.max_attempts),
        )?;

        Ok(Self {
            server_url,
            health_check_interval: Duration::from_secs(health),
            connect_timeout: Duration::from_secs(connect),
            typing_idle_timeout: Duration::from_millis(typing),
            reconnect: ReconnectConfig {
                max_attempts: u32::try_from(attempts).map_err(|_| ConfigError::InvalidNumber {
                    var: "PARLEY_MAX_RECONNECT_ATTEMPTS",
                    value: attempts.to_string(),
                })?,
                delay: Duration::from_millis(delay),
            },
        })
    }

    /// Value for the STOMP `host` header.
    pub fn host(&self) -> String {
        Url::parse(&self.server_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string())
    }
}

fn parse_server_url(raw: &str) -> Result<String, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|source| ConfigError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url.to_string()),
        other => Err(ConfigError::UnsupportedScheme(other.to_string())),
    }
}

//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (PARLEY_HOST, PARLEY_PORT, PARLEY_COOKIE_SECRET)
//! - TOML configuration file

use anyhow::{Context, Result};
use parley_core::{BufferConfig, DEFAULT_CACHE_CAPACITY};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Message buffer configuration.
    #[serde(default)]
    pub buffer: BufferSection,

    /// Request limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Long-poll configuration.
    #[serde(default)]
    pub longpoll: LongPollConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Session cookie configuration.
    #[serde(default)]
    pub session: SessionConfig,
}

/// Message buffer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSection {
    /// Number of recent messages kept for cursor replay.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

/// Request limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum message body length in bytes.
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
}

/// Long-poll configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LongPollConfig {
    /// How long an update request may stay parked, in milliseconds.
    /// Zero waits until a message arrives or the client goes away.
    #[serde(default)]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Session cookie configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Secret used to sign session cookies, at least 32 bytes.
    /// When unset, a random key is generated at startup.
    #[serde(default = "default_cookie_secret")]
    pub cookie_secret: Option<String>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("cookie_secret", &self.cookie_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// Default value functions
fn default_host() -> String {
    std::env::var("PARLEY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("PARLEY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8888)
}

fn default_cookie_secret() -> Option<String> {
    std::env::var("PARLEY_COOKIE_SECRET").ok()
}

fn default_true() -> bool {
    true
}

fn default_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_max_message_length() -> usize {
    4 * 1024
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            buffer: BufferSection::default(),
            limits: LimitsConfig::default(),
            longpoll: LongPollConfig::default(),
            metrics: MetricsConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_secret: default_cookie_secret(),
        }
    }
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_length: default_max_message_length(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl LongPollConfig {
    /// Get the long-poll timeout, if one is configured.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "parley.toml",
            "/etc/parley/parley.toml",
            "~/.config/parley/parley.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Build the message buffer configuration.
    #[must_use]
    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            capacity: self.buffer.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.buffer.capacity, 200);
        assert_eq!(config.limits.max_message_length, 4096);
        assert!(config.longpoll.timeout().is_none());
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 8888,
            ..Config::default()
        };
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8888);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [buffer]
            capacity = 50

            [longpoll]
            timeout_ms = 30000

            [session]
            cookie_secret = "0123456789abcdef0123456789abcdef"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.buffer_config().capacity, 50);
        assert_eq!(config.longpoll.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.limits.max_message_length, 4096);
        assert_eq!(
            config.session.cookie_secret.as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
        assert!(!format!("{:?}", config.session).contains("0123456789"));
    }
}

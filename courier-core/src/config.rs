use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Error;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Real-time stream (WebSocket broker) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Interval between heartbeat pings, in seconds
    pub ping_period_seconds: u64,

    /// Maximum time to wait for a pong or a write flush, in seconds.
    /// Must be shorter than the ping period so cycles never overlap.
    pub write_wait_seconds: u64,

    /// Interval between "last used" reconciliation passes, in seconds.
    /// Coarse bookkeeping, so much longer than the heartbeat.
    pub reconcile_period_seconds: u64,

    /// Regex patterns for allowed WebSocket origins, matched against
    /// the lowercased origin host and against host:port.
    /// Empty means same-origin connections only.
    pub allowed_origins: Vec<String>,

    /// Per-connection outbound queue capacity. A connection whose queue
    /// is full when a message arrives is evicted as a slow consumer.
    pub queue_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ping_period_seconds: 45,
            write_wait_seconds: 15,
            reconcile_period_seconds: 300,
            allowed_origins: Vec::new(),
            queue_capacity: 64,
        }
    }
}

impl StreamConfig {
    /// Validate the stream configuration, failing fast on anything the
    /// broker could not run consistently with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.ping_period_seconds == 0 {
            return Err(Error::Configuration(
                "stream.ping_period_seconds must be greater than zero".to_string(),
            ));
        }
        if self.write_wait_seconds == 0 {
            return Err(Error::Configuration(
                "stream.write_wait_seconds must be greater than zero".to_string(),
            ));
        }
        if self.write_wait_seconds >= self.ping_period_seconds {
            return Err(Error::Configuration(format!(
                "stream.write_wait_seconds ({}) must be shorter than stream.ping_period_seconds ({})",
                self.write_wait_seconds, self.ping_period_seconds
            )));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Configuration(
                "stream.queue_capacity must be greater than zero".to_string(),
            ));
        }
        for pattern in &self.allowed_origins {
            Regex::new(pattern).map_err(|e| {
                Error::Configuration(format!("invalid allowed origin pattern {pattern:?}: {e}"))
            })?;
        }
        Ok(())
    }

    #[must_use]
    pub const fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_seconds)
    }

    #[must_use]
    pub const fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_seconds)
    }

    #[must_use]
    pub const fn reconcile_period(&self) -> Duration {
        Duration::from_secs(self.reconcile_period_seconds)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (COURIER_SERVER_HOST, etc.)
        builder = builder.add_source(
            Environment::with_prefix("COURIER")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP listen address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.stream.ping_period_seconds, 45);
        assert_eq!(config.stream.write_wait_seconds, 15);
        assert_eq!(config.stream.reconcile_period_seconds, 300);
        assert!(config.stream.allowed_origins.is_empty());
        assert!(config.stream.validate().is_ok());
    }

    #[test]
    fn test_from_env() {
        // No config file: env vars override defaults, so only the
        // invariants that survive any environment are asserted.
        let config = Config::from_env().unwrap_or_else(|_| Config::default());

        assert!(!config.server.host.is_empty());
        assert!(config.server.port > 0);
        assert!(config.stream.ping_period_seconds > 0);
    }

    #[test]
    fn test_http_address() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8008,
            },
            ..Config::default()
        };

        assert_eq!(config.http_address(), "127.0.0.1:8008");
    }

    #[test]
    fn test_validate_rejects_write_wait_not_below_ping_period() {
        let stream = StreamConfig {
            ping_period_seconds: 10,
            write_wait_seconds: 10,
            ..StreamConfig::default()
        };
        assert!(stream.validate().is_err());

        let stream = StreamConfig {
            ping_period_seconds: 10,
            write_wait_seconds: 30,
            ..StreamConfig::default()
        };
        assert!(stream.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let stream = StreamConfig {
            ping_period_seconds: 0,
            ..StreamConfig::default()
        };
        assert!(stream.validate().is_err());

        let stream = StreamConfig {
            queue_capacity: 0,
            ..StreamConfig::default()
        };
        assert!(stream.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_origin_pattern() {
        let stream = StreamConfig {
            allowed_origins: vec!["[unclosed".to_string()],
            ..StreamConfig::default()
        };
        let err = stream.validate().expect_err("pattern must be rejected");
        assert!(err.to_string().contains("allowed origin"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("create temp config");
        writeln!(
            file,
            "server:\n  port: 9090\nstream:\n  ping_period_seconds: 30\n  write_wait_seconds: 5\n  allowed_origins:\n    - \"example\\\\.com\""
        )
        .expect("write temp config");

        let config = Config::from_file(file.path().to_str().expect("utf-8 path"))
            .expect("load config file");

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.stream.ping_period_seconds, 30);
        assert_eq!(config.stream.write_wait_seconds, 5);
        assert_eq!(config.stream.allowed_origins, vec!["example\\.com"]);
        assert!(config.stream.validate().is_ok());
    }
}

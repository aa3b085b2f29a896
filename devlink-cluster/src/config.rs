use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::logging;

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Id of this server instance, used in topic names and routing headers
    pub server_id: String,
    pub redis: RedisConfig,
    /// Capacity of each reply waiter's buffer
    pub reply_buffer_capacity: usize,
    /// Per-topic capacity of the in-process bus
    pub local_bus_capacity: usize,
    /// How long a remote state check waits before answering empty
    pub state_check_timeout_seconds: u64,
    pub logging: LoggingConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server_id: format!("node_{}", nanoid::nanoid!(8)),
            redis: RedisConfig::default(),
            reply_buffer_capacity: 256,
            local_bus_capacity: 1024,
            state_check_timeout_seconds: 5,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty means single-node mode on the in-process bus
    pub url: String,
    pub operation_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            operation_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// One of [`logging::LOG_FORMATS`]
    pub format: String,
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

impl BrokerConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> std::result::Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // DEVLINK_SERVER_ID, DEVLINK_REDIS__URL, ...
        builder = builder.add_source(
            Environment::with_prefix("DEVLINK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Reject settings the broker cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.server_id.trim().is_empty() {
            return Err(Error::Configuration("server_id must not be empty".to_string()));
        }
        if self.reply_buffer_capacity == 0 {
            return Err(Error::Configuration(
                "reply_buffer_capacity must be greater than zero".to_string(),
            ));
        }
        if self.local_bus_capacity == 0 {
            return Err(Error::Configuration(
                "local_bus_capacity must be greater than zero".to_string(),
            ));
        }
        logging::parse_log_level(&self.logging.level)?;
        logging::parse_log_format(&self.logging.format)?;
        Ok(())
    }

    /// Install the process-wide log subscriber described by `logging`
    ///
    /// Call once at startup, before [`DeviceOperationBroker::connect`].
    ///
    /// [`DeviceOperationBroker::connect`]: crate::DeviceOperationBroker::connect
    pub fn init_logging(&self) -> Result<()> {
        logging::init_logging(&self.logging)
    }

    #[must_use]
    pub const fn state_check_timeout(&self) -> Duration {
        Duration::from_secs(self.state_check_timeout_seconds)
    }

    /// Whether the broker should run over Redis rather than the in-process bus
    #[must_use]
    pub fn redis_enabled(&self) -> bool {
        !self.redis.url.is_empty()
    }

    /// Config with a fixed server id and defaults for everything else
    #[must_use]
    pub fn for_server(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();

        assert!(config.server_id.starts_with("node_"));
        assert!(!config.redis_enabled());
        assert_eq!(config.reply_buffer_capacity, 256);
        assert_eq!(config.state_check_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BrokerConfig::for_server("  ");
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.server_id = "node-a".to_string();
        config.reply_buffer_capacity = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.reply_buffer_capacity = 8;
        config.local_bus_capacity = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.local_bus_capacity = 8;
        config.logging.level = "chatty".to_string();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.logging.level = "debug".to_string();
        config.logging.format = "xml".to_string();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
server_id = "gateway-1"
reply_buffer_capacity = 16
state_check_timeout_seconds = 2

[redis]
url = "redis://127.0.0.1:6379"

[logging]
level = "debug"
format = "json"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = BrokerConfig::load(Some(&path)).unwrap();

        assert_eq!(config.server_id, "gateway-1");
        assert_eq!(config.reply_buffer_capacity, 16);
        assert_eq!(config.state_check_timeout(), Duration::from_secs(2));
        assert!(config.redis_enabled());
        assert_eq!(config.redis.operation_timeout_seconds, 5);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.local_bus_capacity, 1024);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = BrokerConfig::load(Some("/nonexistent/devlink.toml")).unwrap();
        assert_eq!(config.reply_buffer_capacity, 256);
    }
}

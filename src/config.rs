//! Relay configuration using Figment.
//!
//! Configuration is layered, highest precedence last:
//! 1. Built-in defaults
//! 2. A TOML file (`daq-relay.toml` unless another path is given)
//! 3. Environment variables prefixed with `DAQ_RELAY_`, nested keys split on `__`
//!
//! ```text
//! DAQ_RELAY_LOGGING__LEVEL=debug
//! DAQ_RELAY_PROXY__IN_PORT=5577
//! DAQ_RELAY_REMOTE__ENGINE_ID=6f1c...
//! ```
//!
//! # Example
//!
//! ```no_run
//! use daq_relay::config::RelayConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = RelayConfig::load()?;
//!     println!("Log level: {}", config.logging.level);
//!     Ok(())
//! }
//! ```

use crate::distribution::wire::{OriginFilter, RelayAddress};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Config file read when no other path is given.
pub const DEFAULT_CONFIG_FILE: &str = "daq-relay.toml";
/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "DAQ_RELAY_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be parsed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Values parsed but are out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level relay configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Log level and format.
    pub logging: LoggingConfig,
    /// Proxy bind settings.
    pub proxy: ProxyConfig,
    /// Publisher endpoint and queueing.
    pub publisher: PublisherConfig,
    /// Remote dispatcher endpoint and filter.
    pub remote: RemoteConfig,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error. `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Proxy bind settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Interface to bind both ports on
    pub host: String,
    /// Collection port; unset picks a free port
    pub in_port: Option<u16>,
    /// Broadcast port; unset picks a free port
    pub out_port: Option<u16>,
    /// Records held per lagging subscriber before they are dropped
    pub broadcast_capacity: usize,
    /// Longest record accepted from a publisher; longer lines are dropped
    pub max_frame_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            in_port: None,
            out_port: None,
            broadcast_capacity: crate::distribution::proxy::DEFAULT_BROADCAST_CAPACITY,
            max_frame_bytes: crate::distribution::wire::MAX_RECORD_BYTES,
        }
    }
}

/// Publisher endpoint and queueing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Proxy collection endpoint, `host:port`
    pub address: Option<String>,
    /// Records queued while the relay is unreachable
    pub queue_capacity: usize,
    /// Delay between reconnect attempts
    pub reconnect_interval_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            address: None,
            queue_capacity: crate::distribution::publisher::DEFAULT_QUEUE_CAPACITY,
            reconnect_interval_ms: 500,
        }
    }
}

/// Remote dispatcher endpoint and origin filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Proxy broadcast endpoint, `host:port`
    pub address: Option<String>,
    /// Only accept records from this host
    pub hostname: Option<String>,
    /// Only accept records from this process id
    pub pid: Option<u32>,
    /// Only accept records from this engine
    pub engine_id: Option<String>,
}

impl RemoteConfig {
    /// Origin filter built from the set fields.
    pub fn filter(&self) -> OriginFilter {
        OriginFilter {
            hostname: self.hostname.clone(),
            pid: self.pid,
            engine_id: self.engine_id.clone(),
        }
    }
}

impl RelayConfig {
    /// Load from `daq-relay.toml` (if present) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific file path. A missing file leaves the defaults in
    /// place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(RelayConfig::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.proxy.broadcast_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "proxy.broadcast_capacity must be > 0".to_string(),
            ));
        }
        if self.proxy.max_frame_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "proxy.max_frame_bytes must be > 0".to_string(),
            ));
        }
        if self.publisher.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "publisher.queue_capacity must be > 0".to_string(),
            ));
        }
        if self.publisher.reconnect_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "publisher.reconnect_interval_ms must be > 0".to_string(),
            ));
        }

        for (section, address) in [
            ("publisher", &self.publisher.address),
            ("remote", &self.remote.address),
        ] {
            if let Some(address) = address {
                address.parse::<RelayAddress>().map_err(|_| {
                    ConfigError::ValidationError(format!(
                        "{section}.address '{address}' is not a valid host:port"
                    ))
                })?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.proxy.host, "0.0.0.0");
        assert!(config.proxy.in_port.is_none());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[logging]
level = "debug"

[proxy]
in_port = 5577
out_port = 5578

[remote]
address = "relay.local:5578"
engine_id = "abc"
"#
        )
        .unwrap();

        let config = RelayConfig::load_from(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.proxy.in_port, Some(5577));
        assert_eq!(config.proxy.broadcast_capacity, 1024);
        assert_eq!(config.proxy.max_frame_bytes, 1 << 20);
        assert_eq!(config.remote.filter(), OriginFilter::any().engine("abc"));
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("relay.toml", "[logging]\nlevel = \"warn\"\n")?;
            jail.set_env("DAQ_RELAY_LOGGING__LEVEL", "trace");
            jail.set_env("DAQ_RELAY_PROXY__OUT_PORT", "6000");

            let config = RelayConfig::load_from("relay.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.logging.level, "trace");
            assert_eq!(config.proxy.out_port, Some(6000));
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RelayConfig::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.publisher.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.proxy.max_frame_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.remote.address = Some("no-port".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("remote.address"));
    }
}

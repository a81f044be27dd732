//! Configuration file
//!
//! Loaded from TOML, layered as: command line flags > config file >
//! defaults. Durations are plain integers with the unit in the key name.
//!
//! ```toml
//! database = "tether.db"
//! server_url = "ws://127.0.0.1:8765"
//! log_level = "info"
//!
//! [client]
//! platform = "tether"
//! auto_reconnect = true
//!
//! [client.reconnect]
//! initial_ms = 1000
//! max_ms = 60000
//! multiplier = 2.0
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::client::{Backoff, ClientConfig, KeepAlive};
use crate::pairing::QrTimeouts;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Everything the demo binary reads from its config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite store file
    pub database: PathBuf,
    /// WebSocket URL of the service
    pub server_url: String,
    /// Hex-encoded service static key to pin
    pub server_key: Option<String>,
    /// Default filter when `RUST_LOG` is not set
    pub log_level: String,
    pub client: ClientSection,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: PathBuf::from("tether.db"),
            server_url: "ws://127.0.0.1:8765".to_string(),
            server_key: None,
            log_level: "info".to_string(),
            client: ClientSection::default(),
        }
    }
}

/// `[client]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub platform: String,
    pub auto_reconnect: bool,
    pub iq_timeout_secs: u64,
    pub reconnect: ReconnectSection,
    pub keepalive: KeepAliveSection,
    pub qr: QrSection,
}

impl Default for ClientSection {
    fn default() -> Self {
        ClientSection {
            platform: "tether".to_string(),
            auto_reconnect: true,
            iq_timeout_secs: 75,
            reconnect: ReconnectSection::default(),
            keepalive: KeepAliveSection::default(),
            qr: QrSection::default(),
        }
    }
}

/// `[client.reconnect]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        ReconnectSection {
            initial_ms: 1_000,
            max_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

/// `[client.keepalive]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveSection {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub max_failure_secs: u64,
}

impl Default for KeepAliveSection {
    fn default() -> Self {
        KeepAliveSection {
            interval_secs: 25,
            timeout_secs: 20,
            max_failure_secs: 180,
        }
    }
}

/// `[client.qr]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QrSection {
    pub first_secs: u64,
    pub next_secs: u64,
}

impl Default for QrSection {
    fn default() -> Self {
        QrSection {
            first_secs: 60,
            next_secs: 20,
        }
    }
}

impl Config {
    /// Parse a config from TOML text
    pub fn from_toml(text: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file
    ///
    /// An explicit `path` must exist. Without one the default location is
    /// used if present, otherwise the defaults.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Config::default()),
            },
        };

        debug!(target: "tether::config", "loading {}", path.display());
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// `<config dir>/tether/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tether").join("config.toml"))
    }

    fn validate(&self) -> ConfigResult<()> {
        let reconnect = &self.client.reconnect;
        if reconnect.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "reconnect multiplier {} is below 1",
                reconnect.multiplier
            )));
        }
        if reconnect.initial_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect initial_ms is zero".to_string(),
            ));
        }
        if reconnect.initial_ms > reconnect.max_ms {
            return Err(ConfigError::Invalid(
                "reconnect initial_ms exceeds max_ms".to_string(),
            ));
        }
        if self.client.keepalive.interval_secs == 0 {
            return Err(ConfigError::Invalid("keepalive interval is zero".to_string()));
        }
        if self.client.keepalive.timeout_secs == 0 {
            return Err(ConfigError::Invalid("keepalive timeout is zero".to_string()));
        }
        if self.client.iq_timeout_secs == 0 {
            return Err(ConfigError::Invalid("iq_timeout_secs is zero".to_string()));
        }
        self.pinned_key()?;
        Ok(())
    }

    fn pinned_key(&self) -> ConfigResult<Option<[u8; 32]>> {
        let Some(key) = &self.server_key else {
            return Ok(None);
        };
        let bytes = hex::decode(key)
            .map_err(|e| ConfigError::Invalid(format!("server_key: {}", e)))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ConfigError::Invalid("server_key must be 32 bytes".to_string()))?;
        Ok(Some(key))
    }

    /// Settings for [`crate::Client`]
    pub fn client_config(&self) -> ConfigResult<ClientConfig> {
        let section = &self.client;
        Ok(ClientConfig {
            platform: section.platform.clone(),
            server_key: self.pinned_key()?,
            auto_reconnect: section.auto_reconnect,
            backoff: Backoff {
                initial: Duration::from_millis(section.reconnect.initial_ms),
                max: Duration::from_millis(section.reconnect.max_ms),
                multiplier: section.reconnect.multiplier,
            },
            keepalive: KeepAlive {
                interval: Duration::from_secs(section.keepalive.interval_secs),
                timeout: Duration::from_secs(section.keepalive.timeout_secs),
                max_failure: Duration::from_secs(section.keepalive.max_failure_secs),
            },
            iq_timeout: Duration::from_secs(section.iq_timeout_secs),
            qr_timeouts: QrTimeouts {
                first: Duration::from_secs(section.qr.first_secs),
                next: Duration::from_secs(section.qr.next_secs),
            },
            ..ClientConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.database, PathBuf::from("tether.db"));

        let client = config.client_config().unwrap();
        assert_eq!(client.qr_timeouts, QrTimeouts::default());
        assert_eq!(client.backoff, Backoff::default());
        assert!(client.server_key.is_none());
    }

    #[test]
    fn test_partial_tables() {
        let config = Config::from_toml(
            r#"
            server_url = "ws://example.test:9000"
            server_key = "0101010101010101010101010101010101010101010101010101010101010101"

            [client.reconnect]
            initial_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.server_url, "ws://example.test:9000");
        assert_eq!(config.log_level, "info");

        let client = config.client_config().unwrap();
        assert_eq!(client.backoff.initial, Duration::from_millis(50));
        assert_eq!(client.backoff.max, Duration::from_secs(60));
        assert_eq!(client.server_key, Some([1u8; 32]));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Config::from_toml("[client.reconnect]\nmultiplier = 0.5"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("server_key = \"abcd\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("database = 5"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_zero_timings_rejected() {
        for text in [
            "[client.reconnect]\ninitial_ms = 0",
            "[client.keepalive]\ntimeout_secs = 0",
            "[client.keepalive]\ninterval_secs = 0",
            "[client]\niq_timeout_secs = 0",
        ] {
            match Config::from_toml(text) {
                Err(ConfigError::Invalid(message)) => assert!(message.contains("zero"), "{}", message),
                other => panic!("{:?} accepted: {:?}", text, other.map(|_| ())),
            }
        }
        let config = Config::from_toml("[client.reconnect]\ninitial_ms = 1").unwrap();
        assert_eq!(
            config.client_config().unwrap().backoff.delay(0),
            Duration::from_millis(1)
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "database = \"other.db\"\nlog_level = \"debug\"").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.database, PathBuf::from("other.db"));
        assert_eq!(config.log_level, "debug");

        let missing = file.path().with_extension("missing");
        assert!(matches!(
            Config::load(Some(&missing)),
            Err(ConfigError::Io { .. })
        ));
    }
}

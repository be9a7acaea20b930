//! Process configuration.
//!
//! Read once from a TOML file at startup and passed by reference to every
//! component afterwards. Every key is optional; missing keys fall back to
//! the values of the original deployment.
//!
//! ```toml
//! [mqtt]
//! broker = "192.168.1.100"
//! topic = "plc/control"
//!
//! [relay]
//! pin = 17
//! backend = "gpio"
//!
//! [commands]
//! power_on = "power on"
//! power_off = "power off"
//!
//! [backoff]
//! base_ms = 1000
//! max_ms = 30000
//! ```

use crate::command::CommandConfig;
use crate::mqtt::config::MqttConfig;
use crate::relay::RelayConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const CONFIG_ENV: &str = "RELAYSWITCH_CONFIG";
const CONFIG_DIR: &str = "relayswitch";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub relay: RelayConfig,
    pub commands: CommandConfig,
    pub backoff: BackoffConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    /// Randomize each delay within [delay / 2, delay]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 30_000,
            jitter: false,
        }
    }
}

impl BackoffConfig {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Budget for unsubscribe plus DISCONNECT before the socket is dropped
    pub timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_ms: 3_000 }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Loads the configuration.
    ///
    /// An explicit path (command line, then `RELAYSWITCH_CONFIG`) must exist.
    /// The per-user default location is optional; without it the built-in
    /// defaults are used.
    pub async fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let explicit = explicit.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        let config = match explicit {
            Some(path) => Self::from_file(&path).await?,
            None => match default_path() {
                Some(path) if path.exists() => Self::from_file(&path).await?,
                _ => {
                    info!("No configuration file found, using defaults");
                    Config::default()
                }
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Reading configuration from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.mqtt.broker.trim().is_empty() {
            return invalid("mqtt.broker must not be empty");
        }
        if self.mqtt.topic.is_empty() {
            return invalid("mqtt.topic must not be empty");
        }
        if self.mqtt.topic.contains(['+', '#']) {
            return invalid("mqtt.topic must be a plain topic without wildcards");
        }
        if self.mqtt.qos > 2 {
            return invalid("mqtt.qos must be 0, 1 or 2");
        }
        if self.mqtt.client_id.is_empty() && !self.mqtt.clean_session {
            return invalid("mqtt.client_id must be set when mqtt.clean_session is false");
        }
        // Sent as a 16 bit field in CONNECT
        if self.mqtt.keep_alive_secs == 0 || self.mqtt.keep_alive_secs > u64::from(u16::MAX) {
            return invalid("mqtt.keep_alive_secs must be between 1 and 65535");
        }
        if self.mqtt.handshake_timeout_secs == 0 {
            return invalid("mqtt.handshake_timeout_secs must be at least 1");
        }
        if self.commands.power_on.is_empty() || self.commands.power_off.is_empty() {
            return invalid("command literals must not be empty");
        }
        if self.commands.power_on == self.commands.power_off {
            return invalid("commands.power_on and commands.power_off must differ");
        }
        if self.backoff.base_ms == 0 {
            return invalid("backoff.base_ms must be at least 1");
        }
        if self.backoff.base_ms > self.backoff.max_ms {
            return invalid("backoff.base_ms must not exceed backoff.max_ms");
        }
        if self.shutdown.timeout_ms == 0 {
            return invalid("shutdown.timeout_ms must be at least 1");
        }
        Ok(())
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

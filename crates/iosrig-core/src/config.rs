//! Persistent configuration for iosrig.
//!
//! Settings live in `~/.iosrig/config.json`. Every section and every field is
//! optional; anything left out takes the built-in default. Durations are
//! written as integer milliseconds (`readiness_timeout_ms`, ...).
//!
//! The keychain password has no default. It is read from the file or from
//! the `IOSRIG_KEYCHAIN_PASSWORD` environment variable, which wins.
//!
//! # Example
//!
//! ```no_run
//! use iosrig_core::config::HarnessConfig;
//!
//! let config = HarnessConfig::load()?;
//! println!("appium command: {:?}", config.automation.command);
//! # Ok::<(), iosrig_core::config::ConfigError>(())
//! ```

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::discovery::{default_enumeration_command, DeviceDiscovery};
use crate::orchestrator::{AutomationServerConfig, BridgeServerConfig};

const CONFIG_DIRNAME: &str = ".iosrig";
const CONFIG_FILENAME: &str = "config.json";

/// Overrides `bridge.signing.keychain_password`.
pub const KEYCHAIN_PASSWORD_ENV: &str = "IOSRIG_KEYCHAIN_PASSWORD";

/// Errors from loading or saving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not determine home directory")]
    NoHomeDir,

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Enumeration tool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub command: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            command: default_enumeration_command(),
        }
    }
}

impl DiscoveryConfig {
    pub fn discovery(&self) -> DeviceDiscovery {
        DeviceDiscovery::new(self.command.clone())
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub automation: AutomationServerConfig,
    pub bridge: BridgeServerConfig,
    pub discovery: DiscoveryConfig,
}

/// `~/.iosrig`
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(CONFIG_DIRNAME))
        .ok_or(ConfigError::NoHomeDir)
}

/// `~/.iosrig/config.json`
pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join(CONFIG_FILENAME))
}

impl HarnessConfig {
    /// Load from `~/.iosrig/config.json`, then apply environment overrides.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if the home directory is unknown, or the file exists
    /// but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_path()?)
    }

    /// Load from an explicit path, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.override_keychain_password(std::env::var(KEYCHAIN_PASSWORD_ENV).ok());
        Ok(config)
    }

    /// Replace the keychain password when `password` is set.
    ///
    /// Without a `bridge.signing` section there is no keychain to unlock, so
    /// the value is ignored.
    pub fn override_keychain_password(&mut self, password: Option<String>) {
        let Some(password) = password else {
            return;
        };
        match &mut self.bridge.signing {
            Some(signing) => signing.keychain_password = password,
            None => warn!(
                env = KEYCHAIN_PASSWORD_ENV,
                "Keychain password set but no signing section is configured"
            ),
        }
    }

    /// Save to `~/.iosrig/config.json`.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(io_err)
    }
}

/// Serde adapter storing a [`Duration`](std::time::Duration) as integer
/// milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

//! Startup configuration file.
//!
//! A small toml document mapped 1:1 onto [`PolicyState`]. This is only the
//! boot-time source; live policy mutation goes through [`PolicyStore`]
//! setters and persistence stays with the host.

use crate::store::{AppId, FilterLevel, PolicyState, MIN_SCAN_INTERVAL};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("scan_interval_ms must be greater than zero")]
    ZeroScanInterval,
}

/// On-disk shape of the policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub protection_enabled: bool,
    pub filter_level: FilterLevel,
    pub scan_interval_ms: u64,
    pub whitelist: Vec<String>,
    pub classifier_key: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let defaults = PolicyState::default();
        Self {
            protection_enabled: defaults.protection_enabled,
            filter_level: defaults.filter_level,
            scan_interval_ms: defaults.scan_interval.as_millis() as u64,
            whitelist: Vec::new(),
            classifier_key: defaults.classifier_key,
        }
    }
}

impl PolicyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_interval_ms == 0 {
            return Err(ConfigError::ZeroScanInterval);
        }
        Ok(())
    }

    pub fn into_state(self) -> PolicyState {
        let interval = Duration::from_millis(self.scan_interval_ms).max(MIN_SCAN_INTERVAL);
        PolicyState {
            protection_enabled: self.protection_enabled,
            filter_level: self.filter_level,
            scan_interval: interval,
            whitelist: self.whitelist.into_iter().map(AppId::new).collect(),
            classifier_key: self.classifier_key,
        }
    }
}

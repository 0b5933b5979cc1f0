//! Producer configuration, loadable from TOML.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default maximum chunk size (64 KB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// How a delivered chunk is acknowledged by the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// No continuation is offered; the consumer must return `false`.
    #[default]
    Synchronous,
    /// A continuation is offered; the consumer may return `true` and
    /// resume it later.
    Continuation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Maximum number of bytes per delivered chunk.
    pub chunk_size: usize,
    pub delivery: DeliveryMode,
    /// Schedule a full drain as soon as a consumer registers.
    pub auto_drain: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("chunk_size must be > 0")]
    ZeroChunkSize,
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            delivery: DeliveryMode::Synchronous,
            auto_drain: false,
        }
    }
}

impl ProducerConfig {
    pub fn new(chunk_size: usize, delivery: DeliveryMode, auto_drain: bool) -> Self {
        Self {
            chunk_size,
            delivery,
            auto_drain,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ProducerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn uses_continuation(&self) -> bool {
        self.delivery == DeliveryMode::Continuation
    }
}

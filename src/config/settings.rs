use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::router::CallTimeout;

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_REQUEST_QUEUE: &str = "fulfillment_requests";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Which reply channel layout the order service uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStrategy {
    /// One reply channel and consumer for the whole process.
    #[default]
    Shared,
    /// A fresh reply channel per call.
    PerCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSettings {
    /// Run the fulfillment worker inside the process.
    pub enabled: bool,
    /// Seed for the random decision; OS entropy when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub bind: String,
    pub call_timeout_ms: u64,
    pub request_queue: String,
    pub reply_strategy: ReplyStrategy,
    pub worker: WorkerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            call_timeout_ms: CallTimeout::DEFAULT_MILLIS,
            request_queue: DEFAULT_REQUEST_QUEUE.to_string(),
            reply_strategy: ReplyStrategy::default(),
            worker: WorkerSettings::default(),
        }
    }
}

impl Settings {
    /// Parse settings from TOML text; missing keys take their defaults.
    pub fn from_toml_str(text: &str, origin: &Path) -> ConfigResult<Self> {
        let settings: Settings = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read and parse a settings file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.call_timeout()?;
        if self.request_queue.trim().is_empty() {
            return Err(ConfigError::Invalid("request_queue must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> ConfigResult<CallTimeout> {
        CallTimeout::from_millis(self.call_timeout_ms)
    }

    /// Render as TOML, as accepted by [`Settings::from_toml_str`].
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

//! On-disk sorter settings
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

use crate::bridge::RetryPolicy;
use crate::handler::{BinConfig, HandshakeOptions, JobOptions, PollConfig};
use crate::serial::ConnectionConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterConfig {
    pub connection: ConnectionConfig,
    pub response: RetryPolicy,
    pub polling: PollConfig,
    pub bins: BinConfig,
    /// Bound on the whole configuration handshake; unbounded when absent
    pub handshake_timeout_ms: Option<u64>,
    /// Set the adapter's `++auto` mode before configuring the handler; left as-is when absent
    pub auto_read: Option<bool>,
    /// Pause after `FULLSITES?` and after `RESUME`
    pub inter_command_delay_ms: u64,
    /// Append a `->`/`<-` transcript of the bus traffic to this file
    pub transcript: Option<PathBuf>,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            response: RetryPolicy::default(),
            polling: PollConfig::default(),
            bins: BinConfig::default(),
            handshake_timeout_ms: None,
            auto_read: None,
            inter_command_delay_ms: 200,
            transcript: None,
        }
    }
}

impl SorterConfig {
    /// Read and validate a JSON config file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// `load` when a path is given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let io_err = |source| ConfigError::Io { path: path.to_path_buf(), source };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(io_err)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.port.trim().is_empty() {
            return Err(ConfigError::Invalid("connection.port is empty".into()));
        }
        if self.connection.baud_rate == 0 {
            return Err(ConfigError::Invalid("connection.baud_rate must be positive".into()));
        }
        if self.polling.max_polls == 0 || self.polling.max_unreadable == 0 {
            return Err(ConfigError::Invalid(
                "polling.max_polls and polling.max_unreadable must be at least 1".into(),
            ));
        }
        if self.response.max_delay_ms < self.response.base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "response.max_delay_ms ({}) is below response.base_delay_ms ({})",
                self.response.max_delay_ms, self.response.base_delay_ms
            )));
        }
        self.bins.validate().map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            poll: self.polling.clone(),
            handshake: HandshakeOptions {
                timeout_ms: self.handshake_timeout_ms,
                auto_read: self.auto_read,
            },
            inter_command_delay_ms: self.inter_command_delay_ms,
        }
    }
}

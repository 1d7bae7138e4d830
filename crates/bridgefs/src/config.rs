//! Configuration for the bridge server

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Bridge server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Root directory exposed over the bridge; all paths resolve inside it
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Maximum request payload size in bytes; larger frames are rejected
    /// and their payload skipped
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,

    /// Maximum open handles per session
    #[serde(default = "default_max_open_handles")]
    pub max_open_handles: usize,

    /// Per-operation deadline in seconds
    #[serde(default = "default_op_timeout")]
    pub op_timeout_secs: u64,

    /// Maximum directory entries returned per readdir call
    #[serde(default = "default_readdir_chunk")]
    pub readdir_chunk: usize,

    /// Maximum filesystem operations running concurrently
    #[serde(default = "default_max_fs_concurrency")]
    pub max_fs_concurrency: usize,

    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text or json)
    pub format: LogFormat,
    /// Optional log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            root_dir: default_root_dir(),
            max_payload: default_max_payload(),
            max_open_handles: default_max_open_handles(),
            op_timeout_secs: default_op_timeout(),
            readdir_chunk: default_readdir_chunk(),
            max_fs_concurrency: default_max_fs_concurrency(),
            verbose: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {e}")))
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if !self.root_dir.exists() {
            return Err(crate::Error::Config(format!(
                "Root directory does not exist: {:?}",
                self.root_dir
            )));
        }

        if !self.root_dir.is_dir() {
            return Err(crate::Error::Config(format!(
                "Root path is not a directory: {:?}",
                self.root_dir
            )));
        }

        if self.max_payload < 4096 {
            return Err(crate::Error::Config(
                "max_payload must be at least 4096 bytes".to_string(),
            ));
        }

        if self.max_open_handles == 0 {
            return Err(crate::Error::Config(
                "max_open_handles must be at least 1".to_string(),
            ));
        }

        if self.readdir_chunk == 0 {
            return Err(crate::Error::Config(
                "readdir_chunk must be at least 1".to_string(),
            ));
        }

        if self.max_fs_concurrency == 0 {
            return Err(crate::Error::Config(
                "max_fs_concurrency must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7117
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("/tmp/bridgefs")
}

fn default_max_payload() -> usize {
    1024 * 1024 // 1 MiB, enough for one mount-page write
}

fn default_max_open_handles() -> usize {
    1024
}

fn default_op_timeout() -> u64 {
    30
}

fn default_readdir_chunk() -> usize {
    256
}

fn default_max_fs_concurrency() -> usize {
    16
}

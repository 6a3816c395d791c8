use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub version: String,
    pub state_directory: PathBuf,
    pub output_directory: PathBuf,
    /// SQLite file for the generation log. Defaults to `<state_directory>/feedbatch.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub default_batch_size: u64,
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
    /// Abort a job once this share of processed products failed to render.
    /// `None` disables the check.
    #[serde(default)]
    pub error_threshold_percent: Option<f64>,
    #[serde(default = "default_min_sample")]
    pub error_threshold_min_sample: u64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_batch_size() -> u64 {
    500
}

fn default_stale_timeout_secs() -> u64 {
    3600
}

fn default_min_sample() -> u64 {
    10
}

fn default_retention_hours() -> u64 {
    168
}

impl EngineConfig {
    /// Builds a config with defaults for everything but the two directories.
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(state_directory: P, output_directory: Q) -> Self {
        Self {
            version: "1.0".to_string(),
            state_directory: state_directory.into(),
            output_directory: output_directory.into(),
            database_path: None,
            default_batch_size: default_batch_size(),
            stale_timeout_secs: default_stale_timeout_secs(),
            error_threshold_percent: None,
            error_threshold_min_sample: default_min_sample(),
            retention_hours: default_retention_hours(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.state_directory.join("feedbatch.db"))
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Returns the default state directory: `~/.feedbatch/state`.
pub fn default_state_directory() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".feedbatch").join("state"))
}

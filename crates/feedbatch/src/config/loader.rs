use std::path::Path;

use crate::config::schema::EngineConfig;
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.state_directory.as_os_str().is_empty() {
        return Err(ConfigError::Validation {
            message: "state_directory must not be empty".to_string(),
        });
    }
    if config.output_directory.as_os_str().is_empty() {
        return Err(ConfigError::Validation {
            message: "output_directory must not be empty".to_string(),
        });
    }

    if config.default_batch_size == 0 {
        return Err(ConfigError::Validation {
            message: "default_batch_size must be greater than zero".to_string(),
        });
    }
    if config.stale_timeout_secs == 0 {
        return Err(ConfigError::Validation {
            message: "stale_timeout_secs must be greater than zero".to_string(),
        });
    }

    if let Some(threshold) = config.error_threshold_percent {
        if !(threshold > 0.0 && threshold <= 100.0) {
            return Err(ConfigError::Validation {
                message: format!(
                    "error_threshold_percent must be in (0, 100], got {}",
                    threshold
                ),
            });
        }
    }

    Ok(())
}

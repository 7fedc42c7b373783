// Engine configuration
//
// Loaded from TOML or built in code; every field has a default so an empty
// file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on worker threads accepted by [`EngineConfig::validate`]
pub const MAX_WORKER_THREADS: usize = 1024;

/// Errors loading or validating an [`EngineConfig`]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Configuration for trace construction
///
/// # Example
/// ```
/// use mpiperf::config::EngineConfig;
///
/// let config = EngineConfig::default();
/// assert_eq!(config.collective_timeout_ms, 5_000);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads for the per-rank and per-channel stages
    ///
    /// 0 (default) uses the available parallelism of the host.
    pub worker_threads: usize,

    /// How long a collective coordinator waits for the next participant entry
    ///
    /// The trace is fully materialized, so this only bounds pathological
    /// producer stalls. Default: 5000 ms.
    pub collective_timeout_ms: u64,

    /// Attribute message and collective wait time to the innermost enclosing
    /// call-tree frame (the `wait_time` column of aggregate rows)
    ///
    /// Default: true
    pub attribute_wait_time: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            collective_timeout_ms: 5_000,
            attribute_wait_time: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    ///
    /// # Example TOML
    /// ```toml
    /// worker_threads = 8
    /// collective_timeout_ms = 2000
    /// attribute_wait_time = false
    /// ```
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.collective_timeout_ms == 0 {
            return Err("collective_timeout_ms must be > 0".to_string());
        }

        if self.worker_threads > MAX_WORKER_THREADS {
            return Err(format!(
                "worker_threads must be <= {}, got {}",
                MAX_WORKER_THREADS, self.worker_threads
            ));
        }

        Ok(())
    }

    /// Number of worker threads to actually spawn
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn collective_timeout(&self) -> Duration {
        Duration::from_millis(self.collective_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.attribute_wait_time);
        assert!(config.effective_workers() >= 1);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = EngineConfig {
            collective_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_too_many_workers_rejected() {
        let config = EngineConfig {
            worker_threads: MAX_WORKER_THREADS + 1,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("worker_threads"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str("worker_threads = 3").unwrap();
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.effective_workers(), 3);
        assert_eq!(config.collective_timeout(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_invalid_toml_value() {
        let result = EngineConfig::from_toml_str("collective_timeout_ms = 0");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = EngineConfig::from_toml_str("worker_threads = \"many\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "collective_timeout_ms = 250").unwrap();
        writeln!(file, "attribute_wait_time = false").unwrap();

        let config = EngineConfig::from_toml(file.path()).unwrap();
        assert_eq!(config.collective_timeout_ms, 250);
        assert!(!config.attribute_wait_time);
    }

    #[test]
    fn test_missing_file() {
        let result = EngineConfig::from_toml("/nonexistent/mpiperf.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}

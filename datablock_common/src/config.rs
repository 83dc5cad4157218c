//! Configuration loading traits shared by the broker and CLI binaries.
//!
//! Library callers construct `datablock_core::DataBlockConfig` directly in
//! code; these types are for the binaries that need to read settings from a
//! TOML file on disk (broker listen path, CLI defaults, log level).

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Log verbosity, independent of the `tracing` `Level` type so config files
/// don't need to depend on `tracing` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace-level verbosity.
    Trace,
    /// Debug-level verbosity.
    Debug,
    /// Info-level verbosity (default).
    Info,
    /// Warning-level verbosity.
    Warn,
    /// Error-level verbosity.
    Error,
}

impl LogLevel {
    /// The `tracing::Level` equivalent of this log level.
    pub fn as_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the specified path.
    #[error("configuration file not found: {path}")]
    FileNotFound {
        /// Path that was searched.
        path: String,
    },

    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Configuration fields shared by every DataBlock binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Process-identifying name, used in log output.
    pub service_name: String,
    /// Minimum log level to emit.
    #[serde(default)]
    pub log_level: LogLevel,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns [`ConfigError::ValidationError`] if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
/// - Returns [`ConfigError::FileNotFound`] if the file does not exist.
/// - Returns [`ConfigError::ParseError`] if TOML syntax is invalid.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file at `path`.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

/// Initialize `tracing` for the calling binary at the given level.
///
/// Target module paths are suppressed, thread ids are shown, and output
/// stays plain-text unless the caller opts in via `init_tracing_json`.
pub fn init_tracing(level: LogLevel) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::from_default_env().add_directive(level.as_tracing_level().into());

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Initialize `tracing` with JSON output, for log-aggregation-friendly
/// deployments.
pub fn init_tracing_json(level: LogLevel) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::from_default_env().add_directive(level.as_tracing_level().into());
    let _ = fmt().with_env_filter(filter).json().try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        shared: SharedConfig,
    }

    impl ConfigLoader for TestConfig {}

    #[test]
    fn missing_file_reports_not_found() {
        let result = TestConfig::load(Path::new("/nonexistent/datablock.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn valid_file_loads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[shared]\nservice_name = \"test\"\n").unwrap();

        let config = TestConfig::load(file.path()).unwrap();
        assert_eq!(config.shared.service_name, "test");
        assert_eq!(config.shared.log_level, LogLevel::Info);
        assert!(config.shared.validate().is_ok());
    }

    #[test]
    fn empty_service_name_fails_validation() {
        let shared = SharedConfig {
            service_name: String::new(),
            log_level: LogLevel::Debug,
        };
        assert!(matches!(
            shared.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }
}

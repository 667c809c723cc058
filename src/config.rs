//! Configuration management for the resilience core
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! environment variables prefixed with `RESILIENCE__` using `__` between
//! nested keys (`RESILIENCE__DEAD_LETTER__MAX_RETRY_ATTEMPTS=8`).

use crate::dead_letter::service::DeadLetterConfig;
use crate::error::{ResilienceError, Result};
use crate::error_recovery::circuit_breaker::CircuitBreakerConfig;
use crate::error_recovery::fallback::FallbackConfig;
use crate::error_recovery::recovery_manager::{RecoveryManagerConfig, ServiceResilienceConfig};
use crate::error_recovery::retry_policy::RetryConfig;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "RESILIENCE";

/// Complete settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub fallback: FallbackConfig,
    pub dead_letter: DeadLetterConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Persistence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `file:` path for local SQLite or `libsql://` URL for remote Turso
    pub database_url: String,
    pub auth_token: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "file:resilience.db".to_string(),
            auth_token: String::new(),
        }
    }
}

#[cfg(feature = "turso")]
impl From<&StorageConfig> for crate::storage::TursoConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            database_url: config.database_url.clone(),
            auth_token: config.auth_token.clone(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    pub format: LogFormat,
    /// Directory for daily-rotated log files
    pub file_dir: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            file_dir: None,
            file_prefix: "resilience.log".to_string(),
        }
    }
}

impl ResilienceSettings {
    /// Load defaults, then `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            debug!("Loading settings from {}", path.display());
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Self = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string without consulting the environment
    pub fn from_toml(contents: &str) -> Result<Self> {
        let settings: Self = toml::from_str(contents)
            .map_err(|e| ResilienceError::config(format!("invalid settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(ResilienceError::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ResilienceError::config("retry.backoff_multiplier must be at least 1"));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ResilienceError::config("retry.base_delay exceeds retry.max_delay"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ResilienceError::config(
                "circuit_breaker.failure_threshold must be at least 1",
            ));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(ResilienceError::config(
                "circuit_breaker.success_threshold must be at least 1",
            ));
        }
        if self.dead_letter.backoff_multiplier < 1.0 {
            return Err(ResilienceError::config(
                "dead_letter.backoff_multiplier must be at least 1",
            ));
        }
        if self.dead_letter.base_retry_delay > self.dead_letter.max_retry_delay {
            return Err(ResilienceError::config(
                "dead_letter.base_retry_delay exceeds dead_letter.max_retry_delay",
            ));
        }
        if self.dead_letter.recovery_batch_size == 0 {
            return Err(ResilienceError::config(
                "dead_letter.recovery_batch_size must be at least 1",
            ));
        }
        Ok(())
    }

    /// Manager defaults built from the breaker, retry and fallback sections
    pub fn recovery_manager_config(&self) -> RecoveryManagerConfig {
        RecoveryManagerConfig {
            defaults: ServiceResilienceConfig {
                circuit_breaker: self.circuit_breaker.clone(),
                retry: self.retry.clone(),
                fallback: self.fallback.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let settings = ResilienceSettings::default();
        assert_eq!(settings.circuit_breaker.failure_threshold, 5);
        assert_eq!(settings.circuit_breaker.success_threshold, 3);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.dead_letter.max_retry_attempts, 5);
        assert_eq!(settings.dead_letter.processing_interval, Duration::from_secs(300));
        assert_eq!(settings.storage.database_url, "file:resilience.db");
        assert_eq!(settings.logging.format, LogFormat::Compact);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial_sections() {
        let settings = ResilienceSettings::from_toml(
            r#"
            [circuit_breaker]
            failure_threshold = 2
            recovery_timeout = "30s"

            [dead_letter]
            base_retry_delay = "2m"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(settings.circuit_breaker.failure_threshold, 2);
        assert_eq!(settings.circuit_breaker.recovery_timeout, Duration::from_secs(30));
        assert_eq!(settings.circuit_breaker.success_threshold, 3);
        assert_eq!(settings.dead_letter.base_retry_delay, Duration::from_secs(120));
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut settings = ResilienceSettings::default();
        settings.retry.max_attempts = 0;
        assert!(matches!(settings.validate(), Err(ResilienceError::Config(_))));

        let mut settings = ResilienceSettings::default();
        settings.dead_letter.recovery_batch_size = 0;
        assert!(settings.validate().is_err());

        let mut settings = ResilienceSettings::default();
        settings.retry.base_delay = Duration::from_secs(60);
        assert!(settings.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_file_then_env_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[dead_letter]\nmax_retry_attempts = 3\nrecovery_batch_size = 20\n"
        )
        .unwrap();

        temp_env::with_vars(
            [
                ("RESILIENCE__DEAD_LETTER__MAX_RETRY_ATTEMPTS", Some("8")),
                ("RESILIENCE__STORAGE__DATABASE_URL", Some("file:/tmp/other.db")),
            ],
            || {
                let settings = ResilienceSettings::load(Some(file.path())).unwrap();
                assert_eq!(settings.dead_letter.max_retry_attempts, 8);
                assert_eq!(settings.dead_letter.recovery_batch_size, 20);
                assert_eq!(settings.storage.database_url, "file:/tmp/other.db");
            },
        );
    }

    #[test]
    #[serial]
    fn test_load_rejects_invalid_env() {
        temp_env::with_var("RESILIENCE__RETRY__MAX_ATTEMPTS", Some("0"), || {
            assert!(ResilienceSettings::load(None).is_err());
        });
    }
}

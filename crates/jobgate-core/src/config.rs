//! TOML configuration.
//!
//! All fields have defaults, so an empty file (or no file) yields a
//! working single-node setup: a pool backend, an empty critical-action
//! list, and a 30-day retention window. Validation is fail-closed; a
//! config that parses but makes no sense is rejected at load time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::{BackendConfig, BackoffPolicy};

/// Errors from configuration loading.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,

        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config parsed but fails validation.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    /// How long terminal jobs are kept before being purged.
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// How often the sweep runs.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobgateConfig {
    /// Path of the job registry database.
    pub registry_path: PathBuf,

    /// Path of the audit log database.
    pub audit_path: PathBuf,

    /// Execution backend variant and sizing.
    pub backend: BackendConfig,

    /// Delay policy between retry attempts.
    pub backoff: BackoffPolicy,

    /// Actions that require human confirmation before submission.
    pub critical_actions: HashSet<String>,

    /// Retention settings.
    pub retention: RetentionConfig,
}

impl Default for JobgateConfig {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from("jobgate.db"),
            audit_path: PathBuf::from("jobgate-audit.db"),
            backend: BackendConfig::default(),
            backoff: BackoffPolicy::default(),
            critical_actions: HashSet::new(),
            retention: RetentionConfig::default(),
        }
    }
}

impl JobgateConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read, parsed, or
    /// validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error when the string cannot be parsed or validated.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match &self.backend {
            BackendConfig::Pool {
                workers,
                queue_depth,
                ..
            } => {
                if *workers == 0 {
                    return Err(ConfigError::Invalid("backend.workers must be > 0".into()));
                }
                if *queue_depth == 0 {
                    return Err(ConfigError::Invalid(
                        "backend.queue_depth must be > 0".into(),
                    ));
                }
            }
            BackendConfig::Queue { consumers } => {
                if *consumers == 0 {
                    return Err(ConfigError::Invalid("backend.consumers must be > 0".into()));
                }
            }
            BackendConfig::Batch { poll_interval } => {
                if poll_interval.is_zero() {
                    return Err(ConfigError::Invalid(
                        "backend.poll_interval must be > 0".into(),
                    ));
                }
            }
        }
        if self.retention.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "retention.sweep_interval must be > 0".into(),
            ));
        }
        if self.registry_path == self.audit_path {
            return Err(ConfigError::Invalid(
                "registry_path and audit_path must differ".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Backpressure;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = JobgateConfig::from_toml("").unwrap();
        assert_eq!(config.registry_path, PathBuf::from("jobgate.db"));
        assert!(config.critical_actions.is_empty());
        assert!(matches!(
            config.backend,
            BackendConfig::Pool {
                workers: 4,
                queue_depth: 64,
                backpressure: Backpressure::Block,
            }
        ));
        assert_eq!(
            config.retention.window,
            Duration::from_secs(30 * 24 * 60 * 60)
        );
    }

    #[test]
    fn test_full_config_round_trip() {
        let config = JobgateConfig::from_toml(
            r#"
            registry_path = "/var/lib/jobgate/registry.db"
            audit_path = "/var/lib/jobgate/audit.db"
            critical_actions = ["delete_dataset", "publish_release"]

            [backend]
            kind = "queue"
            consumers = 6

            [backoff]
            type = "fixed"
            delay = "250ms"

            [retention]
            window = "7d"
            sweep_interval = "10m"
            "#,
        )
        .unwrap();

        assert!(matches!(config.backend, BackendConfig::Queue { consumers: 6 }));
        assert!(config.critical_actions.contains("delete_dataset"));
        assert_eq!(config.retention.window, Duration::from_secs(7 * 24 * 60 * 60));
        assert!(matches!(
            config.backoff,
            BackoffPolicy::Fixed { delay } if delay == Duration::from_millis(250)
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = JobgateConfig::from_toml(
            r#"
            [backend]
            kind = "pool"
            workers = 0
            queue_depth = 64
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_colocated_databases_rejected() {
        let err = JobgateConfig::from_toml(
            r#"
            registry_path = "same.db"
            audit_path = "same.db"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(JobgateConfig::from_toml("not_a_real_key = 1").is_err());
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let err = JobgateConfig::from_file(Path::new("/nonexistent/jobgate.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

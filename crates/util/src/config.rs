//! Engine configuration.
//!
//! Settings are layered: built-in defaults, then the JSON file at
//! [`default_config_path`](crate::default_config_path), then `CADENCE_*`
//! environment variables. The result is validated before it is handed out.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::paths::{STATE_DIR_ENV, default_config_path, default_state_dir, expand_tilde};

pub const MAX_CONCURRENCY_ENV: &str = "CADENCE_MAX_CONCURRENCY";
pub const STEP_TIMEOUT_ENV: &str = "CADENCE_STEP_TIMEOUT_SECS";

pub const DEFAULT_MAX_CONCURRENCY: usize = 8;
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_STORE_CONFLICT_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("environment variable {name} has invalid value '{value}'")]
    InvalidEnv { name: &'static str, value: String },
}

/// Settings that shape how the engine schedules and persists runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound on concurrently running steps across one run.
    pub max_concurrency: usize,
    /// Timeout applied to steps that do not override it.
    pub step_timeout_secs: u64,
    /// Workflow-wide failure policy when the instruction does not set one.
    pub continue_on_error: bool,
    /// How many times a conflicting record update is re-applied before giving up.
    pub store_conflict_retries: u32,
    /// Directory holding one JSON file per execution record.
    pub state_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            continue_on_error: false,
            store_conflict_retries: DEFAULT_STORE_CONFLICT_RETRIES,
            state_dir: default_state_dir(),
        }
    }
}

impl EngineConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrency",
                reason: "must be at least 1".into(),
            });
        }
        if self.step_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "step_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "state_dir",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env(MAX_CONCURRENCY_ENV) {
            self.max_concurrency = value.parse().map_err(|_| ConfigError::InvalidEnv {
                name: MAX_CONCURRENCY_ENV,
                value: value.clone(),
            })?;
        }
        if let Some(value) = read_env(STEP_TIMEOUT_ENV) {
            self.step_timeout_secs = value.parse().map_err(|_| ConfigError::InvalidEnv {
                name: STEP_TIMEOUT_ENV,
                value: value.clone(),
            })?;
        }
        if let Some(value) = read_env(STATE_DIR_ENV) {
            self.state_dir = PathBuf::from(value);
        }
        Ok(())
    }
}

fn read_env(name: &str) -> Option<String> {
    env::var(name).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

/// Load the configuration from the default location.
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    load_config_from_path(&default_config_path())
}

/// Load the configuration from `path`; a missing file yields the defaults.
pub fn load_config_from_path(path: &Path) -> Result<EngineConfig, ConfigError> {
    let mut config = if path.exists() {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str::<EngineConfig>(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        debug!(path = %path.display(), "config file not found; using defaults");
        EngineConfig::default()
    };

    config.apply_env_overrides()?;
    config.state_dir = expand_tilde(&config.state_dir.to_string_lossy());
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn without_overrides<R>(body: impl FnOnce() -> R) -> R {
        temp_env::with_vars(
            [
                (MAX_CONCURRENCY_ENV, None::<&str>),
                (STEP_TIMEOUT_ENV, None),
                (STATE_DIR_ENV, None),
            ],
            body,
        )
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().expect("tempdir");
        let config = without_overrides(|| load_config_from_path(&dir.path().join("absent.json"))).expect("load");
        assert_eq!(config.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert_eq!(config.step_timeout(), Duration::from_secs(300));
        assert_eq!(config.store_conflict_retries, DEFAULT_STORE_CONFLICT_RETRIES);
        assert!(!config.continue_on_error);
    }

    #[test]
    fn file_values_are_layered_under_environment() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "max_concurrency": 2, "step_timeout_secs": 10, "state_dir": "/srv/runs" }"#).expect("write config");

        let config = temp_env::with_vars(
            [
                (MAX_CONCURRENCY_ENV, Some("4")),
                (STEP_TIMEOUT_ENV, None),
                (STATE_DIR_ENV, None),
            ],
            || load_config_from_path(&path),
        )
        .expect("load");

        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.step_timeout_secs, 10);
        assert_eq!(config.state_dir, PathBuf::from("/srv/runs"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "max_concurrency": 0 }"#).expect("write config");

        let error = without_overrides(|| load_config_from_path(&path)).expect_err("zero concurrency");
        assert!(matches!(error, ConfigError::InvalidValue { field: "max_concurrency", .. }));
    }

    #[test]
    fn malformed_environment_value_is_reported() {
        let dir = tempdir().expect("tempdir");
        let error = temp_env::with_vars(
            [
                (MAX_CONCURRENCY_ENV, None::<&str>),
                (STEP_TIMEOUT_ENV, Some("soon")),
                (STATE_DIR_ENV, None),
            ],
            || load_config_from_path(&dir.path().join("absent.json")),
        )
        .expect_err("bad env");
        assert!(matches!(error, ConfigError::InvalidEnv { name: STEP_TIMEOUT_ENV, .. }));
    }

    #[test]
    fn unknown_fields_fail_to_parse() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "max_parallel": 3 }"#).expect("write config");
        let error = without_overrides(|| load_config_from_path(&path)).expect_err("unknown field");
        assert!(matches!(error, ConfigError::Parse { .. }));
    }
}

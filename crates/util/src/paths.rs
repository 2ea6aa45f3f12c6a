//! Default file locations and path normalisation.

use std::env;
use std::path::PathBuf;

use dirs_next::{config_dir, data_dir, home_dir};

/// Environment variable overriding the configuration file location.
pub const CONFIG_PATH_ENV: &str = "CADENCE_CONFIG_PATH";

/// Environment variable overriding the state store directory.
pub const STATE_DIR_ENV: &str = "CADENCE_STATE_DIR";

pub fn expand_tilde(path: &str) -> PathBuf {
    let trimmed = path.trim();
    if trimmed == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = trimmed.strip_prefix("~/") {
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    if let Some(rest) = trimmed.strip_prefix("~\\") {
        // Windows-style
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    PathBuf::from(trimmed)
}

/// Location of `config.json`, honouring [`CONFIG_PATH_ENV`].
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV)
        && !path.trim().is_empty()
    {
        return expand_tilde(&path);
    }

    config_dir().unwrap_or_else(|| PathBuf::from(".")).join("cadence").join("config.json")
}

/// Directory holding execution records, honouring [`STATE_DIR_ENV`].
pub fn default_state_dir() -> PathBuf {
    if let Ok(path) = env::var(STATE_DIR_ENV)
        && !path.trim().is_empty()
    {
        return expand_tilde(&path);
    }

    data_dir().unwrap_or_else(|| PathBuf::from(".")).join("cadence").join("runs")
}

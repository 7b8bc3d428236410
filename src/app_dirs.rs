//! Application directories anchored to a single `.remotefit` folder.
//!
//! Settings and logs live under the OS config directory unless
//! `REMOTEFIT_CONFIG_HOME` points somewhere else (tests, portable setups).

use std::path::PathBuf;
use std::sync::{LazyLock, Mutex};

use directories::BaseDirs;
use thiserror::Error;

/// Name of the application directory under the config root.
pub const APP_DIR_NAME: &str = ".remotefit";

/// Environment variable overriding the config root.
pub const CONFIG_HOME_ENV: &str = "REMOTEFIT_CONFIG_HOME";

static CONFIG_BASE_OVERRIDE: LazyLock<Mutex<Option<PathBuf>>> = LazyLock::new(|| Mutex::new(None));

#[derive(Debug, Error)]
pub enum AppDirError {
    /// No suitable base config directory could be resolved.
    #[error("No suitable base config directory available for application files")]
    NoBaseDir,
    #[error("Failed to create application directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn ensure_dir(path: PathBuf) -> Result<PathBuf, AppDirError> {
    std::fs::create_dir_all(&path).map_err(|source| AppDirError::CreateDir {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Root `.remotefit` directory, created if needed.
pub fn app_root_dir() -> Result<PathBuf, AppDirError> {
    let base = config_base_dir().ok_or(AppDirError::NoBaseDir)?;
    ensure_dir(base.join(APP_DIR_NAME))
}

/// `logs` inside the root directory, created if needed.
pub fn logs_dir() -> Result<PathBuf, AppDirError> {
    ensure_dir(app_root_dir()?.join("logs"))
}

/// Default stage root for the SQLite substrate, created if needed.
pub fn stages_dir() -> Result<PathBuf, AppDirError> {
    ensure_dir(app_root_dir()?.join("stages"))
}

/// Point the config root somewhere else for the rest of the process.
pub fn set_config_base_override(path: Option<PathBuf>) {
    let mut guard = CONFIG_BASE_OVERRIDE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = path;
}

fn config_base_dir() -> Option<PathBuf> {
    let overridden = CONFIG_BASE_OVERRIDE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    if let Some(path) = overridden {
        return Some(path);
    }
    if let Ok(path) = std::env::var(CONFIG_HOME_ENV) {
        return Some(PathBuf::from(path));
    }
    BaseDirs::new().map(|dirs| dirs.config_dir().to_path_buf())
}

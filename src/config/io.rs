use std::io::Write;
use std::path::{Path, PathBuf};

use rand::TryRngCore;

use super::{ConfigError, TrainingSettings, map_app_dir_error};
use crate::app_dirs;

/// Default filename used to store training settings.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Resolve the settings file path, ensuring the parent directory exists.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let dir = app_dirs::app_root_dir().map_err(map_app_dir_error)?;
    Ok(dir.join(CONFIG_FILE_NAME))
}

/// Load settings from the application directory, returning defaults if missing.
pub fn load_or_default() -> Result<TrainingSettings, ConfigError> {
    load_from_path(&config_path()?)
}

/// Load settings from `path`; a missing file yields defaults.
pub fn load_from_path(path: &Path) -> Result<TrainingSettings, ConfigError> {
    if !path.exists() {
        return Ok(TrainingSettings::default());
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<TrainingSettings>(&text)
        .map(TrainingSettings::normalized)
        .map_err(|source| ConfigError::ParseToml {
            path: path.to_path_buf(),
            source,
        })
}

pub fn save(settings: &TrainingSettings) -> Result<(), ConfigError> {
    save_to_path(settings, &config_path()?)
}

/// Write pretty TOML atomically, creating parent directories as needed.
pub fn save_to_path(settings: &TrainingSettings, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let data = toml::to_string_pretty(settings).map_err(|source| ConfigError::SerializeToml {
        path: path.to_path_buf(),
        source,
    })?;
    atomic_write(path, data.as_bytes())
}

fn write_error(path: &Path, message: String) -> ConfigError {
    ConfigError::Write {
        path: path.to_path_buf(),
        source: std::io::Error::other(message),
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let dir = path
        .parent()
        .ok_or_else(|| write_error(path, "config path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| write_error(path, "config path has no file name".into()))?;

    let mut bytes = [0u8; 6];
    rand::rngs::OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| write_error(path, format!("failed to generate temporary file suffix: {err}")))?;
    let suffix: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    let tmp_path = dir.join(format!("{}.tmp-{suffix}", file_name.to_string_lossy()));

    let written = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp_path)
        .and_then(|mut file| {
            file.write_all(data)?;
            file.sync_all()
        })
        .and_then(|()| std::fs::rename(&tmp_path, path));
    if let Err(source) = written {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(ConfigError::Write {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

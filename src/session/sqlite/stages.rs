use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::session::SessionError;
use crate::session::identifier::is_safe_object_name;

fn stage_dir(root: &Path, stage: &str) -> Result<PathBuf, SessionError> {
    if !is_safe_object_name(stage) {
        return Err(SessionError::InvalidName(stage.to_string()));
    }
    Ok(root.join(stage))
}

fn existing_stage_dir(root: &Path, stage: &str) -> Result<PathBuf, SessionError> {
    let dir = stage_dir(root, stage)?;
    if dir.is_dir() {
        Ok(dir)
    } else {
        Err(SessionError::StageNotFound(stage.to_string()))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SessionError + '_ {
    move |source| SessionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Create a stage; an existing stage is refused.
pub(super) fn create(root: &Path, stage: &str) -> Result<(), SessionError> {
    let dir = stage_dir(root, stage)?;
    std::fs::create_dir_all(root).map_err(io_error(root))?;
    match std::fs::create_dir(&dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            Err(SessionError::StageExists(stage.to_string()))
        }
        Err(err) => Err(io_error(&dir)(err)),
    }
}

pub(super) fn remove(root: &Path, stage: &str) -> Result<bool, SessionError> {
    let dir = stage_dir(root, stage)?;
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_error(&dir)(err)),
    }
}

pub(super) fn list(root: &Path) -> Result<Vec<String>, SessionError> {
    let entries = std::fs::read_dir(root).map_err(io_error(root))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_error(root))?;
        if entry.path().is_dir()
            && let Some(name) = entry.file_name().to_str()
        {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

pub(super) fn put(root: &Path, stage: &str, file: &str, bytes: &[u8]) -> Result<(), SessionError> {
    let dir = existing_stage_dir(root, stage)?;
    if !is_safe_object_name(file) {
        return Err(SessionError::InvalidName(file.to_string()));
    }
    let path = dir.join(file);
    std::fs::write(&path, bytes).map_err(io_error(&path))
}

pub(super) fn get(root: &Path, stage: &str, file: &str) -> Result<Vec<u8>, SessionError> {
    let dir = existing_stage_dir(root, stage)?;
    if !is_safe_object_name(file) {
        return Err(SessionError::InvalidName(file.to_string()));
    }
    let path = dir.join(file);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(SessionError::FileNotFound {
            stage: stage.to_string(),
            file: file.to_string(),
        }),
        Err(err) => Err(io_error(&path)(err)),
    }
}

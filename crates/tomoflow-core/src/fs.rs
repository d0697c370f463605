use std::path::{Path, PathBuf};

use crate::error::{ReconError, Result};

/// List the canonical paths of all regular files directly under `path`,
/// sorted lexicographically.
pub fn read_directory(path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ReconError::InvalidInput(format!(
            "{} does not exist",
            path.display()
        )));
    }
    if !path.is_dir() {
        return Err(ReconError::InvalidInput(format!(
            "{} is not a directory",
            path.display()
        )));
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path().canonicalize()?);
        }
    }
    files.sort();
    Ok(files)
}

/// Create `path` (and any missing parents). Succeeds if the directory
/// already exists; fails if the path exists but is not a directory.
pub fn create_directory(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if path.exists() {
        if path.is_dir() {
            return Ok(());
        }
        return Err(ReconError::InvalidInput(format!(
            "{} exists but is not a directory",
            path.display()
        )));
    }
    std::fs::create_dir_all(path)?;
    Ok(())
}

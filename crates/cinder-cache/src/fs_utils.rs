use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Remove a directory only when it is empty; a non-empty directory is left
/// alone without error.
pub fn remove_dir_if_empty(path: &Path) -> io::Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::DirectoryNotEmpty => Ok(()),
        Err(err) => Err(err),
    }
}

/// Move a file that could not be deleted out of its canonical slot so the
/// slot can be recreated. Returns the quarantine path.
pub fn quarantine_file(path: &Path, quarantine_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(quarantine_dir).with_context(|| {
        format!(
            "failed to create quarantine directory: {}",
            quarantine_dir.display()
        )
    })?;

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_nanos();
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "payload".to_string());
    let destination = quarantine_dir.join(format!("quarantine-{nanos}-{file_name}"));

    fs::rename(path, &destination).with_context(|| {
        format!(
            "failed to quarantine {} to {}",
            path.display(),
            destination.display()
        )
    })?;
    Ok(destination)
}

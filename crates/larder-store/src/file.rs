// ABOUTME: Reads and writes backup payload files on disk.
// ABOUTME: Writes go to a temp file that is fsynced and renamed over the target, so a crash never leaves half a backup.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use larder_core::backup::BackupPayload;
use thiserror::Error;

/// Errors that can occur reading or writing backup files.
#[derive(Debug, Error)]
pub enum BackupFileError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write `payload` as pretty JSON to `path`, creating parent directories.
pub fn write_backup_file(path: &Path, payload: &BackupPayload) -> Result<(), BackupFileError> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(payload)?;
    let tmp_path = path.with_extension("json.tmp");

    let mut file = File::create(&tmp_path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;

    // Best-effort: the rename already landed.
    if let Some(parent) = parent
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }

    tracing::info!(path = %path.display(), records = payload.record_count(), "backup file written");
    Ok(())
}

pub fn read_backup_file(path: &Path) -> Result<BackupPayload, BackupFileError> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

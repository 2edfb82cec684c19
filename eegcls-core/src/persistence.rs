//! Durable artifact writes: configuration snapshots and checkpoints.
//!
//! All writes go to a `.tmp` sibling first and are renamed into place, so a
//! crash mid-write never leaves a truncated `hparams.yaml` or `best.ckpt`.

use crate::error::{Result, RunError};
use std::io;
use std::path::Path;

/// Atomically write raw bytes to `path`, creating parent directories.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    write_then_rename(path, data).map_err(|e| RunError::snapshot_write(path, e))
}

/// Serialize `data` as pretty JSON and write it atomically.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| RunError::snapshot_write(path, io::Error::other(e)))?;
    atomic_write(path, json.as_bytes())
}

/// Serialize `data` as YAML and write it atomically.
pub fn atomic_write_yaml<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(data)
        .map_err(|e| RunError::snapshot_write(path, io::Error::other(e)))?;
    atomic_write(path, yaml.as_bytes())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

fn write_then_rename(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

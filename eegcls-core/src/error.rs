//! Error types for the eegcls-core crate.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error for a single experiment run.
///
/// Every variant is fatal: the run coordinator never recovers locally, and
/// artifacts written before the failure stay on disk.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Invalid configuration value for `{key}`: {reason}")]
    InvalidConfigValue { key: String, reason: String },

    #[error("Failed to write {}: {source}", path.display())]
    SnapshotWriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Assembly failed: {0}")]
    AssemblyFailure(String),

    #[error("Execution failed: {0}")]
    ExecutionFailure(String),
}

impl RunError {
    pub fn invalid_config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfigValue {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn snapshot_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::SnapshotWriteFailure {
            path: path.into(),
            source,
        }
    }

    pub fn assembly(msg: impl Into<String>) -> Self {
        Self::AssemblyFailure(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::ExecutionFailure(msg.into())
    }
}

impl From<figment::Error> for RunError {
    fn from(err: figment::Error) -> Self {
        let key = if err.path.is_empty() {
            "<config>".to_string()
        } else {
            err.path.join(".")
        };
        Self::InvalidConfigValue {
            key,
            reason: err.kind.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_key() {
        let err = RunError::invalid_config("reproducible", "expected a boolean token, got `maybe`");
        assert_eq!(
            err.to_string(),
            "Invalid configuration value for `reproducible`: expected a boolean token, got `maybe`"
        );
    }

    #[test]
    fn test_snapshot_write_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = RunError::snapshot_write("/exp/intra/psd_v/hparams.yaml", io);
        assert!(err.to_string().contains("hparams.yaml"));
        assert!(std::error::Error::source(&err).is_some());
    }
}

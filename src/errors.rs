use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Invalid backup options: {0}")]
    InvalidOptions(String),

    #[error("Connection check failed: {0}")]
    Connection(String),

    #[error("Output directory {path} is not writable: {source}")]
    OutputNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Insufficient disk space in {path}: need ~{required} bytes, {available} available")]
    InsufficientDiskSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("Dump tool not found: {0}")]
    DumpToolNotFound(String),

    #[error("Failed to start dump tool {program}: {source}")]
    DumpToolSpawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Exit status is kept as text: a signal-terminated child has no code.
    #[error("dump tool failed ({status}): {stderr}")]
    DumpToolFailed { status: String, stderr: String },

    #[error("Output pipeline write failed: {0}")]
    Pipeline(#[source] std::io::Error),

    #[error("Failed to finalize {layer} layer: {source}")]
    WriterFinalize {
        layer: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Backup cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackupError {
    /// True when the failure happened before any dump process was spawned.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BackupError::InvalidOptions(_)
                | BackupError::Connection(_)
                | BackupError::OutputNotWritable { .. }
                | BackupError::InsufficientDiskSpace { .. }
                | BackupError::DumpToolNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

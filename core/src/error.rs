use thiserror::Error;

use crate::databases::Engine;

/// Errors surfaced by the backup engine.
///
/// Scheduled firings catch and log every variant; on-demand operations
/// propagate them to the caller unchanged.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("invalid cron expression '{expr}': {reason}")]
    BadCron { expr: String, reason: String },

    #[error("required {engine} tool '{tool}' not found on PATH")]
    ToolMissing { engine: Engine, tool: &'static str },

    #[error("{engine} dump failed: {stderr}")]
    DumpFailed { engine: Engine, stderr: String },

    #[error("{engine} restore failed: {detail}")]
    RestoreFailed { engine: Engine, detail: String },

    #[error("restore target is not empty; restore into an empty database or drop the conflicting objects first")]
    RestoreTargetNotEmpty,

    #[error("ssh tunnel setup failed: {0}")]
    Tunnel(String),

    #[error("s3 is enabled but '{0}' is not configured")]
    S3Config(&'static str),

    #[error("s3 request failed: {0}")]
    S3Transport(String),

    #[error("backup file is missing locally and no s3 copy is recorded")]
    BackupMissing,

    #[error("failed to decrypt stored credential")]
    Decrypt,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;

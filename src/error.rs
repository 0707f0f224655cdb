use std::path::PathBuf;

/// Errors produced by the synchronization engine.
///
/// Transport failures (FTP, remote agent) are kept distinct from local
/// filesystem errors so callers can tell a dropped connection apart from
/// a genuine I/O problem, even though both backends expose the same
/// capability surface.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A location string could not be parsed into a known scheme.
    #[error("invalid location '{0}': expected a local path, ftp://host:port/..., or air://host:port/...")]
    Location(String),

    /// A network-backed call (FTP or remote agent) failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A conflicting key could not be backed up before overwrite.
    #[error("conflict on '{key}' could not be backed up to {}", backup_dir.display())]
    Conflict { key: String, backup_dir: PathBuf },

    /// The snapshot file is missing, malformed, or inconsistent.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<suppaftp::FtpError> for SyncError {
    fn from(err: suppaftp::FtpError) -> Self {
        SyncError::Transport(format!("ftp: {err}"))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Snapshot(format!("json: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

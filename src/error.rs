use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapError {
    /// Something the user must fix before any work starts.
    #[error("{0}")]
    Precondition(String),

    #[error("server version {found} is not supported; snapshot export needs at least {required}")]
    UnsupportedVersion { found: String, required: &'static str },

    #[error(
        "server {found} is a hot standby; exporting a snapshot from a standby needs at least {required}"
    )]
    StandbyVersion { found: String, required: &'static str },

    #[error("cannot connect to database '{database}': {message}")]
    Connect { database: String, message: String },

    #[error("{context}: {message}")]
    Session { context: String, message: String },

    #[error("failed to launch {tool}: {source}")]
    ToolSpawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed ({status})")]
    ToolFailed { tool: String, status: ExitStatus },

    #[error("invalid artifact {}: {reason}", .path.display())]
    InvalidArtifact { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SnapError {
    pub fn session(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        SnapError::Session {
            context: context.into(),
            message: err.to_string(),
        }
    }
}

pub type Result<T, E = SnapError> = std::result::Result<T, E>;

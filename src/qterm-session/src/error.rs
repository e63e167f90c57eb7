//! Error types for sessions and backends.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::trust::TrustError;

/// Session and backend error type.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The local shell or its PTY could not be created.
    #[error("{0}")]
    Spawn(String),

    /// The SSH private key could not be read or parsed.
    #[error("failed to load SSH key {}: {reason}", path.display())]
    Credential { path: PathBuf, reason: String },

    /// Network, handshake or authentication failure.
    #[error("failed to connect to {addr}: {reason}")]
    Dial { addr: String, reason: String },

    /// Host key verification rejected the remote host.
    #[error(transparent)]
    Trust(#[from] TrustError),

    /// Connected, but the remote shell could not be started.
    #[error("failed to start remote shell: {0}")]
    ShellStart(String),

    /// No backend is attached to the session.
    #[error("no active backend")]
    NoBackend,

    /// The backend's output stream was handed to another reader.
    #[error("backend output is already attached to a reader")]
    OutputTaken,

    /// Terminal dimensions must both be non-zero.
    #[error("invalid terminal size {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },

    /// I/O failure on the active backend.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Whether the error came from host key verification.
    pub fn is_trust_failure(&self) -> bool {
        matches!(self, Self::Trust(_))
    }
}

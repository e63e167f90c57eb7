//! Error types for terminal channels.

use qterm_protocol::ProtocolError;
use qterm_session::SessionError;
use thiserror::Error;

/// Failure while handling one inbound frame.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The frame could not be decoded. Recoverable.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session operation failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The outbound half of the connection is gone.
    #[error("connection closed")]
    Closed,
}

impl ChannelError {
    /// Whether the connection must be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Result type for channel handling.
pub type ChannelResult<T> = Result<T, ChannelError>;

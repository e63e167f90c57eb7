//! The message frame tagged union and its JSON encoding.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signal::{PlacementHint, SignalKind};
use crate::target::BackendTarget;

/// One self-describing message on the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Bytes to write to the active backend.
    Input {
        #[serde(default)]
        data: String,
    },
    /// Backend output, chunked by the output pump.
    Output { data: String },
    /// New terminal dimensions.
    Resize { cols: u16, rows: u16 },
    /// Switch the session to another backend.
    Connect {
        #[serde(default)]
        target: BackendTarget,
    },
    /// A detected command-boundary classification.
    Signal { kind: SignalKind, x: i32, y: i32 },
}

impl Frame {
    /// Decodes a frame from its JSON text.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encodes the frame as JSON text.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Backend output frame.
    pub fn output(data: impl Into<String>) -> Self {
        Self::Output { data: data.into() }
    }

    /// Human-readable diagnostic rendered as red terminal output.
    pub fn diagnostic(message: impl fmt::Display) -> Self {
        Self::Output {
            data: format!("\r\n\x1b[31m{message}\x1b[0m\r\n"),
        }
    }

    /// Signal frame carrying a placement hint for the front end.
    pub fn signal(kind: SignalKind, placement: PlacementHint) -> Self {
        Self::Signal {
            kind,
            x: placement.x,
            y: placement.y,
        }
    }

    /// Wire name of the frame type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Input { .. } => "input",
            Self::Output { .. } => "output",
            Self::Resize { .. } => "resize",
            Self::Connect { .. } => "connect",
            Self::Signal { .. } => "signal",
        }
    }
}

/// The subset of frames a client is allowed to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Input { data: Vec<u8> },
    Resize { cols: u16, rows: u16 },
    Connect { target: BackendTarget },
}

impl ClientFrame {
    /// Decodes a client frame, rejecting server-only frame types.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Frame::parse(text)?.try_into()
    }
}

impl TryFrom<Frame> for ClientFrame {
    type Error = ProtocolError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        match frame {
            Frame::Input { data } => Ok(Self::Input {
                data: data.into_bytes(),
            }),
            Frame::Resize { cols, rows } => Ok(Self::Resize { cols, rows }),
            Frame::Connect { target } => Ok(Self::Connect { target }),
            other => Err(ProtocolError::ServerOnly(other.type_name())),
        }
    }
}

/// Errors decoding or encoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The text is not a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A client sent a frame type only the server may send.
    #[error("frame type `{0}` is not accepted from clients")]
    ServerOnly(&'static str),
}

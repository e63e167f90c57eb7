//! qterm Protocol - frames exchanged over the terminal message channel
//!
//! Every WebSocket message carries exactly one JSON-encoded [`Frame`],
//! discriminated by its `"type"` field. Clients send `input`, `resize` and
//! `connect`; the server sends `output` and `signal`.

pub mod frame;
pub mod signal;
pub mod target;

#[cfg(test)]
mod tests;

// Re-exports
pub use frame::{ClientFrame, Frame, ProtocolError};
pub use signal::{PlacementHint, SignalKind};
pub use target::BackendTarget;

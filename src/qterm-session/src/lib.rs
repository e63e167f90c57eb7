//! qterm Session - one terminal backend at a time, local or remote.
//!
//! This crate provides:
//! - [`Session`], which owns the active backend and switches between them
//! - [`Backend`], the local PTY / remote SSH sum type behind a session
//! - [`KnownHostsFile`] and the [`HostKeyStore`] trust-on-first-use policy
//! - [`LineDetector`], which classifies completed output lines

pub mod backend;
pub mod config;
pub mod error;
pub mod session;
pub mod signal;
pub mod trust;

pub use backend::{Backend, LocalBackend, OutputStream, RemoteBackend};
pub use config::{RemoteTarget, SessionConfig, TrustConfig, expand_path};
pub use error::SessionError;
pub use qterm_protocol::BackendTarget;
pub use session::Session;
pub use signal::{LineDetector, PrefixBoundary, SignalRule, SignalTable};
pub use trust::{
    HostKey, HostKeyStore, KnownHostsFile, MemoryTrustStore, TrustEntry, TrustError,
    TrustPolicy, Verification, canonical_host,
};

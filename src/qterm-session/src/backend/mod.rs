//! Terminal backends: a local PTY shell or a remote SSH shell.

mod local;
mod remote;

use std::io;

use bytes::{Buf, Bytes};
use qterm_protocol::BackendTarget;
use tokio::sync::mpsc;

pub use local::LocalBackend;
pub use remote::{REMOTE_TERM, RemoteBackend};

use crate::error::SessionError;

/// Output of a backend, delivered in arrival order.
///
/// `read` returns `Ok(0)` once the backend has no more output.
#[derive(Debug)]
pub struct OutputStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    pending: Bytes,
}

impl OutputStream {
    pub fn new(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
        }
    }

    /// Reads up to `buf.len()` bytes. Cancel safe: no data is lost if the future is dropped.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pending.is_empty() {
            match self.rx.recv().await {
                Some(Ok(chunk)) => self.pending = chunk,
                Some(Err(e)) => return Err(e),
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

/// The backend a session is bridged to.
pub enum Backend {
    Local(LocalBackend),
    Remote(RemoteBackend),
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind())
            .field("dimensions", &self.dimensions())
            .finish()
    }
}

impl Backend {
    pub fn kind(&self) -> BackendTarget {
        match self {
            Self::Local(_) => BackendTarget::Local,
            Self::Remote(_) => BackendTarget::Remote,
        }
    }

    fn output_slot(&mut self) -> &mut Option<OutputStream> {
        match self {
            Self::Local(local) => &mut local.output,
            Self::Remote(remote) => &mut remote.output,
        }
    }

    /// Detaches the output stream so it can be read concurrently with writes.
    pub fn take_output(&mut self) -> Result<OutputStream, SessionError> {
        self.output_slot().take().ok_or(SessionError::OutputTaken)
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        let output = self
            .output_slot()
            .as_mut()
            .ok_or(SessionError::OutputTaken)?;
        Ok(output.read(buf).await?)
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize, SessionError> {
        match self {
            Self::Local(local) => local.write(data).await,
            Self::Remote(remote) => remote.write(data).await,
        }
    }

    pub async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        match self {
            Self::Local(local) => local.resize(cols, rows),
            Self::Remote(remote) => remote.resize(cols, rows).await,
        }
    }

    /// Last dimensions applied to the terminal.
    pub fn dimensions(&self) -> (u16, u16) {
        match self {
            Self::Local(local) => local.dimensions(),
            Self::Remote(remote) => remote.dimensions(),
        }
    }

    /// Releases the backend. Safe to call more than once.
    pub async fn close(&mut self) {
        match self {
            Self::Local(local) => local.close(),
            Self::Remote(remote) => remote.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_output_stream_splits_chunks() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = OutputStream::new(rx);
        tx.send(Ok(Bytes::from_static(b"hello world"))).await.unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf, b" worl");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 1);
        assert_eq!(&buf[..1], b"d");
    }

    #[tokio::test]
    async fn test_output_stream_eof_and_errors() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = OutputStream::new(rx);
        tx.send(Ok(Bytes::new())).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"x"))).await.unwrap();
        tx.send(Err(io::Error::other("boom"))).await.unwrap();
        drop(tx);

        let mut buf = [0u8; 8];
        // Empty chunks are skipped rather than reported as end of stream.
        assert_eq!(stream.read(&mut buf).await.unwrap(), 1);
        assert_eq!(stream.read(&mut buf).await.unwrap_err().to_string(), "boom");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }
}

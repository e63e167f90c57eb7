//! Local backend: a shell on a pseudo-terminal.

use std::io;

use qterm_pty::{DEFAULT_COLS, DEFAULT_ROWS, PtyProcess};
use tracing::{debug, info};

use super::OutputStream;
use crate::error::SessionError;

/// A local shell process on its own PTY, stdout and stderr merged.
#[derive(Debug)]
pub struct LocalBackend {
    process: PtyProcess,
    pub(super) output: Option<OutputStream>,
    dimensions: (u16, u16),
    closed: bool,
}

impl LocalBackend {
    /// Starts `shell` on a new 80x24 PTY.
    pub fn spawn(shell: &str) -> Result<Self, SessionError> {
        let mut process =
            PtyProcess::spawn(shell).map_err(|e| SessionError::Spawn(format!("{e:#}")))?;
        let output = process.take_output().map(OutputStream::new);
        info!(pid = ?process.pid(), shell = %shell, "local backend started");

        Ok(Self {
            process,
            output,
            dimensions: (DEFAULT_COLS, DEFAULT_ROWS),
            closed: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize, SessionError> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "local shell closed").into());
        }
        self.process.write(data.to_vec()).await?;
        Ok(data.len())
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.process
            .resize(cols, rows)
            .map_err(|e| io::Error::other(format!("{e:#}")))?;
        self.dimensions = (cols, rows);
        debug!(cols, rows, "local PTY resized");
        Ok(())
    }

    pub fn dimensions(&self) -> (u16, u16) {
        self.dimensions
    }

    /// Kills the shell. Its output stream ends once the PTY hangs up.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.process.kill();
        info!(pid = ?self.process.pid(), "local backend closed");
    }
}

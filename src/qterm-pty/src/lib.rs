//! PTY utilities for qterm.
//!
//! This crate provides the pseudo-terminal (PTY) plumbing behind qterm's local
//! backend: spawning a shell attached to a freshly allocated PTY, draining its
//! output on a blocking reader thread, and forwarding writes and resizes.
//!
//! # Features
//!
//! - Cross-platform PTY support via `portable-pty`
//! - Async-ready with Tokio integration (output arrives on an `mpsc` channel)
//! - Kill-and-reap teardown that unblocks any pending reader
//!
//! # Example
//!
//! ```ignore
//! use qterm_pty::{PtyProcess, default_shell};
//!
//! let mut process = PtyProcess::spawn(&default_shell())?;
//! let mut output = process.take_output().expect("output not yet taken");
//! process.write(b"echo hello\n".to_vec()).await?;
//! ```

mod process;

pub use portable_pty::PtySize;

pub use process::{OUTPUT_CHANNEL_CAPACITY, PtyOutput, PtyProcess, READ_BUFFER_SIZE};

/// Default terminal width in columns.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height in rows.
pub const DEFAULT_ROWS: u16 = 24;

/// Default PTY size.
///
/// A newly spawned shell keeps these dimensions until the first resize.
#[must_use]
pub fn default_pty_size() -> PtySize {
    pty_size(DEFAULT_COLS, DEFAULT_ROWS)
}

/// Builds a `PtySize` with no pixel dimensions.
#[must_use]
pub fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Returns the default shell for the current platform.
///
/// - **Windows**: `COMSPEC` or `cmd.exe`
/// - **Unix**: `SHELL` environment variable or `/bin/bash`
#[must_use]
pub fn default_shell() -> String {
    #[cfg(target_os = "windows")]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("SHELL")
            .ok()
            .filter(|shell| !shell.trim().is_empty())
            .unwrap_or_else(|| "/bin/bash".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pty_size() {
        let size = default_pty_size();
        assert_eq!(size.cols, DEFAULT_COLS);
        assert_eq!(size.rows, DEFAULT_ROWS);
        assert_eq!(size.pixel_width, 0);
        assert_eq!(size.pixel_height, 0);
    }

    #[test]
    fn test_pty_size_orders_fields() {
        let size = pty_size(132, 43);
        assert_eq!(size.cols, 132);
        assert_eq!(size.rows, 43);
    }

    #[test]
    fn test_default_shell_not_empty() {
        let shell = default_shell();
        assert!(!shell.is_empty(), "Default shell should not be empty");
    }
}

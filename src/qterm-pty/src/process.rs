//! A shell process attached to its own PTY.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{default_pty_size, pty_size};

/// Size of a single blocking read from the PTY master.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Number of read chunks buffered between the reader thread and its consumer.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// EIO on Linux and macOS: the slave side hung up.
const EIO: i32 = 5;

/// Receiving half of a PTY's output.
///
/// The channel closes once the shell exits and the master reports end of
/// stream. A read failure is delivered as a final `Err` item.
pub type PtyOutput = mpsc::Receiver<io::Result<Bytes>>;

/// A shell process running on a pseudo-terminal.
pub struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    child: Option<Box<dyn Child + Send + Sync>>,
    output: Option<PtyOutput>,
    pid: Option<u32>,
    killed: bool,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .field("killed", &self.killed)
            .finish()
    }
}

impl PtyProcess {
    /// Spawns `shell` on a new PTY of the default size.
    ///
    /// # Errors
    ///
    /// Returns an error if the PTY cannot be allocated or the shell cannot be
    /// started on it.
    pub fn spawn(shell: &str) -> anyhow::Result<Self> {
        let pair = native_pty_system()
            .openpty(default_pty_size())
            .map_err(|e| anyhow!("failed to start PTY: {e}"))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| anyhow!("failed to spawn {shell}: {e}"))?;
        // The child holds its own slave handle; ours must go so that the
        // reader observes hang-up when the shell exits.
        drop(pair.slave);

        let killer = child.clone_killer();
        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| anyhow!("failed to clone PTY reader: {e}"))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| anyhow!("failed to take PTY writer: {e}"))?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        std::thread::Builder::new()
            .name("qterm-pty-reader".to_string())
            .spawn(move || read_loop(reader, tx))?;

        debug!(pid = ?pid, shell = %shell, "spawned shell on PTY");

        Ok(Self {
            master: pair.master,
            writer: Arc::new(Mutex::new(writer)),
            killer,
            child: Some(child),
            output: Some(rx),
            pid,
            killed: false,
        })
    }

    /// Process id of the shell, when the platform reports one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Takes the output channel. Returns `None` once taken.
    pub fn take_output(&mut self) -> Option<PtyOutput> {
        self.output.take()
    }

    /// Writes `data` to the PTY master and flushes it.
    ///
    /// The returned future does not borrow `self`, so it stays `Send` even
    /// though the PTY master is not `Sync`.
    pub fn write(&self, data: Vec<u8>) -> impl Future<Output = io::Result<()>> + Send + 'static {
        let writer = Arc::clone(&self.writer);
        async move {
            tokio::task::spawn_blocking(move || {
                let mut writer = writer.lock();
                writer.write_all(&data)?;
                writer.flush()
            })
            .await
            .map_err(io::Error::other)?
        }
    }

    /// Changes the terminal dimensions.
    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        self.master
            .resize(pty_size(cols, rows))
            .map_err(|e| anyhow!("failed to resize PTY to {cols}x{rows}: {e}"))
    }

    /// Current terminal dimensions as reported by the PTY.
    pub fn size(&self) -> anyhow::Result<PtySize> {
        self.master
            .get_size()
            .map_err(|e| anyhow!("failed to query PTY size: {e}"))
    }

    /// Kills the shell and reaps it in the background.
    ///
    /// Safe to call more than once. The shell gets SIGHUP first and SIGKILL
    /// when it is still running shortly after. Its exit closes the slave
    /// side, which makes the reader thread finish and the output channel close.
    pub fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;

        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = self.pid;
        let reaper = std::thread::Builder::new()
            .name("qterm-pty-reaper".to_string())
            .spawn(move || {
                // Owned-child kill escalates from SIGHUP to SIGKILL.
                if let Err(e) = child.kill() {
                    // Already exited on its own.
                    debug!(pid = ?pid, error = %e, "kill on PTY shell failed");
                }
                match child.wait() {
                    Ok(status) => debug!(pid = ?pid, code = status.exit_code(), "shell reaped"),
                    Err(e) => debug!(pid = ?pid, error = %e, "failed to reap shell"),
                }
            });
        if let Err(e) = reaper {
            warn!(pid = ?self.pid, error = %e, "failed to start reaper thread, sending hang-up only");
            if let Err(e) = self.killer.kill() {
                debug!(pid = ?self.pid, error = %e, "kill on PTY shell failed");
            }
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<io::Result<Bytes>>) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    // Consumer is gone.
                    break;
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.raw_os_error() == Some(EIO) => break,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                break;
            }
        }
    }
    debug!("PTY reader finished");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn collect_until(output: &mut PtyOutput, needle: &str) -> String {
        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !seen.contains(needle) {
            let chunk = tokio::time::timeout_at(deadline, output.recv())
                .await
                .expect("timed out waiting for PTY output")
                .expect("PTY output closed early")
                .expect("PTY read failed");
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
        seen
    }

    #[tokio::test]
    async fn test_spawn_echo_roundtrip() {
        let mut process = PtyProcess::spawn("/bin/sh").unwrap();
        let mut output = process.take_output().unwrap();
        assert!(process.take_output().is_none());

        process.write(b"echo pty-marker-$((20+22))\n".to_vec()).await.unwrap();
        let seen = collect_until(&mut output, "pty-marker-42").await;
        assert!(seen.contains("pty-marker-42"));
    }

    #[tokio::test]
    async fn test_resize_reports_last_size() {
        let process = PtyProcess::spawn("/bin/sh").unwrap();
        process.resize(100, 30).unwrap();
        process.resize(132, 43).unwrap();
        let size = process.size().unwrap();
        assert_eq!((size.cols, size.rows), (132, 43));
    }

    #[tokio::test]
    async fn test_kill_closes_output() {
        let mut process = PtyProcess::spawn("/bin/sh").unwrap();
        let mut output = process.take_output().unwrap();
        process.kill();
        process.kill();

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(item) = output.recv().await {
                if item.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "output should close after kill");
    }

    #[cfg(unix)]
    fn process_alive(pid: u32) -> bool {
        std::process::Command::new("sh")
            .args(["-c", &format!("kill -0 {pid} 2>/dev/null")])
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_escalates_when_hangup_ignored() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("stubborn-shell");
        std::fs::write(
            &script,
            "#!/bin/sh\ntrap '' HUP\necho hup-ignored\nwhile :; do sleep 1; done\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut process = PtyProcess::spawn(script.to_str().unwrap()).unwrap();
        let mut output = process.take_output().unwrap();
        collect_until(&mut output, "hup-ignored").await;
        let pid = process.pid().unwrap();
        assert!(process_alive(pid));

        process.kill();
        drop(process);

        let gone = tokio::time::timeout(Duration::from_secs(5), async {
            while process_alive(pid) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        assert!(gone.is_ok(), "shell {pid} still running after kill");
    }

    #[test]
    fn test_spawn_missing_shell_fails() {
        let result = PtyProcess::spawn("/nonexistent/qterm-shell");
        assert!(result.is_err());
    }
}

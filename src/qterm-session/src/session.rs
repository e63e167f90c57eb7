//! A terminal session bridged to at most one backend at a time.

use std::sync::Arc;

use qterm_protocol::BackendTarget;
use tracing::{error, info, warn};

use crate::backend::{Backend, LocalBackend, OutputStream, RemoteBackend};
use crate::config::{RemoteTarget, SessionConfig};
use crate::error::SessionError;
use crate::trust::{HostKeyStore, KnownHostsFile};

/// Owns the active backend. Opening a backend always closes the previous one first.
pub struct Session {
    config: SessionConfig,
    trust: Arc<dyn HostKeyStore>,
    backend: Option<Backend>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("shell", &self.config.shell)
            .field("backend", &self.backend)
            .finish()
    }
}

impl Session {
    /// Session whose trust store is the configured known-hosts file.
    pub fn new(config: SessionConfig) -> Self {
        let trust = Arc::new(KnownHostsFile::new(config.trust.known_hosts_path()));
        Self::with_trust_store(config, trust)
    }

    pub fn with_trust_store(config: SessionConfig, trust: Arc<dyn HostKeyStore>) -> Self {
        Self {
            config,
            trust,
            backend: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Kind of the active backend, if any.
    pub fn kind(&self) -> Option<BackendTarget> {
        self.backend.as_ref().map(Backend::kind)
    }

    pub fn is_active(&self) -> bool {
        self.backend.is_some()
    }

    /// Starts the configured shell on a local PTY.
    pub async fn open_local(&mut self) -> Result<(), SessionError> {
        self.close().await;
        let backend = LocalBackend::spawn(&self.config.shell)?;
        self.backend = Some(Backend::Local(backend));
        Ok(())
    }

    /// Opens a shell on `target` over SSH.
    pub async fn open_remote(&mut self, target: &RemoteTarget) -> Result<(), SessionError> {
        self.close().await;
        let backend = RemoteBackend::connect(
            target,
            Arc::clone(&self.trust),
            self.config.trust.policy(),
            self.config.connect_timeout,
        )
        .await?;
        self.backend = Some(Backend::Remote(backend));
        Ok(())
    }

    /// Replaces the active backend with one of kind `target`.
    ///
    /// The old backend is closed before the new one is opened. A failed remote
    /// open falls back to a local shell and still returns the remote error;
    /// use [`Session::kind`] to see what ended up active. Returns the kind
    /// that is active on success.
    pub async fn switch_to(&mut self, target: BackendTarget) -> Result<BackendTarget, SessionError> {
        self.close().await;
        match target {
            BackendTarget::Local => {
                self.open_local().await?;
                Ok(BackendTarget::Local)
            }
            BackendTarget::Remote => {
                let remote = self.config.remote_target();
                match self.open_remote(&remote).await {
                    Ok(()) => Ok(BackendTarget::Remote),
                    Err(err) => {
                        warn!(addr = %remote.address(), error = %err, "remote backend failed, falling back to local shell");
                        if let Err(fallback) = self.open_local().await {
                            error!(error = %fallback, "local fallback failed, session has no backend");
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    fn backend_mut(&mut self) -> Result<&mut Backend, SessionError> {
        self.backend.as_mut().ok_or(SessionError::NoBackend)
    }

    /// Reads backend output. `Ok(0)` means the backend ended.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        self.backend_mut()?.read(buf).await
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize, SessionError> {
        self.backend_mut()?.write(data).await
    }

    /// Applies new dimensions. Zero in either dimension is rejected.
    pub async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidSize { cols, rows });
        }
        self.backend_mut()?.resize(cols, rows).await
    }

    /// Last dimensions applied to the active backend.
    pub fn dimensions(&self) -> Option<(u16, u16)> {
        self.backend.as_ref().map(Backend::dimensions)
    }

    /// Detaches the active backend's output for a concurrent reader.
    pub fn take_output(&mut self) -> Result<OutputStream, SessionError> {
        self.backend_mut()?.take_output()
    }

    /// Closes the active backend, if any.
    pub async fn close(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            let kind = backend.kind();
            backend.close().await;
            info!(backend = %kind, "backend released");
        }
    }
}

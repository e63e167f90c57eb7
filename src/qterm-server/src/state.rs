//! Application state management.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use qterm_session::{HostKeyStore, KnownHostsFile, Session, SignalTable};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ServerConfig;

/// Application state shared across request handlers.
pub struct AppState {
    /// Server configuration.
    pub config: ServerConfig,
    /// Host key store shared by every connection's remote opens.
    trust: Arc<dyn HostKeyStore>,
    /// Signal table compiled once from the configuration.
    signal_table: Arc<SignalTable>,
    /// Cancelled when the server shuts down; every connection holds a child.
    shutdown: CancellationToken,
    /// Open terminal channels.
    connections: Arc<AtomicUsize>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("connections", &self.active_connections())
            .finish()
    }
}

impl AppState {
    /// State whose trust store is the configured known-hosts file.
    pub fn new(config: ServerConfig) -> Self {
        let trust = Arc::new(KnownHostsFile::new(config.trust.known_hosts_path()));
        Self::with_trust_store(config, trust)
    }

    pub fn with_trust_store(config: ServerConfig, trust: Arc<dyn HostKeyStore>) -> Self {
        let signal_table = Arc::new(config.signals.table());
        Self {
            config,
            trust,
            signal_table,
            shutdown: CancellationToken::new(),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A fresh, empty session for a new connection.
    pub fn new_session(&self) -> Session {
        Session::with_trust_store(self.config.session_config(), Arc::clone(&self.trust))
    }

    pub fn signal_table(&self) -> Arc<SignalTable> {
        Arc::clone(&self.signal_table)
    }

    /// Token cancelled on server shutdown.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Counts a connection until the returned guard is dropped.
    pub fn track_connection(&self) -> ConnectionGuard {
        self.connections.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            connections: Arc::clone(&self.connections),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Cancels every connection and waits, up to `timeout`, for them to finish teardown.
    pub async fn shutdown_connections(&self, timeout: Duration) {
        self.shutdown.cancel();

        let drained = tokio::time::timeout(timeout, async {
            while self.active_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        match drained {
            Ok(()) => info!("all terminal channels closed"),
            Err(_) => warn!(
                remaining = self.active_connections(),
                "terminal channels still open after shutdown timeout"
            ),
        }
    }
}

/// Decrements the connection count on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    connections: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qterm_session::MemoryTrustStore;

    fn state() -> AppState {
        AppState::with_trust_store(ServerConfig::default(), Arc::new(MemoryTrustStore::new()))
    }

    #[test]
    fn test_connection_tracking() {
        let state = state();
        assert_eq!(state.active_connections(), 0);

        let first = state.track_connection();
        let second = state.track_connection();
        assert_eq!(state.active_connections(), 2);

        drop(first);
        assert_eq!(state.active_connections(), 1);
        drop(second);
        assert_eq!(state.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_children() {
        let state = state();
        let child = state.shutdown_token().child_token();
        let guard = state.track_connection();

        let waiter = tokio::spawn(async move {
            child.cancelled().await;
            drop(guard);
        });

        state.shutdown_connections(Duration::from_secs(5)).await;
        assert_eq!(state.active_connections(), 0);
        waiter.await.unwrap();
    }

    #[test]
    fn test_debug_reports_open_connections() {
        let state = state();
        let _guard = state.track_connection();
        let rendered = format!("{state:?}");
        assert!(rendered.contains("connections: 1"), "{rendered}");
    }

    #[test]
    fn test_new_session_is_empty() {
        let session = state().new_session();
        assert!(session.kind().is_none());
    }
}

//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::ensure;
use qterm_protocol::PlacementHint;
use qterm_session::signal::{DEFAULT_MAX_LINE_LEN, default_rules};
use qterm_session::{PrefixBoundary, RemoteTarget, SessionConfig, SignalRule, SignalTable, TrustConfig};
use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Program started for local backends.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Remote target used when `remote_config` is unset or unreadable.
    #[serde(default, alias = "droplet")]
    pub remote: RemoteTarget,

    /// JSON file with a `remote` (or `droplet`) section, re-read on every
    /// remote connect.
    #[serde(default)]
    pub remote_config: Option<PathBuf>,

    /// Host key trust store.
    #[serde(default)]
    pub trust: TrustConfig,

    /// Output pump flush policy.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Liveness probing.
    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    /// Command signal detection.
    #[serde(default)]
    pub signals: SignalConfig,

    /// Time allowed for the SSH dial and handshake, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_shell() -> String {
    qterm_session::config::default_shell()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            shell: default_shell(),
            remote: RemoteTarget::default(),
            remote_config: None,
            trust: TrustConfig::default(),
            stream: StreamConfig::default(),
            keepalive: KeepaliveConfig::default(),
            signals: SignalConfig::default(),
            connect_timeout: default_connect_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Output pump flush policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Flush a non-empty buffer this often, in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Flush as soon as the buffer holds this many bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_flush_interval_ms() -> u64 {
    50
}

fn default_chunk_size() -> usize {
    4096
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl StreamConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Liveness probing of the message channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Interval between pings.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Connection is dead after this long without any inbound message.
    #[serde(default = "default_read_deadline")]
    pub read_deadline_secs: u64,
    /// Bound on a single outbound write.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

fn default_ping_interval() -> u64 {
    30
}

fn default_read_deadline() -> u64 {
    60
}

fn default_write_timeout() -> u64 {
    10
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            read_deadline_secs: default_read_deadline(),
            write_timeout_secs: default_write_timeout(),
        }
    }
}

impl KeepaliveConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Command signal detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Ordered rules; the first matching prefix wins.
    #[serde(default = "default_rules")]
    pub rules: Vec<SignalRule>,
    #[serde(default)]
    pub boundary: PrefixBoundary,
    /// Longest pending line the detector keeps.
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
    /// Placement hint attached to every signal frame.
    #[serde(default)]
    pub placement: PlacementHint,
}

fn default_max_line_len() -> usize {
    DEFAULT_MAX_LINE_LEN
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            boundary: PrefixBoundary::default(),
            max_line_len: default_max_line_len(),
            placement: PlacementHint::default(),
        }
    }
}

impl SignalConfig {
    pub fn table(&self) -> SignalTable {
        SignalTable::new(self.rules.clone(), self.boundary)
    }
}

impl ServerConfig {
    /// Load configuration from file.
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    fn from_env_with(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(port) = var("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid PORT {port:?}: {e}"))?;
            config.listen_addr = format!("0.0.0.0:{port}");
        }

        if let Some(addr) = var("QTERM_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        if let Some(shell) = var("QTERM_SHELL") {
            config.shell = shell;
        }

        if let Some(path) = var("QTERM_REMOTE_CONFIG") {
            config.remote_config = Some(PathBuf::from(path));
        }

        if let Some(path) = var("QTERM_KNOWN_HOSTS") {
            config.trust.known_hosts = path;
        }

        if let Some(strict) = var("QTERM_STRICT_HOST_KEYS") {
            config.trust.strict = matches!(
                strict.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the pump and keepalive cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.stream.chunk_size > 0, "stream.chunk_size must be positive");
        ensure!(
            self.stream.flush_interval_ms > 0,
            "stream.flush_interval_ms must be positive"
        );
        ensure!(
            self.keepalive.ping_interval_secs > 0,
            "keepalive.ping_interval_secs must be positive"
        );
        ensure!(
            self.keepalive.read_deadline_secs > self.keepalive.ping_interval_secs,
            "keepalive.read_deadline_secs must exceed the ping interval"
        );
        ensure!(
            self.keepalive.write_timeout_secs > 0,
            "keepalive.write_timeout_secs must be positive"
        );
        Ok(())
    }

    /// Settings for the per-connection session.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            shell: self.shell.clone(),
            remote: self.remote.clone(),
            remote_config: self.remote_config.clone(),
            trust: self.trust.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout),
        }
    }

    /// Get shutdown timeout as Duration.
    pub fn shutdown_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

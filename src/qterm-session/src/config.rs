//! Session configuration: the local shell, the remote target and trust policy.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::trust::TrustPolicy;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default time allowed for the network dial and SSH handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// `$VAR` or `${VAR}`.
/// Group 1: braced name, group 2: bare name.
static ENV_VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("env var regex pattern is valid and tested")
});

/// Where and as whom to open a remote shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    /// Remote host name or address. Empty means no remote is configured.
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    /// Private key path; `~` and `$VAR` are expanded when the key is read.
    #[serde(default = "default_key_path", alias = "keyPath")]
    pub key_path: String,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_username() -> String {
    "root".to_string()
}

fn default_key_path() -> String {
    "~/.ssh/id_rsa".to_string()
}

impl Default for RemoteTarget {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: default_username(),
            key_path: default_key_path(),
        }
    }
}

/// Shape of a remote target file. `droplet` is accepted as the section name.
#[derive(Debug, Deserialize)]
struct RemoteTargetFile {
    #[serde(default, alias = "droplet")]
    remote: Option<RemoteTarget>,
}

impl RemoteTarget {
    /// `host:port` for dialing and diagnostics.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Key path with `~` and environment references expanded.
    pub fn resolved_key_path(&self) -> PathBuf {
        expand_path(&self.key_path)
    }

    /// Whether a host has been configured at all.
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty()
    }

    /// Reads the target from a JSON file, falling back when it is missing or invalid.
    pub fn load_or(path: Option<&Path>, fallback: &RemoteTarget) -> RemoteTarget {
        let Some(path) = path else {
            return fallback.clone();
        };

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "remote target file unavailable, using defaults");
                return fallback.clone();
            }
        };

        match serde_json::from_str::<RemoteTargetFile>(&content) {
            Ok(RemoteTargetFile {
                remote: Some(target),
            }) => target,
            Ok(RemoteTargetFile { remote: None }) => fallback.clone(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid remote target file, using defaults");
                fallback.clone()
            }
        }
    }
}

/// Host key trust settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Known-hosts file; `~` and `$VAR` are expanded.
    #[serde(default = "default_known_hosts")]
    pub known_hosts: String,
    /// Reject unknown hosts instead of trusting them on first use.
    #[serde(default)]
    pub strict: bool,
}

fn default_known_hosts() -> String {
    "~/.ssh/quantum_terminal_known_hosts".to_string()
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            known_hosts: default_known_hosts(),
            strict: false,
        }
    }
}

impl TrustConfig {
    pub fn known_hosts_path(&self) -> PathBuf {
        expand_path(&self.known_hosts)
    }

    pub fn policy(&self) -> TrustPolicy {
        if self.strict {
            TrustPolicy::Strict
        } else {
            TrustPolicy::TrustOnFirstUse
        }
    }
}

/// Everything a [`crate::Session`] needs to open backends.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Program launched for local backends.
    pub shell: String,
    /// Remote target used when no target file is configured or readable.
    pub remote: RemoteTarget,
    /// Optional JSON file re-read on every remote attempt.
    pub remote_config: Option<PathBuf>,
    pub trust: TrustConfig,
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            remote: RemoteTarget::default(),
            remote_config: None,
            trust: TrustConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl SessionConfig {
    /// The remote target in effect right now.
    pub fn remote_target(&self) -> RemoteTarget {
        RemoteTarget::load_or(self.remote_config.as_deref(), &self.remote)
    }
}

/// `$SHELL`, falling back to `/bin/bash` (`%COMSPEC%` on Windows).
pub fn default_shell() -> String {
    qterm_pty::default_shell()
}

/// Expands `~`, `$VAR` and `${VAR}` in a path. Unset variables expand to nothing.
pub fn expand_path(path: &str) -> PathBuf {
    expand_path_with(path, |name| std::env::var(name).ok(), dirs::home_dir())
}

fn expand_path_with(
    path: &str,
    lookup: impl Fn(&str) -> Option<String>,
    home: Option<PathBuf>,
) -> PathBuf {
    let trimmed = path.trim();
    let substituted = ENV_VAR_REGEX.replace_all(trimmed, |caps: &regex::Captures<'_>| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        lookup(name).unwrap_or_default()
    });

    match (substituted.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => home.join(rest),
        (None, Some(home)) if substituted == "~" => home,
        _ => PathBuf::from(substituted.as_ref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "HOME" => Some("/home/op".to_string()),
            "KEYS" => Some("keys".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_expand_tilde() {
        let home = Some(PathBuf::from("/home/op"));
        assert_eq!(
            expand_path_with("~/.ssh/id_rsa", lookup, home.clone()),
            PathBuf::from("/home/op/.ssh/id_rsa")
        );
        assert_eq!(expand_path_with("~", lookup, home), PathBuf::from("/home/op"));
    }

    #[test]
    fn test_expand_env_vars() {
        assert_eq!(
            expand_path_with("$HOME/.ssh/${KEYS}/id", lookup, None),
            PathBuf::from("/home/op/.ssh/keys/id")
        );
    }

    #[test]
    fn test_unset_var_expands_to_empty() {
        assert_eq!(
            expand_path_with("/keys/$QTERM_UNSET_VAR/id", lookup, None),
            PathBuf::from("/keys//id")
        );
    }

    #[test]
    fn test_plain_path_untouched() {
        assert_eq!(
            expand_path_with("  /etc/ssh/key  ", lookup, None),
            PathBuf::from("/etc/ssh/key")
        );
    }

    #[test]
    fn test_remote_target_defaults() {
        let target: RemoteTarget = serde_json::from_str(r#"{"host": "203.0.113.7"}"#).unwrap();
        assert_eq!(target.port, 22);
        assert_eq!(target.username, "root");
        assert_eq!(target.key_path, "~/.ssh/id_rsa");
        assert_eq!(target.address(), "203.0.113.7:22");
        assert!(target.is_configured());
        assert!(!RemoteTarget::default().is_configured());
    }

    #[test]
    fn test_load_or_reads_droplet_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"droplet": {"host": "box.example", "port": 2222, "username": "ops", "keyPath": "/keys/ops"}}"#,
        )
        .unwrap();

        let target = RemoteTarget::load_or(Some(&path), &RemoteTarget::default());
        assert_eq!(
            target,
            RemoteTarget {
                host: "box.example".to_string(),
                port: 2222,
                username: "ops".to_string(),
                key_path: "/keys/ops".to_string(),
            }
        );
    }

    #[test]
    fn test_load_or_falls_back() {
        let fallback = RemoteTarget {
            host: "fallback.example".to_string(),
            ..RemoteTarget::default()
        };
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.json");
        assert_eq!(RemoteTarget::load_or(Some(&missing), &fallback), fallback);

        let invalid = dir.path().join("invalid.json");
        std::fs::write(&invalid, "{not json").unwrap();
        assert_eq!(RemoteTarget::load_or(Some(&invalid), &fallback), fallback);

        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, "{}").unwrap();
        assert_eq!(RemoteTarget::load_or(Some(&empty), &fallback), fallback);

        assert_eq!(RemoteTarget::load_or(None, &fallback), fallback);
    }

    #[test]
    fn test_trust_policy() {
        assert_eq!(TrustConfig::default().policy(), TrustPolicy::TrustOnFirstUse);
        let strict = TrustConfig {
            strict: true,
            ..TrustConfig::default()
        };
        assert_eq!(strict.policy(), TrustPolicy::Strict);
    }
}

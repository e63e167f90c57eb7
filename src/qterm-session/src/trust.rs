//! Host key trust: known-hosts storage and the trust-on-first-use policy.
//!
//! Entries are stored one per line in the plain OpenSSH layout
//! `host key-type base64-key`. Hosts on non-default ports are stored as
//! `[host]:port`. Hashed host names and `@` markers are skipped.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::prelude::*;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_SSH_PORT;

/// Host key verification failures. All of them reject the connection.
#[derive(Debug, Error)]
pub enum TrustError {
    /// The host is recorded with a different key.
    #[error(
        "host key for {host} has changed (trusted {expected}, presented {actual}); possible impersonation, refusing to connect"
    )]
    Mismatch {
        host: String,
        expected: String,
        actual: String,
    },

    /// Strict mode and the host has no recorded key.
    #[error("host {host} is not in the trust store (fingerprint {fingerprint}) and strict host key checking is enabled")]
    UnknownHost { host: String, fingerprint: String },

    /// The trust store could not be read or written.
    #[error("trust store {}: {source}", path.display())]
    Store {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The stored key material is not valid base64.
    #[error("invalid host key material: {0}")]
    InvalidKey(String),
}

/// How unknown hosts are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Record the first key seen for a host, reject later changes.
    #[default]
    TrustOnFirstUse,
    /// Reject hosts that are not already recorded.
    Strict,
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// The presented key matches the recorded one.
    Trusted,
    /// The host was unknown and its key has now been recorded.
    Learned { fingerprint: String },
}

/// A public host key: the algorithm name and the wire-encoded key blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    key_type: String,
    blob: Vec<u8>,
}

impl HostKey {
    pub fn new(key_type: impl Into<String>, blob: Vec<u8>) -> Self {
        Self {
            key_type: key_type.into(),
            blob,
        }
    }

    /// Decodes the base64 material column of a known-hosts line.
    pub fn from_base64(key_type: impl Into<String>, material: &str) -> Result<Self, TrustError> {
        let blob = BASE64_STANDARD
            .decode(material.trim())
            .map_err(|e| TrustError::InvalidKey(e.to_string()))?;
        Ok(Self::new(key_type, blob))
    }

    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Base64 key material as written to the known-hosts file.
    pub fn material(&self) -> String {
        BASE64_STANDARD.encode(&self.blob)
    }

    /// OpenSSH-style `SHA256:` fingerprint.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.blob);
        format!("SHA256:{}", BASE64_STANDARD_NO_PAD.encode(digest))
    }
}

/// One recorded host and its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustEntry {
    pub host: String,
    pub key: HostKey,
}

impl TrustEntry {
    pub fn new(host: impl Into<String>, key: HostKey) -> Self {
        Self {
            host: host.into(),
            key,
        }
    }

    pub fn fingerprint(&self) -> String {
        self.key.fingerprint()
    }

    /// Known-hosts line, without the trailing newline.
    pub fn to_line(&self) -> String {
        format!("{} {} {}", self.host, self.key.key_type, self.key.material())
    }

    /// Parses a known-hosts line. A comma-separated host list yields one entry per host.
    pub fn parse_line(line: &str) -> Option<Vec<TrustEntry>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            return None;
        }

        let mut parts = line.split_whitespace();
        let hosts = parts.next()?;
        let key_type = parts.next()?;
        let material = parts.next()?;

        if hosts.starts_with('|') {
            debug!("hashed known-hosts entries are not supported, skipping");
            return None;
        }

        let key = HostKey::from_base64(key_type, material).ok()?;
        Some(
            hosts
                .split(',')
                .filter(|host| !host.is_empty())
                .map(|host| TrustEntry::new(host, key.clone()))
                .collect(),
        )
    }
}

/// Name under which a host is recorded: bare for port 22, `[host]:port` otherwise.
pub fn canonical_host(host: &str, port: u16) -> String {
    if port == DEFAULT_SSH_PORT {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

/// Persistent mapping from host to trusted key.
pub trait HostKeyStore: Send + Sync {
    /// The recorded entry for `host`, if any.
    fn lookup(&self, host: &str) -> Result<Option<TrustEntry>, TrustError>;

    /// Records a new entry.
    fn append(&self, entry: &TrustEntry) -> Result<(), TrustError>;

    /// Checks a presented key against the store, recording it on first use.
    fn verify(
        &self,
        host: &str,
        key: &HostKey,
        policy: TrustPolicy,
    ) -> Result<Verification, TrustError> {
        verify_on_first_use(self, host, key, policy)
    }
}

fn verify_on_first_use<S: HostKeyStore + ?Sized>(
    store: &S,
    host: &str,
    key: &HostKey,
    policy: TrustPolicy,
) -> Result<Verification, TrustError> {
    match store.lookup(host)? {
        Some(entry) if entry.key == *key => {
            debug!(host, "host key matches trust store");
            Ok(Verification::Trusted)
        }
        Some(entry) => Err(TrustError::Mismatch {
            host: host.to_string(),
            expected: entry.fingerprint(),
            actual: key.fingerprint(),
        }),
        None => {
            let fingerprint = key.fingerprint();
            if policy == TrustPolicy::Strict {
                return Err(TrustError::UnknownHost {
                    host: host.to_string(),
                    fingerprint,
                });
            }

            warn!(
                host,
                fingerprint = %fingerprint,
                key_type = key.key_type(),
                "trusting unknown host key on first use"
            );
            store.append(&TrustEntry::new(host, key.clone()))?;
            info!(host, "host key added to trust store");
            Ok(Verification::Learned { fingerprint })
        }
    }
}

/// Known-hosts file on disk. The directory is created `0700` and the file `0600`.
#[derive(Debug)]
pub struct KnownHostsFile {
    path: PathBuf,
    // Held across lookup + append so concurrent first connections record one entry.
    lock: Mutex<()>,
}

impl KnownHostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All parseable entries, in file order. A missing file has none.
    pub fn entries(&self) -> Result<Vec<TrustEntry>, TrustError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.store_error(e)),
        };

        let mut entries = Vec::new();
        for (index, line) in content.lines().enumerate() {
            match TrustEntry::parse_line(line) {
                Some(parsed) => entries.extend(parsed),
                None if !line.trim().is_empty() && !line.trim_start().starts_with('#') => {
                    debug!(
                        path = %self.path.display(),
                        line = index + 1,
                        "skipping unparseable known-hosts line"
                    );
                }
                None => {}
            }
        }
        Ok(entries)
    }

    /// Creates the parent directory and an empty file when missing.
    pub fn ensure_exists(&self) -> Result<(), TrustError> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                create_private_dir(parent).map_err(|e| self.store_error(e))?;
            }
            _ => {}
        }
        open_private_append(&self.path).map_err(|e| self.store_error(e))?;
        Ok(())
    }

    fn store_error(&self, source: io::Error) -> TrustError {
        TrustError::Store {
            path: self.path.clone(),
            source,
        }
    }
}

impl HostKeyStore for KnownHostsFile {
    fn lookup(&self, host: &str) -> Result<Option<TrustEntry>, TrustError> {
        Ok(self.entries()?.into_iter().find(|entry| entry.host == host))
    }

    fn append(&self, entry: &TrustEntry) -> Result<(), TrustError> {
        self.ensure_exists()?;
        let mut file = open_private_append(&self.path).map_err(|e| self.store_error(e))?;
        writeln!(file, "{}", entry.to_line()).map_err(|e| self.store_error(e))?;
        file.sync_all().map_err(|e| self.store_error(e))?;
        debug!(path = %self.path.display(), host = %entry.host, "appended known-hosts entry");
        Ok(())
    }

    fn verify(
        &self,
        host: &str,
        key: &HostKey,
        policy: TrustPolicy,
    ) -> Result<Verification, TrustError> {
        let _guard = self.lock.lock();
        self.ensure_exists()?;
        verify_on_first_use(self, host, key, policy)
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

#[cfg(unix)]
fn open_private_append(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private_append(path: &Path) -> io::Result<fs::File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// In-memory store, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    entries: Mutex<Vec<TrustEntry>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<TrustEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    pub fn entries(&self) -> Vec<TrustEntry> {
        self.entries.lock().clone()
    }
}

impl HostKeyStore for MemoryTrustStore {
    fn lookup(&self, host: &str) -> Result<Option<TrustEntry>, TrustError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .find(|entry| entry.host == host)
            .cloned())
    }

    fn append(&self, entry: &TrustEntry) -> Result<(), TrustError> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

//! Command line detection on backend output.
//!
//! [`LineDetector`] accumulates printable bytes into a pending line and,
//! when the line is terminated, classifies it against an ordered
//! [`SignalTable`]. The first matching rule wins.

use std::sync::Arc;

use qterm_protocol::SignalKind;
use serde::{Deserialize, Serialize};

/// Longest pending line kept by default.
pub const DEFAULT_MAX_LINE_LEN: usize = 4096;

const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;

/// A prefix and the signal it produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRule {
    pub prefix: String,
    pub kind: SignalKind,
}

impl SignalRule {
    pub fn new(prefix: impl Into<String>, kind: SignalKind) -> Self {
        Self {
            prefix: prefix.into(),
            kind,
        }
    }
}

/// How a prefix must end to match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefixBoundary {
    /// Plain byte prefix: `git` matches `gitk`.
    #[default]
    Literal,
    /// Prefix must be followed by whitespace or end of line.
    Token,
}

/// The built-in command table.
pub fn default_rules() -> Vec<SignalRule> {
    vec![
        SignalRule::new("ls", SignalKind::MatrixRain),
        SignalRule::new("cd", SignalKind::WormholePortal),
        SignalRule::new("rm -rf", SignalKind::QuantumExplosion),
        SignalRule::new("git", SignalKind::DnaHelix),
        SignalRule::new("sudo", SignalKind::GlitchText),
        SignalRule::new("python", SignalKind::NeuralNetwork),
        SignalRule::new("vim", SignalKind::CosmicRays),
        SignalRule::new("make", SignalKind::ParticleFountain),
        SignalRule::new("history", SignalKind::TimeWarp),
        SignalRule::new("ssh", SignalKind::QuantumTunnel),
    ]
}

/// Ordered prefix table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalTable {
    rules: Vec<SignalRule>,
    boundary: PrefixBoundary,
}

impl Default for SignalTable {
    fn default() -> Self {
        Self::new(default_rules(), PrefixBoundary::default())
    }
}

impl SignalTable {
    /// Builds a table; rules with an empty prefix are dropped.
    pub fn new(rules: Vec<SignalRule>, boundary: PrefixBoundary) -> Self {
        Self {
            rules: rules
                .into_iter()
                .filter(|rule| !rule.prefix.is_empty())
                .collect(),
            boundary,
        }
    }

    pub fn rules(&self) -> &[SignalRule] {
        &self.rules
    }

    pub fn boundary(&self) -> PrefixBoundary {
        self.boundary
    }

    /// First rule whose prefix starts `line`.
    pub fn classify(&self, line: &[u8]) -> Option<SignalKind> {
        self.rules
            .iter()
            .find(|rule| self.matches(line, rule.prefix.as_bytes()))
            .map(|rule| rule.kind)
    }

    fn matches(&self, line: &[u8], prefix: &[u8]) -> bool {
        if !line.starts_with(prefix) {
            return false;
        }
        match self.boundary {
            PrefixBoundary::Literal => true,
            PrefixBoundary::Token => line
                .get(prefix.len())
                .is_none_or(|next| next.is_ascii_whitespace()),
        }
    }
}

/// Per-stream line accumulator.
#[derive(Debug, Clone)]
pub struct LineDetector {
    table: Arc<SignalTable>,
    line: Vec<u8>,
    max_len: usize,
    // Printable bytes past `max_len`, consumed first by erase.
    overflow: usize,
}

impl LineDetector {
    pub fn new(table: Arc<SignalTable>, max_len: usize) -> Self {
        Self {
            table,
            line: Vec::new(),
            max_len: max_len.max(1),
            overflow: 0,
        }
    }

    /// Feeds output bytes, returning the signals for every line completed.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SignalKind> {
        let mut signals = Vec::new();
        for &byte in bytes {
            match byte {
                b'\n' | b'\r' => {
                    if !self.line.is_empty() {
                        signals.extend(self.table.classify(&self.line));
                    }
                    self.line.clear();
                    self.overflow = 0;
                }
                BACKSPACE | DELETE => {
                    if self.overflow > 0 {
                        self.overflow -= 1;
                    } else {
                        self.line.pop();
                    }
                }
                0x20..=0x7e => {
                    if self.line.len() < self.max_len {
                        self.line.push(byte);
                    } else {
                        self.overflow += 1;
                    }
                }
                _ => {}
            }
        }
        signals
    }

    /// Bytes accumulated since the last line terminator.
    pub fn pending_line(&self) -> &[u8] {
        &self.line
    }
}

impl Default for LineDetector {
    fn default() -> Self {
        Self::new(Arc::new(SignalTable::default()), DEFAULT_MAX_LINE_LEN)
    }
}

//! Backend selection carried by `connect` frames.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which backend a session should bridge to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendTarget {
    /// Shell process on a local pseudo-terminal.
    #[default]
    Local,
    /// Shell on a remote host over SSH.
    Remote,
}

impl BackendTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

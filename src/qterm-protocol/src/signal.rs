//! Signal kinds and the placement hint attached to signal frames.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Visual signal the front end plays when a command line completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    MatrixRain,
    WormholePortal,
    QuantumExplosion,
    DnaHelix,
    GlitchText,
    NeuralNetwork,
    CosmicRays,
    ParticleFountain,
    TimeWarp,
    QuantumTunnel,
}

impl SignalKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MatrixRain => "matrix_rain",
            Self::WormholePortal => "wormhole_portal",
            Self::QuantumExplosion => "quantum_explosion",
            Self::DnaHelix => "dna_helix",
            Self::GlitchText => "glitch_text",
            Self::NeuralNetwork => "neural_network",
            Self::CosmicRays => "cosmic_rays",
            Self::ParticleFountain => "particle_fountain",
            Self::TimeWarp => "time_warp",
            Self::QuantumTunnel => "quantum_tunnel",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the front end should anchor a signal. Opaque to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementHint {
    pub x: i32,
    pub y: i32,
}

impl Default for PlacementHint {
    fn default() -> Self {
        Self { x: 10, y: 10 }
    }
}

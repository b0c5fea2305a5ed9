//! Types for ephemeral SSH access

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Supported SSH key algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    /// Ed25519 (fast, small keys, accepted by every current sshd)
    #[default]
    Ed25519,
}

impl std::fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyAlgorithm::Ed25519 => write!(f, "ed25519"),
        }
    }
}

/// Local key files produced for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairArtifact {
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
    /// The exact line installed in `authorized_keys`
    pub public_key: String,
    pub fingerprint: String,
    pub algorithm: KeyAlgorithm,
}

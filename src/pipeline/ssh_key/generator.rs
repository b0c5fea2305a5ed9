//! SSH Key Generation
//!
//! Generates Ed25519 SSH key pairs using the `ssh-key` crate.

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use ssh_key::{private::Ed25519Keypair, HashAlg, LineEnding, PrivateKey};
use tracing::debug;

use super::types::KeyAlgorithm;

/// Generated SSH key pair
pub struct GeneratedKeyPair {
    /// Private key in OpenSSH PEM format
    pub private_key_pem: String,
    /// Public key in OpenSSH format (e.g., "ssh-ed25519 AAAA... comment")
    pub public_key_openssh: String,
    /// SHA256 fingerprint
    pub fingerprint: String,
}

/// Produces fresh key pairs for ephemeral access
pub trait KeyGenerator: Send + Sync {
    fn algorithm(&self) -> KeyAlgorithm;

    fn generate(&self, comment: &str) -> Result<GeneratedKeyPair>;
}

/// In-process Ed25519 generator backed by the OS RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519KeyGenerator;

impl KeyGenerator for Ed25519KeyGenerator {
    fn algorithm(&self) -> KeyAlgorithm {
        KeyAlgorithm::Ed25519
    }

    fn generate(&self, comment: &str) -> Result<GeneratedKeyPair> {
        generate_ed25519_keypair(comment)
    }
}

/// Generate an Ed25519 SSH key pair
///
/// # Arguments
/// * `comment` - Comment appended to the public key line
pub fn generate_ed25519_keypair(comment: &str) -> Result<GeneratedKeyPair> {
    debug!(algorithm = %KeyAlgorithm::Ed25519, comment = %comment, "Generating SSH key pair");

    let ed25519_keypair = Ed25519Keypair::random(&mut OsRng);
    let private_key = PrivateKey::from(ed25519_keypair);

    let private_key_pem = private_key
        .to_openssh(LineEnding::LF)
        .context("Failed to encode private key")?
        .to_string();

    let public_key = private_key.public_key();
    let encoded = public_key
        .to_openssh()
        .context("Failed to encode public key")?;
    let public_key_openssh = format!("{} {}", encoded.trim_end(), comment);

    let fingerprint = public_key.fingerprint(HashAlg::Sha256).to_string();

    debug!(fingerprint = %fingerprint, "Key pair generated successfully");

    Ok(GeneratedKeyPair {
        private_key_pem,
        public_key_openssh,
        fingerprint,
    })
}

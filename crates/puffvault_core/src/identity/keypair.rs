//! secp256k1 keypairs and DID derivation.
//!
//! The target network identifies every writer by a decentralized identifier
//! derived from a secp256k1 public key. Secret keys round-trip through hex so
//! they can be persisted to the identity store and reloaded on resume.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::Rng;

use crate::error::{MigrationError, Result};

/// DID method prefix for the target network.
pub const DID_PREFIX: &str = "did:nil:";

/// A secp256k1 keypair representing one identity.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        // from_slice rejects zero and out-of-order scalars; astronomically
        // rare, but loop rather than panic.
        loop {
            let bytes: [u8; 32] = rand::rng().random();
            if let Ok(signing_key) = SigningKey::from_slice(&bytes) {
                return Self { signing_key };
            }
        }
    }

    /// Reconstruct a keypair from a hex-encoded secret key.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| MigrationError::InvalidKey(format!("secret key is not hex: {e}")))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| MigrationError::InvalidKey(format!("invalid secret key: {e}")))?;
        Ok(Self { signing_key })
    }

    /// Hex-encoded secret key, suitable for the identity store.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Hex-encoded compressed public key.
    pub fn public_key_hex(&self) -> String {
        let point = self.signing_key.verifying_key().to_encoded_point(true);
        hex::encode(point.as_bytes())
    }

    /// Derived decentralized identifier.
    pub fn did(&self) -> String {
        format!("{DID_PREFIX}{}", self.public_key_hex())
    }

    /// ECDSA signature over `message` (SHA-256 digest), as raw bytes.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(message);
        signature.to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secret material.
        f.debug_struct("Keypair").field("did", &self.did()).finish()
    }
}

/// Verify a signature against the public key embedded in a DID.
pub fn verify_signature(did: &str, message: &[u8], signature: &[u8]) -> Result<()> {
    let public_hex = did
        .strip_prefix(DID_PREFIX)
        .ok_or_else(|| MigrationError::InvalidKey(format!("not a {DID_PREFIX} DID: {did}")))?;
    let public_bytes = hex::decode(public_hex)
        .map_err(|e| MigrationError::InvalidKey(format!("DID public key is not hex: {e}")))?;
    let verifying_key = VerifyingKey::from_sec1_bytes(&public_bytes)
        .map_err(|e| MigrationError::InvalidKey(format!("invalid DID public key: {e}")))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| MigrationError::InvalidDelegation(format!("malformed signature: {e}")))?;

    verifying_key
        .verify(message, &signature)
        .map_err(|_| MigrationError::InvalidDelegation("signature verification failed".into()))
}

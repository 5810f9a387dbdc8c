//! Identity keys and domain-separated signing.
//!
//! Every peer holds a long-term Ed25519 keypair. Signatures are always made
//! over a purpose-tagged digest:
//!
//! ```text
//! sig = Ed25519-sign(priv, BLAKE3(purpose || 0x00 || msg))
//! ```
//!
//! The purpose string names the protocol the signature belongs to, so a
//! signature produced for one protocol can never be replayed as a signature
//! for another.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

use crate::hash::blake3_hash;

/// Public half of an identity keypair.
pub type PublicKey = VerifyingKey;

/// Detached Ed25519 signature.
pub type Signature = ed25519_dalek::Signature;

/// Size of a detached signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of a canonically serialized public key: algorithm tag + key bytes.
pub const MARSHALED_PUBLIC_KEY_SIZE: usize = 1 + 32;

/// Algorithm tag for Ed25519 in the canonical public key encoding.
const KEY_ALGO_ED25519: u8 = 0x01;

/// Errors from identity and signature operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Public key bytes failed to parse
    #[error("invalid public key encoding")]
    InvalidPublicKey,

    /// Signature bytes had the wrong length
    #[error("invalid signature length: {0}")]
    InvalidSignatureLength(usize),

    /// Signature did not verify
    #[error("signature verification failed")]
    BadSignature,
}

/// A peer's long-term Ed25519 identity keypair.
pub struct Identity {
    signing: SigningKey,
}

impl Identity {
    /// Generates a new random identity.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstructs an identity from stored private key bytes.
    pub fn from_private_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&bytes),
        }
    }

    /// Serializes the private key for persistent storage.
    pub fn private_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Returns the public half of the keypair.
    pub fn public_key(&self) -> PublicKey {
        self.signing.verifying_key()
    }
}

/// Canonically serializes a public key: algorithm tag followed by key bytes.
pub fn marshal_public_key(public_key: &PublicKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(MARSHALED_PUBLIC_KEY_SIZE);
    out.push(KEY_ALGO_ED25519);
    out.extend_from_slice(public_key.as_bytes());
    out
}

/// Parses a canonically serialized public key.
pub fn parse_public_key(data: &[u8]) -> Result<PublicKey, IdentityError> {
    if data.len() != MARSHALED_PUBLIC_KEY_SIZE || data[0] != KEY_ALGO_ED25519 {
        return Err(IdentityError::InvalidPublicKey);
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&data[1..]);
    VerifyingKey::from_bytes(&key).map_err(|_| IdentityError::InvalidPublicKey)
}

/// Signs `msg` for the given protocol purpose.
pub fn sign(identity: &Identity, purpose: &str, msg: &[u8]) -> Signature {
    identity.signing.sign(&purpose_digest(purpose, msg))
}

/// Verifies a purpose-tagged signature over `msg`.
pub fn verify(
    public_key: &PublicKey,
    purpose: &str,
    msg: &[u8],
    sig: &Signature,
) -> Result<(), IdentityError> {
    public_key
        .verify(&purpose_digest(purpose, msg), sig)
        .map_err(|_| IdentityError::BadSignature)
}

/// Computes the domain-separated digest: BLAKE3(purpose || 0x00 || msg).
fn purpose_digest(purpose: &str, msg: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(purpose.as_bytes());
    hasher.update(&[0x00]);
    hasher.update(msg);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let identity = Identity::generate();
        let sig = sign(&identity, "murmur/test", b"hello");
        assert!(verify(&identity.public_key(), "murmur/test", b"hello", &sig).is_ok());
    }

    #[test]
    fn test_purpose_separation() {
        let identity = Identity::generate();
        let sig = sign(&identity, "murmur/a", b"hello");
        assert_eq!(
            verify(&identity.public_key(), "murmur/b", b"hello", &sig),
            Err(IdentityError::BadSignature)
        );
    }

    #[test]
    fn test_tampered_message_fails() {
        let identity = Identity::generate();
        let sig = sign(&identity, "murmur/test", b"hello");
        assert!(verify(&identity.public_key(), "murmur/test", b"hellp", &sig).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let identity = Identity::generate();
        let other = Identity::generate();
        let sig = sign(&identity, "murmur/test", b"hello");
        assert!(verify(&other.public_key(), "murmur/test", b"hello", &sig).is_err());
    }

    #[test]
    fn test_public_key_marshal_roundtrip() {
        let identity = Identity::generate();
        let public = identity.public_key();
        let parsed = parse_public_key(&marshal_public_key(&public)).unwrap();
        assert_eq!(public, parsed);
    }

    #[test]
    fn test_public_key_parse_rejects_garbage() {
        assert!(parse_public_key(&[]).is_err());
        assert!(parse_public_key(&[0xFF; MARSHALED_PUBLIC_KEY_SIZE]).is_err());
        assert!(parse_public_key(&[0u8; 12]).is_err());
    }

    #[test]
    fn test_identity_private_bytes_roundtrip() {
        let identity = Identity::generate();
        let restored = Identity::from_private_bytes(identity.private_bytes());
        assert_eq!(identity.public_key(), restored.public_key());
    }
}

//! Peer identity.
//!
//! A `PeerId` is the BLAKE3 hash of the canonical serialization of a peer's
//! public key: the stable, transport-independent name of a peer. Secure
//! swarm addresses embed one, and the XOR cache takes its bytes as keys.

use std::fmt;

use crate::hash::blake3_hash;
use crate::sign::{marshal_public_key, PublicKey};

/// Size of a `PeerId` in bytes.
pub const PEER_ID_SIZE: usize = 32;

/// Peer identity, derived as BLAKE3(canonical public key).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    /// Wraps raw id bytes, e.g. when parsing an address.
    pub const fn new(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derives the id for a public key.
    ///
    /// Deterministic: the same key always yields the same id.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(blake3_hash(&marshal_public_key(public_key)))
    }

    /// The all-zero id. No real key hashes to it.
    pub const fn zero() -> Self {
        Self([0u8; PEER_ID_SIZE])
    }

    /// The raw id bytes.
    pub const fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    /// The raw id bytes as a slice, e.g. for use as a cache key.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    /// An eight-byte hex prefix: enough to tell peers apart in logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::Identity;

    #[test]
    fn test_peer_id_is_deterministic() {
        let identity = Identity::generate();
        let a = PeerId::from_public_key(&identity.public_key());
        let b = PeerId::from_public_key(&identity.public_key());
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_keys_distinct_ids() {
        let a = PeerId::from_public_key(&Identity::generate().public_key());
        let b = PeerId::from_public_key(&Identity::generate().public_key());
        assert_ne!(a, b);
    }

    #[test]
    fn test_new_preserves_bytes() {
        let mut bytes = [0u8; PEER_ID_SIZE];
        bytes[0] = 0xAB;
        bytes[31] = 0xCD;
        let id = PeerId::new(bytes);
        assert_eq!(id.as_bytes(), &bytes);
        assert_eq!(id.as_slice(), &bytes[..]);
    }

    #[test]
    fn test_zero_is_all_zeros() {
        assert!(PeerId::zero().as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_display_shows_short_prefix() {
        let id = PeerId::new([0xAB; PEER_ID_SIZE]);
        assert_eq!(id.to_string(), "abababababababab");
        assert_eq!(format!("{id:?}"), "PeerId(abababababababab)");
    }
}

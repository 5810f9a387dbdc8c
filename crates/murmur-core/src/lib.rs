//! Murmur Core - Identity and wire primitives for the murmur swarm stack.
//!
//! This crate provides:
//! - Peer identity derivation (`PeerId` = BLAKE3 of a canonical public key)
//! - Ed25519 identity keys with domain-separated signing
//! - BLAKE3 hashing
//! - Unsigned-varint framing helpers used by the overlay wire formats

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod hash;
pub mod identifiers;
pub mod sign;
pub mod wire;

pub use hash::blake3_hash;
pub use identifiers::{PeerId, PEER_ID_SIZE};
pub use sign::{
    marshal_public_key, parse_public_key, sign, verify, Identity, IdentityError, PublicKey,
    Signature, MARSHALED_PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};
pub use wire::{
    put_uvarint, read_uvarint, uvarint_len, WireError, MAX_UVARINT32_LEN, MAX_UVARINT64_LEN,
};

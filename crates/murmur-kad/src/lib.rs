//! Murmur Kad - XOR-distance machinery.
//!
//! Provides the bucketed [`XorCache`], whose eviction policy preferentially
//! drops entries far from a reference key (the locus) in XOR-distance
//! space, retaining the close neighborhood the way a Kademlia routing
//! table would.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod cache;
pub mod dist;

pub use cache::{Entry, XorCache};
pub use dist::{has_prefix, leading_zeros, xor_distance};

//! Murmur Swarm - The swarm contract.
//!
//! A swarm is a group of nodes exchanging datagram-style messages. Every
//! layer of the murmur stack - transports, overlays, multiplexed channels -
//! satisfies the same [`Swarm`] trait, so overlays compose: each one is a
//! swarm built on a lower swarm, possibly enriching the address type.
//!
//! This crate defines:
//! - the [`Swarm`], [`AskSwarm`] and [`SecureSwarm`] traits and [`Addr`]
//! - [`SwarmError`], the error vocabulary shared by the whole stack
//! - [`TellHub`]/[`AskHub`], the handoff primitives overlays dispatch into
//! - an in-memory swarm ([`mem`]) for tests and examples

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod hub;
pub mod mem;
pub mod swarm;

pub use hub::{AskHub, AskRequest, ReplyHandle, TellHub};
pub use mem::{MemAddr, MemRealm, MemSwarm, DEFAULT_MEM_MTU};
pub use swarm::{
    serve_asks, serve_tells, Addr, AskSwarm, Message, SecureSwarm, Swarm, SwarmError,
};

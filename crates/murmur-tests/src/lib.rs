//! Murmur Tests - Multi-node test harness.
//!
//! Helpers for standing up in-memory swarm stacks in integration tests:
//! noise nodes with fresh identities, instrumented lower swarms, and
//! message collectors.

#![deny(unsafe_code)]

pub mod harness;

pub use harness::{init_tracing, CountingSwarm, NoiseNode, TestNet};

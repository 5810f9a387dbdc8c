//! Murmur Overlay - Higher-order swarms.
//!
//! Each overlay wraps a lower [`murmur_swarm::Swarm`] and is itself a
//! swarm, so overlays stack freely:
//! - [`frag`]: enlarges the MTU by splitting and reassembling datagrams
//! - [`noise`]: authenticated encryption with per-peer Noise sessions
//! - [`mux`]: many named logical swarms over one shared swarm
//!
//! A typical stack is transport → fragmenting → noise → mux → application
//! channels.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod frag;
pub mod mux;
pub mod noise;

pub use frag::{FragConfig, FragSwarm, FRAG_OVERHEAD};
pub use mux::{MuxChannel, Muxer, CONTROL_CHANNEL, MUX_OVERHEAD};
pub use noise::{NoiseAddr, NoiseConfig, NoiseSwarm, NOISE_OVERHEAD};

//! In-memory swarm.
//!
//! A process-local realm of endpoints that exchange datagrams through
//! hubs. This is the loopback transport used throughout the test suites
//! and by overlay examples; it exercises the full contract, including
//! asks and backpressure, without touching the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::hub::{AskHub, AskRequest, TellHub};
use crate::swarm::{Addr, AskSwarm, Message, Swarm, SwarmError};

/// Default MTU for in-memory endpoints.
pub const DEFAULT_MEM_MTU: usize = 1 << 16;

/// Address of an in-memory endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemAddr(pub u64);

impl Addr for MemAddr {
    fn marshal(&self) -> Vec<u8> {
        self.0.to_be_bytes().to_vec()
    }
}

struct Endpoint {
    tells: TellHub<MemAddr>,
    asks: AskHub<MemAddr>,
}

struct RealmState {
    mtu: usize,
    endpoints: RwLock<HashMap<u64, Arc<Endpoint>>>,
    next_addr: AtomicU64,
}

/// A group of in-memory endpoints that can reach each other.
#[derive(Clone)]
pub struct MemRealm {
    state: Arc<RealmState>,
}

impl MemRealm {
    /// Creates a realm with the default MTU.
    pub fn new() -> Self {
        Self::with_mtu(DEFAULT_MEM_MTU)
    }

    /// Creates a realm whose endpoints report the given MTU.
    pub fn with_mtu(mtu: usize) -> Self {
        assert!(mtu > 0, "MTU must be positive");
        Self {
            state: Arc::new(RealmState {
                mtu,
                endpoints: RwLock::new(HashMap::new()),
                next_addr: AtomicU64::new(1),
            }),
        }
    }

    /// Creates a new endpoint in this realm.
    pub fn create_swarm(&self) -> MemSwarm {
        let addr = MemAddr(self.state.next_addr.fetch_add(1, Ordering::Relaxed));
        let endpoint = Arc::new(Endpoint {
            tells: TellHub::new(),
            asks: AskHub::new(),
        });
        self.state
            .endpoints
            .write()
            .insert(addr.0, endpoint.clone());
        MemSwarm {
            realm: self.state.clone(),
            addr,
            endpoint,
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for MemRealm {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of an in-memory realm.
pub struct MemSwarm {
    realm: Arc<RealmState>,
    addr: MemAddr,
    endpoint: Arc<Endpoint>,
    closed: AtomicBool,
}

impl MemSwarm {
    /// This endpoint's address.
    pub fn addr(&self) -> MemAddr {
        self.addr
    }

    fn check_open(&self) -> Result<(), SwarmError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SwarmError::Closed);
        }
        Ok(())
    }

    fn endpoint_for(&self, dst: &MemAddr) -> Result<Arc<Endpoint>, SwarmError> {
        self.realm
            .endpoints
            .read()
            .get(&dst.0)
            .cloned()
            .ok_or_else(|| SwarmError::Transport(format!("no endpoint at {:?}", dst)))
    }
}

#[async_trait]
impl Swarm for MemSwarm {
    type Addr = MemAddr;

    async fn tell(&self, dst: &MemAddr, payload: &[u8]) -> Result<(), SwarmError> {
        self.check_open()?;
        if payload.len() > self.realm.mtu {
            return Err(SwarmError::MessageTooLarge {
                size: payload.len(),
                mtu: self.realm.mtu,
            });
        }
        let endpoint = self.endpoint_for(dst)?;
        let msg = Message {
            src: self.addr,
            dst: *dst,
            payload: payload.to_vec(),
        };
        endpoint
            .tells
            .deliver(msg)
            .await
            .map_err(|_| SwarmError::Transport(format!("endpoint {:?} closed", dst)))
    }

    async fn recv(&self) -> Result<Message<MemAddr>, SwarmError> {
        self.endpoint.tells.recv().await
    }

    async fn mtu(&self, _target: &MemAddr) -> usize {
        self.realm.mtu
    }

    fn local_addrs(&self) -> Vec<MemAddr> {
        vec![self.addr]
    }

    fn parse_addr(&self, data: &[u8]) -> Result<MemAddr, SwarmError> {
        let bytes: [u8; 8] = data
            .try_into()
            .map_err(|_| SwarmError::InvalidAddr(format!("expected 8 bytes, got {}", data.len())))?;
        Ok(MemAddr(u64::from_be_bytes(bytes)))
    }

    async fn close(&self) -> Result<(), SwarmError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.realm.endpoints.write().remove(&self.addr.0);
        self.endpoint.tells.close_with_error(SwarmError::Closed);
        self.endpoint.asks.close_with_error(SwarmError::Closed);
        Ok(())
    }
}

#[async_trait]
impl AskSwarm for MemSwarm {
    async fn ask(&self, dst: &MemAddr, payload: &[u8]) -> Result<Vec<u8>, SwarmError> {
        self.check_open()?;
        if payload.len() > self.realm.mtu {
            return Err(SwarmError::MessageTooLarge {
                size: payload.len(),
                mtu: self.realm.mtu,
            });
        }
        let endpoint = self.endpoint_for(dst)?;
        let msg = Message {
            src: self.addr,
            dst: *dst,
            payload: payload.to_vec(),
        };
        endpoint.asks.deliver(msg).await
    }

    async fn recv_ask(&self) -> Result<AskRequest<MemAddr>, SwarmError> {
        self.endpoint.asks.recv().await
    }
}

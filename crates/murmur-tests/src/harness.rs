//! Test network harness.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use murmur_core::{Identity, PeerId, PublicKey};
use murmur_overlay::noise::{NoiseAddr, NoiseConfig, NoiseSwarm};
use murmur_swarm::{AskRequest, AskSwarm, MemAddr, MemRealm, MemSwarm, Message, Swarm, SwarmError};
use tokio::sync::mpsc;

/// Installs a tracing subscriber for tests. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur_swarm=debug,murmur_overlay=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// An in-memory test network.
pub struct TestNet {
    realm: MemRealm,
}

impl TestNet {
    /// Creates a network with the default in-memory MTU.
    pub fn new() -> Self {
        Self {
            realm: MemRealm::new(),
        }
    }

    /// Creates a network whose transport reports `mtu`.
    pub fn with_mtu(mtu: usize) -> Self {
        Self {
            realm: MemRealm::with_mtu(mtu),
        }
    }

    /// The underlying realm.
    pub fn realm(&self) -> &MemRealm {
        &self.realm
    }

    /// Adds a bare in-memory endpoint.
    pub fn mem_swarm(&self) -> MemSwarm {
        self.realm.create_swarm()
    }

    /// Adds a noise node with a fresh identity, directly over the
    /// in-memory transport.
    pub fn noise_node(&self) -> NoiseNode {
        self.noise_node_with_config(NoiseConfig::default())
    }

    /// Adds a noise node with an explicit session configuration.
    pub fn noise_node_with_config(&self, config: NoiseConfig) -> NoiseNode {
        let identity = Identity::generate();
        let public_key = identity.public_key();
        let peer_id = PeerId::from_public_key(&public_key);
        let lower = self.realm.create_swarm();
        let lower_addr = lower.addr();
        let swarm = Arc::new(NoiseSwarm::with_config(lower, identity, config));
        tracing::debug!(peer_id = %peer_id, lower = ?lower_addr, "added noise node");
        NoiseNode {
            swarm,
            peer_id,
            public_key,
            lower_addr,
        }
    }
}

impl Default for TestNet {
    fn default() -> Self {
        Self::new()
    }
}

/// A noise swarm plus the identity material tests assert against.
pub struct NoiseNode {
    /// The node's secure swarm
    pub swarm: Arc<NoiseSwarm<MemSwarm>>,
    /// Identity hash of the node's public key
    pub peer_id: PeerId,
    /// The node's public key
    pub public_key: PublicKey,
    /// Address of the node's transport endpoint
    pub lower_addr: MemAddr,
}

impl NoiseNode {
    /// This node's secure address as peers dial it.
    pub fn addr(&self) -> NoiseAddr<MemAddr> {
        NoiseAddr {
            id: self.peer_id,
            addr: self.lower_addr,
        }
    }

    /// Spawns a receive loop forwarding every delivery into a channel.
    ///
    /// The loop also drives handshakes, so any node expected to answer
    /// dials needs one running.
    pub fn spawn_collector(&self) -> mpsc::UnboundedReceiver<Message<NoiseAddr<MemAddr>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let swarm = self.swarm.clone();
        tokio::spawn(async move {
            while let Ok(msg) = swarm.recv().await {
                if tx.send(msg).is_err() {
                    return;
                }
            }
        });
        rx
    }
}

/// A pass-through swarm that counts datagrams sent below it.
pub struct CountingSwarm<S: Swarm> {
    inner: S,
    sent: Arc<AtomicUsize>,
}

impl<S: Swarm> CountingSwarm<S> {
    /// Wraps `inner`, returning the wrapper and the shared send counter.
    pub fn new(inner: S) -> (Self, Arc<AtomicUsize>) {
        let sent = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner,
                sent: sent.clone(),
            },
            sent,
        )
    }
}

#[async_trait]
impl<S: Swarm> Swarm for CountingSwarm<S> {
    type Addr = S::Addr;

    async fn tell(&self, dst: &S::Addr, payload: &[u8]) -> Result<(), SwarmError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.inner.tell(dst, payload).await
    }

    async fn recv(&self) -> Result<Message<S::Addr>, SwarmError> {
        self.inner.recv().await
    }

    async fn mtu(&self, target: &S::Addr) -> usize {
        self.inner.mtu(target).await
    }

    fn local_addrs(&self) -> Vec<S::Addr> {
        self.inner.local_addrs()
    }

    fn parse_addr(&self, data: &[u8]) -> Result<S::Addr, SwarmError> {
        self.inner.parse_addr(data)
    }

    async fn close(&self) -> Result<(), SwarmError> {
        self.inner.close().await
    }
}

#[async_trait]
impl<S: AskSwarm> AskSwarm for CountingSwarm<S> {
    async fn ask(&self, dst: &S::Addr, payload: &[u8]) -> Result<Vec<u8>, SwarmError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.inner.ask(dst, payload).await
    }

    async fn recv_ask(&self) -> Result<AskRequest<S::Addr>, SwarmError> {
        self.inner.recv_ask().await
    }
}

//! The swarm contract traits.

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;

use async_trait::async_trait;
use murmur_core::{PeerId, PublicKey};
use thiserror::Error;

use crate::hub::AskRequest;

/// A swarm address.
///
/// Each swarm defines its own address type; the associated `Addr` on
/// [`Swarm`] makes sending to a foreign variant a compile-time error.
/// Overlay addresses typically embed the lower address plus metadata.
pub trait Addr: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    /// Canonical byte serialization. Round-trips through the owning swarm's
    /// `parse_addr`.
    fn marshal(&self) -> Vec<u8>;

    /// Stable string key, suitable for use as a map key or log field.
    fn key(&self) -> String {
        hex::encode(self.marshal())
    }
}

/// A datagram exchanged between swarm endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<A> {
    /// Sender address
    pub src: A,
    /// Destination address
    pub dst: A,
    /// Payload bytes, at most the sending swarm's MTU toward `dst`
    pub payload: Vec<u8>,
}

/// Errors surfaced by swarm operations.
///
/// Clonable so hubs can fan a terminal error out to every pending caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SwarmError {
    /// The swarm has been closed
    #[error("swarm is closed")]
    Closed,

    /// Payload exceeds the MTU toward the destination
    #[error("message of {size} bytes exceeds MTU {mtu}")]
    MessageTooLarge {
        /// Offered payload size
        size: usize,
        /// Current MTU toward the destination
        mtu: usize,
    },

    /// Address bytes failed to parse
    #[error("invalid address: {0}")]
    InvalidAddr(String),

    /// No ready session vouches for a public key at this address
    #[error("public key not found")]
    PublicKeyNotFound,

    /// The peer at the dialed address holds a different identity
    #[error("wrong peer: want {want}, have {have}")]
    WrongPeer {
        /// Identity the caller asked for
        want: PeerId,
        /// Identity actually present at the address
        have: PeerId,
    },

    /// Security handshake failed
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Dial attempts exhausted without a ready session
    #[error("dial timed out")]
    DialTimeout,

    /// Underlying transport failure
    #[error("transport error: {0}")]
    Transport(String),
}

/// The base swarm capability set.
///
/// `tell` is best-effort fire-and-forget: a successful return means the
/// payload entered the outbound path, not that it was delivered. `recv` is
/// the receive side; callers typically drive it through [`serve_tells`].
/// Cancellation and deadlines are the caller's: wrap any blocking call in
/// `tokio::time::timeout` or drop the future.
#[async_trait]
pub trait Swarm: Send + Sync + 'static {
    /// Address type understood by this swarm.
    type Addr: Addr;

    /// Sends a datagram toward `dst`.
    async fn tell(&self, dst: &Self::Addr, payload: &[u8]) -> Result<(), SwarmError>;

    /// Receives the next inbound datagram.
    ///
    /// Messages arrive in order per underlying source, with no cross-source
    /// ordering guarantee. Returns the closing error once the swarm shuts
    /// down.
    async fn recv(&self) -> Result<Message<Self::Addr>, SwarmError>;

    /// Maximum payload size accepted by `tell` toward `target` right now.
    async fn mtu(&self, target: &Self::Addr) -> usize;

    /// Current local endpoints. Every returned address round-trips through
    /// `parse_addr`.
    fn local_addrs(&self) -> Vec<Self::Addr>;

    /// Parses a canonical address serialization.
    fn parse_addr(&self, data: &[u8]) -> Result<Self::Addr, SwarmError>;

    /// Shuts the swarm down. Idempotent; closes lower swarms. Subsequent
    /// operations fail with [`SwarmError::Closed`].
    async fn close(&self) -> Result<(), SwarmError>;
}

/// Request/response capability. Optional: only swarms that can route a
/// single reply back to the asker implement this.
#[async_trait]
pub trait AskSwarm: Swarm {
    /// Sends a request and waits for the single reply.
    async fn ask(&self, dst: &Self::Addr, payload: &[u8]) -> Result<Vec<u8>, SwarmError>;

    /// Receives the next inbound request, with a handle to send the reply.
    async fn recv_ask(&self) -> Result<AskRequest<Self::Addr>, SwarmError>;
}

/// A swarm whose addresses carry an authenticated peer identity.
#[async_trait]
pub trait SecureSwarm: Swarm {
    /// The local public key.
    fn public_key(&self) -> PublicKey;

    /// Looks up the public key bound to `target`, consulting only local
    /// state. Never dials.
    async fn lookup_public_key(&self, target: &Self::Addr) -> Result<PublicKey, SwarmError>;
}

/// Drives `handler` with every inbound datagram until the swarm closes.
///
/// Returns the terminal error (normally [`SwarmError::Closed`]).
pub async fn serve_tells<S, F, Fut>(swarm: &S, mut handler: F) -> SwarmError
where
    S: Swarm,
    F: FnMut(Message<S::Addr>) -> Fut + Send,
    Fut: Future<Output = ()> + Send,
{
    loop {
        match swarm.recv().await {
            Ok(msg) => handler(msg).await,
            Err(err) => return err,
        }
    }
}

/// Drives `handler` with every inbound request until the swarm closes.
///
/// The handler's return value is sent back to the asker.
pub async fn serve_asks<S, F, Fut>(swarm: &S, mut handler: F) -> SwarmError
where
    S: AskSwarm,
    F: FnMut(Message<S::Addr>) -> Fut + Send,
    Fut: Future<Output = Vec<u8>> + Send,
{
    loop {
        match swarm.recv_ask().await {
            Ok(req) => {
                let (msg, reply) = req.into_parts();
                let response = handler(msg).await;
                reply.respond(response);
            }
            Err(err) => return err,
        }
    }
}

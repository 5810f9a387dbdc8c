//! Dynamic multiplexer.
//!
//! Hosts many named logical swarms over one base swarm. Each registered
//! name gets a process-local 32-bit channel id; because ids are local, the
//! mapping is negotiated lazily with each remote peer over a reserved
//! control channel (id 0): a peer asking to use channel `name` sends
//! `Bind(name)` and receives `Bound(name, id)` carrying the *replier's*
//! id. Outbound data frames toward a peer carry that peer's id, so every
//! receiver resolves inbound frames through its own registry.
//!
//! Data frame: `uvarint(channel_id) inner_payload`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use murmur_core::{put_uvarint, read_uvarint, MAX_UVARINT32_LEN};
use murmur_swarm::{
    Addr, AskHub, AskRequest, AskSwarm, Message, Swarm, SwarmError, TellHub,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// The reserved control channel id.
pub const CONTROL_CHANNEL: u32 = 0;

/// Per-message wire overhead: the channel id varint.
pub const MUX_OVERHEAD: usize = MAX_UVARINT32_LEN;

/// How long a channel negotiation waits for the peer's `Bound` reply.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

const CTRL_BIND: u8 = 1;
const CTRL_BOUND: u8 = 2;
const CTRL_UNBIND: u8 = 3;

struct ChannelEntry<A> {
    name: String,
    id: u32,
    tells: TellHub<A>,
    asks: AskHub<A>,
    /// Peers we have announced our id to; notified on unbind.
    announced: Mutex<HashMap<String, A>>,
}

#[derive(Default)]
struct PeerState {
    /// name -> the peer's id for that channel
    bindings: HashMap<String, u32>,
    /// waiters for in-flight negotiations, per name
    pending: HashMap<String, Vec<oneshot::Sender<u32>>>,
}

struct MuxState<S: Swarm> {
    base: S,
    by_name: RwLock<HashMap<String, Arc<ChannelEntry<S::Addr>>>>,
    by_id: RwLock<HashMap<u32, Arc<ChannelEntry<S::Addr>>>>,
    peers: Mutex<HashMap<String, PeerState>>,
    next_id: AtomicU32,
    closed: AtomicBool,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Swarm> MuxState<S> {
    fn check_open(&self) -> Result<(), SwarmError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SwarmError::Closed);
        }
        Ok(())
    }

    async fn tell_control(&self, dst: &S::Addr, control: &[u8]) -> Result<(), SwarmError> {
        let mut frame = Vec::with_capacity(1 + control.len());
        put_uvarint(&mut frame, u64::from(CONTROL_CHANNEL));
        frame.extend_from_slice(control);
        self.base.tell(dst, &frame).await
    }

    /// Resolves the peer's channel id for `name`, negotiating it on first
    /// use.
    async fn lookup(&self, peer: &S::Addr, name: &str) -> Result<u32, SwarmError> {
        let peer_key = peer.key();
        let rx = {
            let mut peers = self.peers.lock();
            let state = peers.entry(peer_key).or_default();
            if let Some(id) = state.bindings.get(name) {
                return Ok(*id);
            }
            let (tx, rx) = oneshot::channel();
            state.pending.entry(name.to_string()).or_default().push(tx);
            rx
        };
        let mut bind = vec![CTRL_BIND];
        bind.extend_from_slice(name.as_bytes());
        self.tell_control(peer, &bind).await?;
        match tokio::time::timeout(LOOKUP_TIMEOUT, rx).await {
            Ok(Ok(id)) => Ok(id),
            _ => Err(SwarmError::DialTimeout),
        }
    }

    async fn handle_datagram(&self, msg: Message<S::Addr>) {
        let (channel, consumed) = match read_uvarint(&msg.payload) {
            Ok((value, consumed)) => match u32::try_from(value) {
                Ok(channel) => (channel, consumed),
                Err(_) => {
                    tracing::warn!(src = %msg.src.key(), "dropping frame with oversized channel id");
                    return;
                }
            },
            Err(err) => {
                tracing::warn!(src = %msg.src.key(), %err, "dropping malformed mux frame");
                return;
            }
        };
        let inner = msg.payload[consumed..].to_vec();
        if channel == CONTROL_CHANNEL {
            self.handle_control(&msg.src, &inner).await;
            return;
        }
        let entry = self.by_id.read().get(&channel).cloned();
        match entry {
            Some(entry) => {
                let delivery = Message {
                    src: msg.src,
                    dst: msg.dst,
                    payload: inner,
                };
                if let Err(err) = entry.tells.deliver(delivery).await {
                    tracing::debug!(channel = %entry.name, %err, "channel dropped a delivery");
                }
            }
            None => {
                tracing::debug!(channel, src = %msg.src.key(), "dropping frame for unknown channel");
            }
        }
    }

    async fn handle_ask(&self, req: AskRequest<S::Addr>) {
        let (msg, reply) = req.into_parts();
        let (channel, consumed) = match read_uvarint(&msg.payload) {
            Ok((value, consumed)) => match u32::try_from(value) {
                Ok(channel) => (channel, consumed),
                Err(_) => return,
            },
            Err(_) => return,
        };
        if channel == CONTROL_CHANNEL {
            // Control messages only travel as tells.
            return;
        }
        let entry = self.by_id.read().get(&channel).cloned();
        let Some(entry) = entry else { return };
        let request = Message {
            src: msg.src,
            dst: msg.dst,
            payload: msg.payload[consumed..].to_vec(),
        };
        match entry.asks.deliver(request).await {
            Ok(response) => reply.respond(response),
            Err(err) => {
                tracing::debug!(channel = %entry.name, %err, "channel dropped an ask");
            }
        }
    }

    async fn handle_control(&self, src: &S::Addr, payload: &[u8]) {
        let Some((&tag, rest)) = payload.split_first() else {
            tracing::warn!(src = %src.key(), "dropping empty control message");
            return;
        };
        match tag {
            CTRL_BIND => {
                let Ok(name) = std::str::from_utf8(rest) else { return };
                let entry = self.by_name.read().get(name).cloned();
                let Some(entry) = entry else {
                    tracing::debug!(channel = name, "bind request for unregistered channel");
                    return;
                };
                entry
                    .announced
                    .lock()
                    .insert(src.key(), src.clone());
                let mut bound = vec![CTRL_BOUND];
                put_uvarint(&mut bound, u64::from(entry.id));
                bound.extend_from_slice(name.as_bytes());
                if let Err(err) = self.tell_control(src, &bound).await {
                    tracing::debug!(src = %src.key(), %err, "failed to answer bind");
                }
            }
            CTRL_BOUND => {
                let Ok((id, consumed)) = read_uvarint(rest) else { return };
                let Ok(id) = u32::try_from(id) else { return };
                if id == CONTROL_CHANNEL {
                    return;
                }
                let Ok(name) = std::str::from_utf8(&rest[consumed..]) else {
                    return;
                };
                let mut peers = self.peers.lock();
                let state = peers.entry(src.key()).or_default();
                state.bindings.insert(name.to_string(), id);
                for waiter in state.pending.remove(name).unwrap_or_default() {
                    let _ = waiter.send(id);
                }
            }
            CTRL_UNBIND => {
                let Ok(name) = std::str::from_utf8(rest) else { return };
                if let Some(state) = self.peers.lock().get_mut(&src.key()) {
                    state.bindings.remove(name);
                }
            }
            _ => {
                tracing::warn!(src = %src.key(), tag, "dropping unknown control message");
            }
        }
    }
}

/// Hosts named logical swarms over one base swarm.
pub struct Muxer<S: Swarm> {
    state: Arc<MuxState<S>>,
}

impl<S: Swarm> Muxer<S> {
    /// Creates a muxer serving the base swarm's tells.
    pub fn new(base: S) -> Self {
        let state = Arc::new(MuxState {
            base,
            by_name: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            pumps: Mutex::new(Vec::new()),
        });
        let pump_state = state.clone();
        let pump = tokio::spawn(async move {
            loop {
                match pump_state.base.recv().await {
                    Ok(msg) => pump_state.handle_datagram(msg).await,
                    Err(_) => return,
                }
            }
        });
        state.pumps.lock().push(pump);
        Self { state }
    }

    /// Registers a named channel, returning the swarm bound to it.
    pub fn open(&self, name: &str) -> Result<MuxChannel<S>, SwarmError> {
        self.state.check_open()?;
        let mut by_name = self.state.by_name.write();
        if by_name.contains_key(name) {
            return Err(SwarmError::Transport(format!(
                "channel {name} already registered"
            )));
        }
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(ChannelEntry {
            name: name.to_string(),
            id,
            tells: TellHub::new(),
            asks: AskHub::new(),
            announced: Mutex::new(HashMap::new()),
        });
        by_name.insert(name.to_string(), entry.clone());
        self.state.by_id.write().insert(id, entry.clone());
        Ok(MuxChannel {
            state: self.state.clone(),
            entry,
            closed: AtomicBool::new(false),
        })
    }

    /// Shuts down every channel and the base swarm. Idempotent.
    pub async fn close(&self) -> Result<(), SwarmError> {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for pump in self.state.pumps.lock().drain(..) {
            pump.abort();
        }
        for entry in self.state.by_name.read().values() {
            entry.tells.close_with_error(SwarmError::Closed);
            entry.asks.close_with_error(SwarmError::Closed);
        }
        self.state.base.close().await
    }
}

impl<S: AskSwarm> Muxer<S> {
    /// Creates a muxer that serves the base swarm's tells and asks, so
    /// channels can answer requests.
    pub fn with_asks(base: S) -> Self {
        let muxer = Self::new(base);
        let pump_state = muxer.state.clone();
        let pump = tokio::spawn(async move {
            loop {
                match pump_state.base.recv_ask().await {
                    Ok(req) => pump_state.handle_ask(req).await,
                    Err(_) => return,
                }
            }
        });
        muxer.state.pumps.lock().push(pump);
        muxer
    }
}

/// A named logical swarm hosted by a [`Muxer`].
pub struct MuxChannel<S: Swarm> {
    state: Arc<MuxState<S>>,
    entry: Arc<ChannelEntry<S::Addr>>,
    closed: AtomicBool,
}

impl<S: Swarm> MuxChannel<S> {
    /// This channel's name.
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    fn check_open(&self) -> Result<(), SwarmError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SwarmError::Closed);
        }
        self.state.check_open()
    }

    async fn wrap(&self, dst: &S::Addr, payload: &[u8]) -> Result<Vec<u8>, SwarmError> {
        let mtu = self.mtu(dst).await;
        if payload.len() > mtu {
            return Err(SwarmError::MessageTooLarge {
                size: payload.len(),
                mtu,
            });
        }
        let id = self.state.lookup(dst, &self.entry.name).await?;
        let mut frame = Vec::with_capacity(MUX_OVERHEAD + payload.len());
        put_uvarint(&mut frame, u64::from(id));
        frame.extend_from_slice(payload);
        Ok(frame)
    }
}

#[async_trait]
impl<S: Swarm> Swarm for MuxChannel<S> {
    type Addr = S::Addr;

    async fn tell(&self, dst: &S::Addr, payload: &[u8]) -> Result<(), SwarmError> {
        self.check_open()?;
        let frame = self.wrap(dst, payload).await?;
        self.state.base.tell(dst, &frame).await
    }

    async fn recv(&self) -> Result<Message<S::Addr>, SwarmError> {
        self.entry.tells.recv().await
    }

    async fn mtu(&self, target: &S::Addr) -> usize {
        self.state.base.mtu(target).await.saturating_sub(MUX_OVERHEAD)
    }

    fn local_addrs(&self) -> Vec<S::Addr> {
        self.state.base.local_addrs()
    }

    fn parse_addr(&self, data: &[u8]) -> Result<S::Addr, SwarmError> {
        self.state.base.parse_addr(data)
    }

    /// Closes this channel only; the muxer and sibling channels keep
    /// running. Peers that learned our id are told to forget it.
    async fn close(&self) -> Result<(), SwarmError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.state.by_name.write().remove(&self.entry.name);
        self.state.by_id.write().remove(&self.entry.id);
        self.entry.tells.close_with_error(SwarmError::Closed);
        self.entry.asks.close_with_error(SwarmError::Closed);

        let peers: Vec<S::Addr> = self.entry.announced.lock().values().cloned().collect();
        let mut unbind = vec![CTRL_UNBIND];
        unbind.extend_from_slice(self.entry.name.as_bytes());
        for peer in peers {
            if let Err(err) = self.state.tell_control(&peer, &unbind).await {
                tracing::debug!(peer = %peer.key(), %err, "failed to send unbind");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: AskSwarm> AskSwarm for MuxChannel<S> {
    async fn ask(&self, dst: &S::Addr, payload: &[u8]) -> Result<Vec<u8>, SwarmError> {
        self.check_open()?;
        let frame = self.wrap(dst, payload).await?;
        self.state.base.ask(dst, &frame).await
    }

    async fn recv_ask(&self) -> Result<AskRequest<S::Addr>, SwarmError> {
        self.entry.asks.recv().await
    }
}

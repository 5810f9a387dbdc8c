//! Fragmenting swarm.
//!
//! Wraps a lower swarm to expose a larger MTU. Outbound payloads are split
//! into parts sized to the lower MTU and sent concurrently; inbound parts
//! are reassembled per `(source, message id)` and delivered once complete.
//! A background sweeper drops stale partial reassemblies so memory stays
//! bounded under packet loss; staleness is also checked when a part
//! arrives and when state is inspected, so the reassembly TTL holds
//! between sweeps.
//!
//! Frame layout: `uvarint(msg_id) uvarint(part) uvarint(total) chunk`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use murmur_core::{put_uvarint, read_uvarint, PublicKey, MAX_UVARINT32_LEN};
use murmur_swarm::{Addr, Message, SecureSwarm, Swarm, SwarmError};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Per-message wire overhead: three varint headers.
pub const FRAG_OVERHEAD: usize = 3 * MAX_UVARINT32_LEN;

/// Configuration for a fragmenting swarm.
#[derive(Debug, Clone)]
pub struct FragConfig {
    /// MTU reported upward, independent of the lower MTU
    pub mtu: usize,
    /// Age at which a partial reassembly is dropped
    pub ttl: Duration,
    /// How often the sweeper scans for stale reassemblies
    pub sweep_interval: Duration,
}

impl FragConfig {
    /// Creates a config with the given enlarged MTU and default timing.
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu,
            ttl: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct AggKey {
    addr: String,
    id: u32,
}

struct Aggregator {
    created_at: Instant,
    parts: Mutex<Vec<Option<Vec<u8>>>>,
}

impl Aggregator {
    fn new(total: u32) -> Self {
        Self {
            created_at: Instant::now(),
            parts: Mutex::new(vec![None; total as usize]),
        }
    }

    fn is_stale(&self, cutoff: Instant) -> bool {
        self.created_at <= cutoff
    }

    /// Stores a part, returning true once every slot is filled.
    fn add_part(&self, part: u32, data: &[u8]) -> bool {
        let mut parts = self.parts.lock();
        let Some(slot) = parts.get_mut(part as usize) else {
            return false;
        };
        *slot = Some(data.to_vec());
        parts.iter().all(|p| p.is_some())
    }

    fn assemble(&self) -> Vec<u8> {
        let parts = self.parts.lock();
        let mut buf = Vec::new();
        for part in parts.iter().flatten() {
            buf.extend_from_slice(part);
        }
        buf
    }
}

struct FragState<S: Swarm> {
    lower: S,
    config: FragConfig,
    aggs: Mutex<HashMap<AggKey, Arc<Aggregator>>>,
    msg_ids: Mutex<HashMap<String, u32>>,
    closed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Swarm> FragState<S> {
    fn cleanup(&self) {
        let cutoff = Instant::now() - self.config.ttl;
        self.aggs.lock().retain(|_, agg| !agg.is_stale(cutoff));
    }
}

/// An MTU-enlarging overlay swarm.
pub struct FragSwarm<S: Swarm> {
    state: Arc<FragState<S>>,
}

impl<S: Swarm> FragSwarm<S> {
    /// Wraps `lower`, reporting `mtu` upward.
    pub fn new(lower: S, mtu: usize) -> Self {
        Self::with_config(lower, FragConfig::new(mtu))
    }

    /// Wraps `lower` with explicit timing configuration.
    pub fn with_config(lower: S, config: FragConfig) -> Self {
        assert!(config.mtu > 0, "MTU must be positive");
        let state = Arc::new(FragState {
            lower,
            config,
            aggs: Mutex::new(HashMap::new()),
            msg_ids: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        });
        let handle = tokio::spawn(sweep_loop(Arc::downgrade(&state)));
        *state.sweeper.lock() = Some(handle);
        Self { state }
    }

    /// Number of in-progress reassemblies. Stale ones are dropped before
    /// counting. Exposed for tests and metrics.
    pub fn aggregator_count(&self) -> usize {
        self.state.cleanup();
        self.state.aggs.lock().len()
    }

    fn next_msg_id(&self, dst: &S::Addr) -> u32 {
        let mut ids = self.state.msg_ids.lock();
        let counter = ids.entry(dst.key()).or_insert(0);
        let id = *counter;
        *counter = counter.wrapping_add(1);
        id
    }

    fn handle_lower(&self, msg: Message<S::Addr>) -> Option<Message<S::Addr>> {
        let (id, part, total, data) = match parse_frame(&msg.payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(src = %msg.src.key(), %err, "dropping malformed fragment");
                return None;
            }
        };
        // Single-part messages skip the reassembly path entirely.
        if total == 1 {
            return Some(Message {
                src: msg.src,
                dst: msg.dst,
                payload: data.to_vec(),
            });
        }
        let key = AggKey {
            addr: msg.src.key(),
            id,
        };
        let agg = {
            let cutoff = Instant::now() - self.state.config.ttl;
            let mut aggs = self.state.aggs.lock();
            let agg = aggs
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Aggregator::new(total)));
            // A part for a stale reassembly starts a fresh one; old parts
            // never complete a message.
            if agg.is_stale(cutoff) {
                *agg = Arc::new(Aggregator::new(total));
            }
            agg.clone()
        };
        if agg.add_part(part, data) {
            let payload = agg.assemble();
            self.state.aggs.lock().remove(&key);
            return Some(Message {
                src: msg.src,
                dst: msg.dst,
                payload,
            });
        }
        None
    }
}

async fn sweep_loop<S: Swarm>(state: Weak<FragState<S>>) {
    loop {
        // Sweep first, then wait: stale state never outlives a sweep
        // period past its TTL.
        let interval = match state.upgrade() {
            Some(s) => {
                s.cleanup();
                s.config.sweep_interval
            }
            None => return,
        };
        tokio::time::sleep(interval).await;
    }
}

#[async_trait]
impl<S: Swarm> Swarm for FragSwarm<S> {
    type Addr = S::Addr;

    async fn tell(&self, dst: &S::Addr, payload: &[u8]) -> Result<(), SwarmError> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(SwarmError::Closed);
        }
        if payload.len() > self.state.config.mtu {
            return Err(SwarmError::MessageTooLarge {
                size: payload.len(),
                mtu: self.state.config.mtu,
            });
        }
        let under = self.state.lower.mtu(dst).await.saturating_sub(FRAG_OVERHEAD);
        if under == 0 {
            return Err(SwarmError::Transport(
                "lower MTU cannot fit a fragment header".into(),
            ));
        }
        let id = self.next_msg_id(dst);
        let total = payload.len().div_ceil(under).max(1);
        let total = u32::try_from(total).map_err(|_| SwarmError::MessageTooLarge {
            size: payload.len(),
            mtu: self.state.config.mtu,
        })?;

        if total == 1 {
            let frame = make_frame(id, 0, 1, payload);
            return self.state.lower.tell(dst, &frame).await;
        }

        let frames: Vec<Vec<u8>> = (0..total)
            .map(|part| {
                let start = under * part as usize;
                let end = payload.len().min(start + under);
                make_frame(id, part, total, &payload[start..end])
            })
            .collect();
        futures::future::try_join_all(
            frames.iter().map(|frame| self.state.lower.tell(dst, frame)),
        )
        .await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Message<S::Addr>, SwarmError> {
        loop {
            let msg = self.state.lower.recv().await?;
            if let Some(complete) = self.handle_lower(msg) {
                return Ok(complete);
            }
        }
    }

    async fn mtu(&self, _target: &S::Addr) -> usize {
        self.state.config.mtu
    }

    fn local_addrs(&self) -> Vec<S::Addr> {
        self.state.lower.local_addrs()
    }

    fn parse_addr(&self, data: &[u8]) -> Result<S::Addr, SwarmError> {
        self.state.lower.parse_addr(data)
    }

    async fn close(&self) -> Result<(), SwarmError> {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(handle) = self.state.sweeper.lock().take() {
            handle.abort();
        }
        self.state.lower.close().await
    }
}

#[async_trait]
impl<S: SecureSwarm> SecureSwarm for FragSwarm<S> {
    fn public_key(&self) -> PublicKey {
        self.state.lower.public_key()
    }

    async fn lookup_public_key(&self, target: &S::Addr) -> Result<PublicKey, SwarmError> {
        self.state.lower.lookup_public_key(target).await
    }
}

fn make_frame(id: u32, part: u32, total: u32, chunk: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAG_OVERHEAD + chunk.len());
    put_uvarint(&mut frame, u64::from(id));
    put_uvarint(&mut frame, u64::from(part));
    put_uvarint(&mut frame, u64::from(total));
    frame.extend_from_slice(chunk);
    frame
}

fn parse_frame(x: &[u8]) -> Result<(u32, u32, u32, &[u8]), SwarmError> {
    let mut offset = 0;
    let mut fields = [0u32; 3];
    for field in &mut fields {
        let (value, consumed) = read_uvarint(&x[offset..])
            .map_err(|e| SwarmError::Transport(format!("malformed fragment header: {e}")))?;
        *field = u32::try_from(value)
            .map_err(|_| SwarmError::Transport("fragment header field overflow".into()))?;
        offset += consumed;
    }
    let [id, part, total] = fields;
    if part >= total {
        return Err(SwarmError::Transport(format!(
            "fragment part {part} out of range for total {total}"
        )));
    }
    Ok((id, part, total, &x[offset..]))
}

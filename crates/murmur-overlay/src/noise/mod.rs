//! Noise secure swarm.
//!
//! Authenticated encryption between peers over any lower swarm. Each pair
//! of lower addresses runs per-direction sessions: the cache is keyed by
//! `(lower remote address, role)`, so a session we initiated and one the
//! peer initiated coexist and the simultaneous-open race needs no
//! tiebreaker. Addresses are `(PeerId, lower address)`; a dial fails with
//! [`SwarmError::WrongPeer`] when the peer at the lower address proves a
//! different identity than the one asked for.

mod frame;
mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use murmur_core::{put_uvarint, read_uvarint, Identity, PeerId, PublicKey, PEER_ID_SIZE};
use murmur_swarm::{Addr, Message, SecureSwarm, Swarm, SwarmError};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use frame::parse_frame;
use session::{HandleOutcome, Role, Session};

pub use session::NOISE_PATTERN;

/// Per-message wire overhead: kind byte, 32-bit nonce, AEAD tag.
pub const NOISE_OVERHEAD: usize = 1 + 4 + 16;

/// Configuration for a noise swarm.
#[derive(Debug, Clone)]
pub struct NoiseConfig {
    /// Lifetime of a session from creation; expired sessions are reaped
    pub max_session_life: Duration,
    /// Handshake attempts before a dial gives up
    pub max_dial_attempts: u32,
    /// Backoff cap between dial attempts
    pub max_dial_backoff: Duration,
    /// How long one attempt waits for session readiness
    pub dial_attempt_timeout: Duration,
    /// How often the reaper scans for expired sessions
    pub cleanup_interval: Duration,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            max_session_life: Duration::from_secs(60),
            max_dial_attempts: 10,
            max_dial_backoff: Duration::from_secs(1),
            dial_attempt_timeout: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Address of a peer on a noise swarm: identity plus lower address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NoiseAddr<A> {
    /// Identity the connection is bound to
    pub id: PeerId,
    /// Address on the lower swarm
    pub addr: A,
}

impl<A: Addr> Addr for NoiseAddr<A> {
    fn marshal(&self) -> Vec<u8> {
        let lower = self.addr.marshal();
        let mut out = Vec::with_capacity(PEER_ID_SIZE + lower.len() + 4);
        put_uvarint(&mut out, PEER_ID_SIZE as u64);
        out.extend_from_slice(self.id.as_bytes());
        put_uvarint(&mut out, lower.len() as u64);
        out.extend_from_slice(&lower);
        out
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    raddr: String,
    initiator: bool,
}

struct NoiseState<S: Swarm> {
    lower: S,
    identity: Identity,
    local_id: PeerId,
    config: NoiseConfig,
    sessions: RwLock<HashMap<SessionKey, Arc<Session>>>,
    closed: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// A secure overlay swarm running Noise sessions per peer.
pub struct NoiseSwarm<S: Swarm> {
    state: Arc<NoiseState<S>>,
}

impl<S: Swarm> NoiseSwarm<S> {
    /// Wraps `lower` with the default configuration.
    pub fn new(lower: S, identity: Identity) -> Self {
        Self::with_config(lower, identity, NoiseConfig::default())
    }

    /// Wraps `lower` with an explicit configuration.
    pub fn with_config(lower: S, identity: Identity, config: NoiseConfig) -> Self {
        let local_id = PeerId::from_public_key(&identity.public_key());
        let state = Arc::new(NoiseState {
            lower,
            identity,
            local_id,
            config,
            sessions: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            reaper: Mutex::new(None),
        });
        let handle = tokio::spawn(reap_loop(Arc::downgrade(&state)));
        *state.reaper.lock() = Some(handle);
        Self { state }
    }

    /// The local peer id.
    pub fn local_id(&self) -> PeerId {
        self.state.local_id
    }

    /// Number of live sessions. Exposed for tests and metrics.
    pub fn session_count(&self) -> usize {
        self.state.sessions.read().len()
    }

    fn check_open(&self) -> Result<(), SwarmError> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(SwarmError::Closed);
        }
        Ok(())
    }

    /// Returns the cached session in `role` toward `raddr`, replacing it
    /// with a fresh one if it is expired or errored.
    fn get_or_create_session(&self, raddr: &S::Addr, role: Role) -> (Arc<Session>, bool) {
        let now = Instant::now();
        let key = SessionKey {
            raddr: raddr.key(),
            initiator: role == Role::Initiator,
        };
        let mut sessions = self.state.sessions.write();
        if let Some(sess) = sessions.get(&key) {
            if !sess.is_expired(now) && !sess.is_errored() {
                return (sess.clone(), false);
            }
        }
        let sess = Arc::new(Session::new(role, self.state.config.max_session_life));
        sessions.insert(key, sess.clone());
        (sess, true)
    }

    /// Picks a ready, unexpired session toward `raddr` in either role,
    /// choosing randomly when both are usable.
    fn get_any_ready_session(&self, raddr: &S::Addr) -> Option<Arc<Session>> {
        let now = Instant::now();
        let raddr_key = raddr.key();
        let sessions = self.state.sessions.read();
        let mut candidates: Vec<Arc<Session>> = [true, false]
            .into_iter()
            .filter_map(|initiator| {
                sessions.get(&SessionKey {
                    raddr: raddr_key.clone(),
                    initiator,
                })
            })
            .filter(|sess| sess.is_ready() && !sess.is_expired(now))
            .cloned()
            .collect();
        if candidates.len() > 1 && rand::random::<bool>() {
            candidates.swap(0, 1);
        }
        candidates.into_iter().next()
    }

    /// Removes the session at `(raddr, role)` if it is still `sess`.
    fn delete_session(&self, raddr_key: &str, role: Role, sess: &Arc<Session>) {
        let key = SessionKey {
            raddr: raddr_key.to_string(),
            initiator: role == Role::Initiator,
        };
        let mut sessions = self.state.sessions.write();
        if let Some(current) = sessions.get(&key) {
            if Arc::ptr_eq(current, sess) {
                sessions.remove(&key);
            }
        }
    }

    /// Gets or starts an initiator session toward `raddr` and waits for it
    /// to become ready.
    async fn dial_session(&self, raddr: &S::Addr) -> Result<Arc<Session>, SwarmError> {
        let (sess, created) = self.get_or_create_session(raddr, Role::Initiator);
        if created {
            let hello = match sess.start_handshake() {
                Ok(hello) => hello,
                Err(err) => {
                    self.delete_session(&raddr.key(), Role::Initiator, &sess);
                    return Err(err);
                }
            };
            if let Err(err) = self.state.lower.tell(raddr, &hello).await {
                self.delete_session(&raddr.key(), Role::Initiator, &sess);
                return Err(err);
            }
        }
        match tokio::time::timeout(self.state.config.dial_attempt_timeout, sess.ready()).await {
            Ok(Ok(())) => Ok(sess),
            Ok(Err(err)) => {
                self.delete_session(&raddr.key(), Role::Initiator, &sess);
                Err(err)
            }
            Err(_) => {
                // A stalled handshake is abandoned so the next attempt
                // resends the hello on a fresh session.
                self.delete_session(&raddr.key(), Role::Initiator, &sess);
                Err(SwarmError::DialTimeout)
            }
        }
    }

    /// Checks that `sess` proves the identity `dst` asks for.
    fn check_peer(&self, dst: &NoiseAddr<S::Addr>, sess: &Arc<Session>) -> Result<(), SwarmError> {
        let Some(have) = sess.remote_id() else {
            return Err(SwarmError::HandshakeFailed("session lost readiness".into()));
        };
        if have != dst.id {
            self.delete_session(&dst.addr.key(), sess.role(), sess);
            return Err(SwarmError::WrongPeer { want: dst.id, have });
        }
        Ok(())
    }

    /// Processes one lower datagram; returns a decrypted message when one
    /// is ready for delivery.
    async fn handle_lower(
        &self,
        msg: Message<S::Addr>,
    ) -> Result<Option<Message<NoiseAddr<S::Addr>>>, SwarmError> {
        let frame = match parse_frame(&msg.payload) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(src = %msg.src.key(), %err, "dropping malformed noise frame");
                return Ok(None);
            }
        };
        // Frames from the connection's initiator land in our responder
        // session, and vice versa.
        let role = if frame.kind.from_initiator() {
            Role::Responder
        } else {
            Role::Initiator
        };
        // On session error, retry once against a fresh session.
        for _ in 0..2 {
            let (sess, _) = self.get_or_create_session(&msg.src, role);
            match sess.handle_frame(&frame, &self.state.identity) {
                Ok(HandleOutcome::None) => return Ok(None),
                Ok(HandleOutcome::Reply(out)) => {
                    if let Err(err) = self.state.lower.tell(&msg.src, &out).await {
                        tracing::warn!(dst = %msg.src.key(), %err, "failed to send handshake reply");
                    }
                    return Ok(None);
                }
                Ok(HandleOutcome::Deliver(payload)) => {
                    let Some(remote_id) = sess.remote_id() else {
                        return Ok(None);
                    };
                    return Ok(Some(Message {
                        src: NoiseAddr {
                            id: remote_id,
                            addr: msg.src,
                        },
                        dst: NoiseAddr {
                            id: self.state.local_id,
                            addr: msg.dst,
                        },
                        payload,
                    }));
                }
                Err(err) => {
                    if sess.is_errored() {
                        self.delete_session(&msg.src.key(), role, &sess);
                        continue;
                    }
                    tracing::warn!(src = %msg.src.key(), %err, "dropping noise frame");
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }
}

async fn reap_loop<S: Swarm>(state: Weak<NoiseState<S>>) {
    loop {
        let interval = match state.upgrade() {
            Some(s) => s.config.cleanup_interval,
            None => return,
        };
        tokio::time::sleep(interval).await;
        let Some(state) = state.upgrade() else { return };
        let now = Instant::now();
        state
            .sessions
            .write()
            .retain(|_, sess| !sess.is_expired(now));
    }
}

/// Exponential backoff capped at `max`, with symmetric +/-50% jitter.
fn backoff_time(attempt: u32, max: Duration) -> Duration {
    let base = Duration::from_millis(1u64 << attempt.min(20));
    let capped = base.min(max);
    capped.mul_f64(rand::random::<f64>() + 0.5)
}

#[async_trait]
impl<S: Swarm> Swarm for NoiseSwarm<S> {
    type Addr = NoiseAddr<S::Addr>;

    async fn tell(&self, dst: &Self::Addr, payload: &[u8]) -> Result<(), SwarmError> {
        self.check_open()?;
        let mtu = self.mtu(dst).await;
        if payload.len() > mtu {
            return Err(SwarmError::MessageTooLarge {
                size: payload.len(),
                mtu,
            });
        }
        // Fast path: an existing ready session.
        if let Some(sess) = self.get_any_ready_session(&dst.addr) {
            self.check_peer(dst, &sess)?;
            let frame = sess.encrypt(payload)?;
            return self.state.lower.tell(&dst.addr, &frame).await;
        }
        // Dial, with capped exponential backoff between attempts.
        let mut last_err = SwarmError::DialTimeout;
        for attempt in 0..self.state.config.max_dial_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_time(attempt, self.state.config.max_dial_backoff))
                    .await;
            }
            match self.dial_session(&dst.addr).await {
                Ok(sess) => {
                    self.check_peer(dst, &sess)?;
                    let frame = sess.encrypt(payload)?;
                    return self.state.lower.tell(&dst.addr, &frame).await;
                }
                Err(err @ SwarmError::Closed) => return Err(err),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    async fn recv(&self) -> Result<Message<Self::Addr>, SwarmError> {
        loop {
            let msg = self.state.lower.recv().await?;
            if let Some(delivered) = self.handle_lower(msg).await? {
                return Ok(delivered);
            }
        }
    }

    async fn mtu(&self, target: &Self::Addr) -> usize {
        self.state
            .lower
            .mtu(&target.addr)
            .await
            .saturating_sub(NOISE_OVERHEAD)
    }

    fn local_addrs(&self) -> Vec<Self::Addr> {
        self.state
            .lower
            .local_addrs()
            .into_iter()
            .map(|addr| NoiseAddr {
                id: self.state.local_id,
                addr,
            })
            .collect()
    }

    fn parse_addr(&self, data: &[u8]) -> Result<Self::Addr, SwarmError> {
        let (id_part, rest) = read_part(data)?;
        let id_bytes: [u8; PEER_ID_SIZE] = id_part
            .try_into()
            .map_err(|_| SwarmError::InvalidAddr("peer id must be 32 bytes".into()))?;
        let (lower_part, rest) = read_part(rest)?;
        if !rest.is_empty() {
            return Err(SwarmError::InvalidAddr("trailing address bytes".into()));
        }
        Ok(NoiseAddr {
            id: PeerId::new(id_bytes),
            addr: self.state.lower.parse_addr(lower_part)?,
        })
    }

    async fn close(&self) -> Result<(), SwarmError> {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(handle) = self.state.reaper.lock().take() {
            handle.abort();
        }
        self.state.sessions.write().clear();
        self.state.lower.close().await
    }
}

#[async_trait]
impl<S: Swarm> SecureSwarm for NoiseSwarm<S> {
    fn public_key(&self) -> PublicKey {
        self.state.identity.public_key()
    }

    async fn lookup_public_key(&self, target: &Self::Addr) -> Result<PublicKey, SwarmError> {
        self.check_open()?;
        if let Some(sess) = self.get_any_ready_session(&target.addr) {
            if sess.remote_id() == Some(target.id) {
                if let Some(public) = sess.remote_public_key() {
                    return Ok(public);
                }
            }
        }
        Err(SwarmError::PublicKeyNotFound)
    }
}

/// Reads one uvarint-length-prefixed part of a composite address.
fn read_part(data: &[u8]) -> Result<(&[u8], &[u8]), SwarmError> {
    let (len, consumed) =
        read_uvarint(data).map_err(|e| SwarmError::InvalidAddr(e.to_string()))?;
    let len = usize::try_from(len).map_err(|_| SwarmError::InvalidAddr("length overflow".into()))?;
    let rest = &data[consumed..];
    if rest.len() < len {
        return Err(SwarmError::InvalidAddr("truncated address part".into()));
    }
    Ok((&rest[..len], &rest[len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped_and_jittered() {
        let max = Duration::from_secs(1);
        for attempt in 0..12 {
            let d = backoff_time(attempt, max);
            assert!(d <= max.mul_f64(1.5), "attempt {attempt} backoff {d:?}");
        }
    }

    #[test]
    fn test_noise_overhead_matches_frame_layout() {
        assert_eq!(NOISE_OVERHEAD, frame::FRAME_HEADER + 16);
    }
}

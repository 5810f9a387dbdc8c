//! Per-peer noise session state machine.
//!
//! Sessions run the Noise_NN handshake and bind static identities to it by
//! signing running handshake hashes: the responder signs the hash after the
//! initiator's hello and carries the signature in its own hello payload;
//! the initiator signs the final hash and sends it encrypted as its first
//! transport message (send nonce 0). A session is ready only once the
//! peer's signature has verified.
//!
//! After the handshake, frames are AEAD-sealed with explicit wire nonces
//! through snow's stateless transport, so datagrams may arrive out of
//! order; the receiver accepts only nonces above the highest seen.
//!
//! State machine: Created -> Handshaking -> Ready -> {Expired, Errored}.
//! Terminal states cause fresh dials to replace the session.

use std::time::{Duration, Instant};

use murmur_core::{
    marshal_public_key, parse_public_key, sign, verify, Identity, PeerId, PublicKey,
    MARSHALED_PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};
use murmur_swarm::SwarmError;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::frame::{make_frame, Frame, FrameKind};

/// Signing purpose binding identity signatures to this protocol.
pub(crate) const SIGN_PURPOSE: &str = "murmur/noise";

/// Noise pattern run by every session.
pub const NOISE_PATTERN: &str = "Noise_NN_25519_ChaChaPoly_BLAKE2s";

/// Which side of the handshake this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Initiator,
    Responder,
}

/// What the swarm should do after feeding a frame to a session.
pub(crate) enum HandleOutcome {
    /// Frame consumed; nothing further
    None,
    /// Send this frame to the peer
    Reply(Vec<u8>),
    /// Deliver this decrypted payload upward
    Deliver(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Ready,
    Errored,
}

struct ReadyCore {
    transport: snow::StatelessTransportState,
    remote_public: PublicKey,
    remote_id: PeerId,
    send_nonce: u32,
    recv_highest: Option<u32>,
}

enum Core {
    /// Fresh session; nothing on the wire yet
    Created,
    /// Initiator: hello sent, waiting for the responder hello
    AwaitResp {
        hs: Box<snow::HandshakeState>,
        hello_hash: Vec<u8>,
    },
    /// Responder: hello sent, waiting for the initiator intro at nonce 0
    AwaitIntro {
        transport: snow::StatelessTransportState,
        final_hash: Vec<u8>,
    },
    Ready(ReadyCore),
    Errored(SwarmError),
}

pub(crate) struct Session {
    role: Role,
    created_at: Instant,
    max_life: Duration,
    core: Mutex<Core>,
    status_tx: watch::Sender<Status>,
}

impl Session {
    pub(crate) fn new(role: Role, max_life: Duration) -> Self {
        let (status_tx, _) = watch::channel(Status::Pending);
        Self {
            role,
            created_at: Instant::now(),
            max_life,
            core: Mutex::new(Core::Created),
            status_tx,
        }
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn is_ready(&self) -> bool {
        *self.status_tx.borrow() == Status::Ready
    }

    pub(crate) fn is_errored(&self) -> bool {
        *self.status_tx.borrow() == Status::Errored
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.max_life
    }

    pub(crate) fn remote_id(&self) -> Option<PeerId> {
        match &*self.core.lock() {
            Core::Ready(ready) => Some(ready.remote_id),
            _ => None,
        }
    }

    pub(crate) fn remote_public_key(&self) -> Option<PublicKey> {
        match &*self.core.lock() {
            Core::Ready(ready) => Some(ready.remote_public.clone()),
            _ => None,
        }
    }

    /// Waits until the session is ready, or returns its terminal error.
    pub(crate) async fn ready(&self) -> Result<(), SwarmError> {
        let mut status = self.status_tx.subscribe();
        let status = status
            .wait_for(|s| *s != Status::Pending)
            .await
            .map_err(|_| SwarmError::Closed)?;
        match *status {
            Status::Ready => Ok(()),
            _ => Err(self.error_or_default()),
        }
    }

    fn error_or_default(&self) -> SwarmError {
        match &*self.core.lock() {
            Core::Errored(err) => err.clone(),
            _ => SwarmError::HandshakeFailed("session failed".into()),
        }
    }

    fn fail(&self, core: &mut Core, err: SwarmError) -> SwarmError {
        *core = Core::Errored(err.clone());
        let _ = self.status_tx.send(Status::Errored);
        err
    }

    /// Initiator only: writes the opening hello frame.
    pub(crate) fn start_handshake(&self) -> Result<Vec<u8>, SwarmError> {
        let mut core = self.core.lock();
        if !matches!(*core, Core::Created) || self.role != Role::Initiator {
            return Err(SwarmError::HandshakeFailed(
                "handshake already started".into(),
            ));
        }
        let mut hs = new_handshake_state(Role::Initiator)
            .map_err(|e| self.fail(&mut core, SwarmError::HandshakeFailed(e.to_string())))?;
        let mut buf = vec![0u8; 128];
        let n = hs
            .write_message(&[], &mut buf)
            .map_err(|e| self.fail(&mut core, SwarmError::HandshakeFailed(e.to_string())))?;
        buf.truncate(n);
        let hello_hash = hs.get_handshake_hash().to_vec();
        *core = Core::AwaitResp {
            hs: Box::new(hs),
            hello_hash,
        };
        Ok(make_frame(FrameKind::HelloInit, 0, &buf))
    }

    /// Encrypts an application payload into a data frame.
    pub(crate) fn encrypt(&self, payload: &[u8]) -> Result<Vec<u8>, SwarmError> {
        let mut core = self.core.lock();
        let sealed = match &mut *core {
            Core::Ready(ready) => {
                let nonce = ready.send_nonce;
                match nonce.checked_add(1) {
                    None => Err(SwarmError::Transport("session nonce space exhausted".into())),
                    Some(next) => {
                        let mut buf = vec![0u8; payload.len() + 16];
                        match ready.transport.write_message(u64::from(nonce), payload, &mut buf)
                        {
                            Ok(n) => {
                                buf.truncate(n);
                                ready.send_nonce = next;
                                Ok((nonce, buf))
                            }
                            Err(e) => {
                                return Err(SwarmError::Transport(format!(
                                    "encryption failed: {e}"
                                )))
                            }
                        }
                    }
                }
            }
            Core::Errored(err) => return Err(err.clone()),
            _ => return Err(SwarmError::HandshakeFailed("session not ready".into())),
        };
        match sealed {
            Ok((nonce, ciphertext)) => {
                let kind = match self.role {
                    Role::Initiator => FrameKind::DataInit,
                    Role::Responder => FrameKind::DataResp,
                };
                Ok(make_frame(kind, nonce, &ciphertext))
            }
            Err(err) => Err(self.fail(&mut core, err)),
        }
    }

    /// Feeds an inbound frame to the session.
    pub(crate) fn handle_frame(
        &self,
        frame: &Frame<'_>,
        identity: &Identity,
    ) -> Result<HandleOutcome, SwarmError> {
        let mut core = self.core.lock();
        match (self.role, frame.kind) {
            (Role::Responder, FrameKind::HelloInit) => self.handle_hello_init(&mut core, frame, identity),
            (Role::Initiator, FrameKind::HelloResp) => self.handle_hello_resp(&mut core, frame, identity),
            (Role::Responder, FrameKind::DataInit) | (Role::Initiator, FrameKind::DataResp) => {
                self.handle_data(&mut core, frame)
            }
            _ => {
                let err = SwarmError::HandshakeFailed(format!(
                    "unexpected {:?} frame for {:?} session",
                    frame.kind, self.role
                ));
                Err(self.fail(&mut core, err))
            }
        }
    }

    fn handle_hello_init(
        &self,
        core: &mut Core,
        frame: &Frame<'_>,
        identity: &Identity,
    ) -> Result<HandleOutcome, SwarmError> {
        if !matches!(core, Core::Created) {
            // A fresh hello against an in-progress session: the peer has
            // restarted its handshake. Fail so the swarm replaces us.
            let err = SwarmError::HandshakeFailed("hello for established session".into());
            return Err(self.fail(core, err));
        }
        let mut hs = new_handshake_state(Role::Responder)
            .map_err(|e| self.fail(core, SwarmError::HandshakeFailed(e.to_string())))?;
        let mut payload = vec![0u8; frame.body.len()];
        hs.read_message(frame.body, &mut payload)
            .map_err(|e| self.fail(core, SwarmError::HandshakeFailed(e.to_string())))?;
        let hello_hash = hs.get_handshake_hash().to_vec();
        let intro = make_intro(identity, &hello_hash);
        let mut buf = vec![0u8; intro.len() + 128];
        let n = hs
            .write_message(&intro, &mut buf)
            .map_err(|e| self.fail(core, SwarmError::HandshakeFailed(e.to_string())))?;
        buf.truncate(n);
        let final_hash = hs.get_handshake_hash().to_vec();
        let transport = hs
            .into_stateless_transport_mode()
            .map_err(|e| self.fail(core, SwarmError::HandshakeFailed(e.to_string())))?;
        *core = Core::AwaitIntro {
            transport,
            final_hash,
        };
        Ok(HandleOutcome::Reply(make_frame(FrameKind::HelloResp, 0, &buf)))
    }

    fn handle_hello_resp(
        &self,
        core: &mut Core,
        frame: &Frame<'_>,
        identity: &Identity,
    ) -> Result<HandleOutcome, SwarmError> {
        let (mut hs, hello_hash) = match std::mem::replace(core, Core::Created) {
            Core::AwaitResp { hs, hello_hash } => (hs, hello_hash),
            Core::Ready(ready) => {
                // Duplicate responder hello; our intro may have been lost,
                // but the transcript cannot be replayed. Drop it.
                *core = Core::Ready(ready);
                return Ok(HandleOutcome::None);
            }
            other => {
                *core = other;
                let err = SwarmError::HandshakeFailed("responder hello out of order".into());
                return Err(self.fail(core, err));
            }
        };
        let mut payload = vec![0u8; frame.body.len()];
        let n = hs
            .read_message(frame.body, &mut payload)
            .map_err(|e| self.fail(core, SwarmError::HandshakeFailed(e.to_string())))?;
        payload.truncate(n);
        let (remote_public, remote_id) = verify_intro(&payload, &hello_hash)
            .map_err(|e| self.fail(core, e))?;
        let final_hash = hs.get_handshake_hash().to_vec();
        let mut transport = hs
            .into_stateless_transport_mode()
            .map_err(|e| self.fail(core, SwarmError::HandshakeFailed(e.to_string())))?;

        // Our own intro rides as the first transport message, nonce 0.
        let intro = make_intro(identity, &final_hash);
        let mut buf = vec![0u8; intro.len() + 16];
        let n = transport
            .write_message(0, &intro, &mut buf)
            .map_err(|e| self.fail(core, SwarmError::HandshakeFailed(e.to_string())))?;
        buf.truncate(n);

        *core = Core::Ready(ReadyCore {
            transport,
            remote_public,
            remote_id,
            send_nonce: 1,
            recv_highest: None,
        });
        let _ = self.status_tx.send(Status::Ready);
        Ok(HandleOutcome::Reply(make_frame(FrameKind::DataInit, 0, &buf)))
    }

    fn handle_data(&self, core: &mut Core, frame: &Frame<'_>) -> Result<HandleOutcome, SwarmError> {
        match std::mem::replace(core, Core::Created) {
            Core::AwaitIntro {
                mut transport,
                final_hash,
            } => {
                if frame.nonce != 0 {
                    // Data ahead of the intro cannot be authenticated yet.
                    *core = Core::AwaitIntro {
                        transport,
                        final_hash,
                    };
                    tracing::debug!("dropping data frame ahead of initiator intro");
                    return Ok(HandleOutcome::None);
                }
                let mut payload = vec![0u8; frame.body.len()];
                let n = match transport.read_message(0, frame.body, &mut payload) {
                    Ok(n) => n,
                    Err(e) => {
                        let err = SwarmError::HandshakeFailed(format!("intro decryption: {e}"));
                        return Err(self.fail(core, err));
                    }
                };
                payload.truncate(n);
                let (remote_public, remote_id) = match verify_intro(&payload, &final_hash) {
                    Ok(parts) => parts,
                    Err(e) => return Err(self.fail(core, e)),
                };
                *core = Core::Ready(ReadyCore {
                    transport,
                    remote_public,
                    remote_id,
                    send_nonce: 0,
                    recv_highest: Some(0),
                });
                let _ = self.status_tx.send(Status::Ready);
                Ok(HandleOutcome::None)
            }
            Core::Ready(mut ready) => {
                if let Some(highest) = ready.recv_highest {
                    if frame.nonce <= highest {
                        *core = Core::Ready(ready);
                        tracing::debug!(nonce = frame.nonce, "dropping replayed frame");
                        return Ok(HandleOutcome::None);
                    }
                }
                let mut payload = vec![0u8; frame.body.len()];
                match ready
                    .transport
                    .read_message(u64::from(frame.nonce), frame.body, &mut payload)
                {
                    Ok(n) => {
                        payload.truncate(n);
                        ready.recv_highest = Some(frame.nonce);
                        *core = Core::Ready(ready);
                        Ok(HandleOutcome::Deliver(payload))
                    }
                    Err(e) => {
                        let err = SwarmError::Transport(format!("decryption failed: {e}"));
                        Err(self.fail(core, err))
                    }
                }
            }
            other => {
                *core = other;
                let err = SwarmError::HandshakeFailed("data frame before handshake".into());
                Err(self.fail(core, err))
            }
        }
    }
}

fn new_handshake_state(role: Role) -> Result<snow::HandshakeState, snow::Error> {
    let params: snow::params::NoiseParams = NOISE_PATTERN.parse()?;
    let builder = snow::Builder::new(params);
    match role {
        Role::Initiator => builder.build_initiator(),
        Role::Responder => builder.build_responder(),
    }
}

/// Intro payload: canonical public key followed by a purpose-tagged
/// signature over the handshake hash.
fn make_intro(identity: &Identity, handshake_hash: &[u8]) -> Vec<u8> {
    let mut intro = marshal_public_key(&identity.public_key());
    intro.extend_from_slice(&sign(identity, SIGN_PURPOSE, handshake_hash).to_bytes());
    intro
}

fn verify_intro(intro: &[u8], handshake_hash: &[u8]) -> Result<(PublicKey, PeerId), SwarmError> {
    if intro.len() != MARSHALED_PUBLIC_KEY_SIZE + SIGNATURE_SIZE {
        return Err(SwarmError::HandshakeFailed(format!(
            "intro payload of {} bytes",
            intro.len()
        )));
    }
    let (key_bytes, sig_bytes) = intro.split_at(MARSHALED_PUBLIC_KEY_SIZE);
    let public = parse_public_key(key_bytes)
        .map_err(|e| SwarmError::HandshakeFailed(e.to_string()))?;
    let sig_bytes: [u8; SIGNATURE_SIZE] = sig_bytes
        .try_into()
        .map_err(|_| SwarmError::HandshakeFailed("bad signature length".into()))?;
    let sig = murmur_core::Signature::from_bytes(&sig_bytes);
    verify(&public, SIGN_PURPOSE, handshake_hash, &sig)
        .map_err(|_| SwarmError::HandshakeFailed("intro signature rejected".into()))?;
    Ok((public.clone(), PeerId::from_public_key(&public)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::frame::parse_frame;

    fn handshake_pair() -> (Session, Session, Identity, Identity) {
        let init_id = Identity::generate();
        let resp_id = Identity::generate();
        let initiator = Session::new(Role::Initiator, Duration::from_secs(60));
        let responder = Session::new(Role::Responder, Duration::from_secs(60));

        let hello = initiator.start_handshake().unwrap();
        let hello = parse_frame(&hello).unwrap();
        let HandleOutcome::Reply(resp_hello) = responder.handle_frame(&hello, &resp_id).unwrap()
        else {
            panic!("responder must reply to hello");
        };
        let resp_hello_parsed = parse_frame(&resp_hello).unwrap();
        let HandleOutcome::Reply(intro) =
            initiator.handle_frame(&resp_hello_parsed, &init_id).unwrap()
        else {
            panic!("initiator must send intro");
        };
        let intro_parsed = parse_frame(&intro).unwrap();
        assert!(matches!(
            responder.handle_frame(&intro_parsed, &resp_id).unwrap(),
            HandleOutcome::None
        ));

        (initiator, responder, init_id, resp_id)
    }

    #[test]
    fn test_handshake_binds_identities() {
        let (initiator, responder, init_id, resp_id) = handshake_pair();
        assert!(initiator.is_ready());
        assert!(responder.is_ready());
        assert_eq!(
            initiator.remote_id().unwrap(),
            PeerId::from_public_key(&resp_id.public_key())
        );
        assert_eq!(
            responder.remote_id().unwrap(),
            PeerId::from_public_key(&init_id.public_key())
        );
    }

    #[test]
    fn test_data_roundtrip_both_directions() {
        let (initiator, responder, init_id, resp_id) = handshake_pair();

        let frame = initiator.encrypt(b"from initiator").unwrap();
        let parsed = parse_frame(&frame).unwrap();
        let HandleOutcome::Deliver(payload) = responder.handle_frame(&parsed, &resp_id).unwrap()
        else {
            panic!("expected delivery");
        };
        assert_eq!(payload, b"from initiator");

        let frame = responder.encrypt(b"from responder").unwrap();
        let parsed = parse_frame(&frame).unwrap();
        let HandleOutcome::Deliver(payload) = initiator.handle_frame(&parsed, &init_id).unwrap()
        else {
            panic!("expected delivery");
        };
        assert_eq!(payload, b"from responder");
    }

    #[test]
    fn test_replayed_nonce_is_dropped() {
        let (initiator, responder, _init_id, resp_id) = handshake_pair();

        let frame = initiator.encrypt(b"once").unwrap();
        let parsed = parse_frame(&frame).unwrap();
        assert!(matches!(
            responder.handle_frame(&parsed, &resp_id).unwrap(),
            HandleOutcome::Deliver(_)
        ));
        let replay = parse_frame(&frame).unwrap();
        assert!(matches!(
            responder.handle_frame(&replay, &resp_id).unwrap(),
            HandleOutcome::None
        ));
        assert!(!responder.is_errored());
    }

    #[test]
    fn test_send_nonces_strictly_increase() {
        let (initiator, responder, _init_id, resp_id) = handshake_pair();
        let mut last = None;
        for i in 0..5u32 {
            let frame = initiator.encrypt(format!("msg {i}").as_bytes()).unwrap();
            let parsed = parse_frame(&frame).unwrap();
            if let Some(prev) = last {
                assert!(parsed.nonce > prev);
            }
            last = Some(parsed.nonce);
            assert!(matches!(
                responder.handle_frame(&parsed, &resp_id).unwrap(),
                HandleOutcome::Deliver(_)
            ));
        }
    }

    #[test]
    fn test_tampered_ciphertext_errors_session() {
        let (initiator, responder, _init_id, resp_id) = handshake_pair();
        let mut frame = initiator.encrypt(b"payload").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let parsed = parse_frame(&frame).unwrap();
        assert!(responder.handle_frame(&parsed, &resp_id).is_err());
        assert!(responder.is_errored());
    }

    #[test]
    fn test_expiry() {
        let session = Session::new(Role::Initiator, Duration::from_millis(0));
        assert!(session.is_expired(Instant::now()));
        let session = Session::new(Role::Initiator, Duration::from_secs(60));
        assert!(!session.is_expired(Instant::now()));
    }

    #[test]
    fn test_encrypt_before_ready_fails() {
        let session = Session::new(Role::Initiator, Duration::from_secs(60));
        assert!(session.encrypt(b"too early").is_err());
    }
}

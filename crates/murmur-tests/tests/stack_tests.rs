//! Whole-stack composition: transport -> fragmenting -> noise -> mux ->
//! application channels, exercised end to end.

use std::sync::Arc;
use std::time::Duration;

use murmur_core::{Identity, PeerId};
use murmur_overlay::frag::FragSwarm;
use murmur_overlay::noise::{NoiseAddr, NoiseSwarm};
use murmur_overlay::Muxer;
use murmur_swarm::{MemAddr, MemRealm, MemSwarm, Swarm, SwarmError};
use murmur_tests::init_tracing;
use tokio::time::timeout;

type StackSwarm = NoiseSwarm<FragSwarm<MemSwarm>>;

struct StackNode {
    mux: Muxer<StackSwarm>,
    peer_id: PeerId,
    lower_addr: MemAddr,
}

impl StackNode {
    fn new(realm: &MemRealm) -> Self {
        let identity = Identity::generate();
        let peer_id = PeerId::from_public_key(&identity.public_key());
        let lower = realm.create_swarm();
        let lower_addr = lower.addr();
        let frag = FragSwarm::new(lower, 4096);
        let noise = NoiseSwarm::new(frag, identity);
        Self {
            mux: Muxer::new(noise),
            peer_id,
            lower_addr,
        }
    }

    fn addr(&self) -> NoiseAddr<MemAddr> {
        NoiseAddr {
            id: self.peer_id,
            addr: self.lower_addr,
        }
    }
}

#[tokio::test]
async fn test_large_payload_through_full_stack() {
    init_tracing();
    // Lower transport far smaller than the payload: fragmentation must
    // carry the encrypted frames.
    let realm = MemRealm::with_mtu(128);
    let a = StackNode::new(&realm);
    let b = StackNode::new(&realm);

    let a_chat = a.mux.open("chat").unwrap();
    let b_chat = Arc::new(b.mux.open("chat").unwrap());

    let payload: Vec<u8> = (0..2000u32).map(|i| (i * 7 % 256) as u8).collect();
    let receiver = {
        let b_chat = b_chat.clone();
        tokio::spawn(async move { b_chat.recv().await })
    };
    a_chat.tell(&b.addr(), &payload).await.unwrap();

    let msg = timeout(Duration::from_secs(5), receiver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload, payload, "payload survives the whole stack");
    assert_eq!(msg.src.id, a.peer_id, "identity survives the whole stack");
}

#[tokio::test]
async fn test_mtu_shrinks_at_each_layer() {
    init_tracing();
    let realm = MemRealm::with_mtu(128);
    let a = StackNode::new(&realm);
    let b = StackNode::new(&realm);

    let a_chat = a.mux.open("chat").unwrap();
    let b_addr = b.addr();

    let chat_mtu = a_chat.mtu(&b_addr).await;
    let mux_overhead = murmur_overlay::MUX_OVERHEAD;
    let noise_overhead = murmur_overlay::NOISE_OVERHEAD;
    // Each overlay's advertised MTU plus its overhead fits in the layer
    // below. The fragmenting layer advertises its enlarged MTU.
    assert_eq!(chat_mtu + mux_overhead + noise_overhead, 4096);
    assert!(chat_mtu > 0);
}

#[tokio::test]
async fn test_stack_close_propagates_to_transport() {
    init_tracing();
    let realm = MemRealm::new();
    let a = StackNode::new(&realm);
    let other = realm.create_swarm();

    let chat = a.mux.open("chat").unwrap();
    a.mux.close().await.unwrap();

    assert_eq!(chat.recv().await.unwrap_err(), SwarmError::Closed);
    // The transport endpoint is gone from the realm.
    assert!(matches!(
        other.tell(&a.lower_addr, b"x").await,
        Err(SwarmError::Transport(_))
    ));
}

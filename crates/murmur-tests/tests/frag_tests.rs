//! Fragmenting swarm integration tests: split/reassemble identity,
//! fragment counts, and TTL eviction of partial reassemblies.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use murmur_core::put_uvarint;
use murmur_overlay::frag::{FragConfig, FragSwarm, FRAG_OVERHEAD};
use murmur_swarm::{MemRealm, Swarm};
use murmur_tests::{init_tracing, CountingSwarm};
use tokio::time::timeout;

#[tokio::test]
async fn test_fragmentation_identity() {
    init_tracing();
    let realm = MemRealm::with_mtu(64);
    let a = FragSwarm::new(realm.create_swarm(), 4096);
    let b = Arc::new(FragSwarm::new(realm.create_swarm(), 4096));
    let b_addr = b.local_addrs()[0];

    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let receiver = {
        let b = b.clone();
        tokio::spawn(async move { b.recv().await })
    };
    a.tell(&b_addr, &payload).await.unwrap();

    let msg = timeout(Duration::from_secs(1), receiver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload, payload);
}

#[tokio::test]
async fn test_fragment_count_matches_lower_mtu() {
    init_tracing();
    let realm = MemRealm::with_mtu(16);
    let (counting, sent) = CountingSwarm::new(realm.create_swarm());
    let a = FragSwarm::new(counting, 1024);
    let b = Arc::new(FragSwarm::new(realm.create_swarm(), 1024));
    let b_addr = b.local_addrs()[0];

    let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
    let receiver = {
        let b = b.clone();
        tokio::spawn(async move { b.recv().await })
    };
    a.tell(&b_addr, &payload).await.unwrap();

    let msg = timeout(Duration::from_secs(5), receiver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload, payload);

    let chunk = 16 - FRAG_OVERHEAD;
    let expected = payload.len().div_ceil(chunk);
    assert_eq!(sent.load(Ordering::Relaxed), expected);
}

#[tokio::test]
async fn test_single_part_message_sends_one_frame() {
    let realm = MemRealm::new();
    let (counting, sent) = CountingSwarm::new(realm.create_swarm());
    let a = FragSwarm::new(counting, 1024);
    let b = Arc::new(FragSwarm::new(realm.create_swarm(), 1024));
    let b_addr = b.local_addrs()[0];

    let receiver = {
        let b = b.clone();
        tokio::spawn(async move { b.recv().await })
    };
    a.tell(&b_addr, b"small").await.unwrap();
    let msg = timeout(Duration::from_secs(1), receiver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload, b"small");
    assert_eq!(sent.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_empty_payload_roundtrip() {
    let realm = MemRealm::new();
    let a = FragSwarm::new(realm.create_swarm(), 1024);
    let b = Arc::new(FragSwarm::new(realm.create_swarm(), 1024));
    let b_addr = b.local_addrs()[0];

    let receiver = {
        let b = b.clone();
        tokio::spawn(async move { b.recv().await })
    };
    a.tell(&b_addr, b"").await.unwrap();
    let msg = timeout(Duration::from_secs(1), receiver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(msg.payload.is_empty());
}

#[tokio::test]
async fn test_oversized_payload_rejected() {
    let realm = MemRealm::new();
    let a = FragSwarm::new(realm.create_swarm(), 64);
    let b = realm.create_swarm();
    let payload = vec![0u8; 65];
    assert!(matches!(
        a.tell(&b.addr(), &payload).await,
        Err(murmur_swarm::SwarmError::MessageTooLarge { .. })
    ));
}

/// Two of three parts under untouched default timing: after six seconds
/// the five-second TTL has passed, nothing was delivered, and the
/// reassembly state is gone.
#[tokio::test]
async fn test_partial_reassembly_expires_with_default_timing() {
    init_tracing();
    let realm = MemRealm::new();
    let raw = realm.create_swarm();
    let receiver = Arc::new(FragSwarm::new(realm.create_swarm(), 1024));
    let dst = receiver.local_addrs()[0];

    let pending = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.recv().await })
    };

    for part in 0..2u64 {
        let mut frame = Vec::new();
        put_uvarint(&mut frame, 9); // msg id
        put_uvarint(&mut frame, part);
        put_uvarint(&mut frame, 3); // total
        frame.extend_from_slice(b"data");
        raw.tell(&dst, &frame).await.unwrap();
    }

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!pending.is_finished(), "partial message must not deliver");
    assert_eq!(receiver.aggregator_count(), 0, "state gone after the TTL");
    pending.abort();
}

/// A straggler part arriving after the TTL starts a fresh reassembly;
/// the stale parts can never complete the message.
#[tokio::test]
async fn test_stale_parts_do_not_complete() {
    init_tracing();
    let realm = MemRealm::new();
    let raw = realm.create_swarm();
    // Long sweep interval: only the arrival-path staleness check applies.
    let receiver = Arc::new(FragSwarm::with_config(
        realm.create_swarm(),
        FragConfig {
            mtu: 1024,
            ttl: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(60),
        },
    ));
    let dst = receiver.local_addrs()[0];

    let pending = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.recv().await })
    };

    let frame = |part: u64| {
        let mut frame = Vec::new();
        put_uvarint(&mut frame, 11); // msg id
        put_uvarint(&mut frame, part);
        put_uvarint(&mut frame, 3); // total
        frame.extend_from_slice(b"data");
        frame
    };
    raw.tell(&dst, &frame(0)).await.unwrap();
    raw.tell(&dst, &frame(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The final part of the now-expired message.
    raw.tell(&dst, &frame(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!pending.is_finished(), "stale parts must not complete");
    assert_eq!(receiver.aggregator_count(), 1, "straggler starts afresh");
    pending.abort();
}

/// A reassembly missing its final part is never delivered; the sweeper
/// drops it after the TTL and frees the state.
#[tokio::test]
async fn test_partial_reassembly_expires() {
    init_tracing();
    let realm = MemRealm::new();
    let raw = realm.create_swarm();
    let receiver = Arc::new(FragSwarm::with_config(
        realm.create_swarm(),
        FragConfig {
            mtu: 1024,
            ttl: Duration::from_millis(200),
            sweep_interval: Duration::from_millis(50),
        },
    ));
    let dst = receiver.local_addrs()[0];

    let pending = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.recv().await })
    };

    // Two parts of a three-part message, hand-framed; the third never
    // arrives.
    for part in 0..2u64 {
        let mut frame = Vec::new();
        put_uvarint(&mut frame, 7); // msg id
        put_uvarint(&mut frame, part);
        put_uvarint(&mut frame, 3); // total
        frame.extend_from_slice(b"data");
        raw.tell(&dst, &frame).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(!pending.is_finished(), "partial message must not deliver");
    assert_eq!(receiver.aggregator_count(), 0, "aggregator swept after TTL");
    pending.abort();
}

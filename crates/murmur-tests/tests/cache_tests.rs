//! XOR cache scenarios with realistic peer-id keys.

use murmur_core::{Identity, PeerId};
use murmur_kad::{leading_zeros, xor_distance, XorCache};

fn fresh_peer_id() -> PeerId {
    PeerId::from_public_key(&Identity::generate().public_key())
}

#[test]
fn test_capacity_holds_under_churn() {
    let locus = fresh_peer_id();
    let mut cache: XorCache<u32> = XorCache::new(locus.as_slice().to_vec(), 16, 1);

    for i in 0..200u32 {
        cache.put(fresh_peer_id().as_slice().to_vec(), i);
        assert!(cache.count() <= 17, "count bounded by max + 1");
    }
    assert!(cache.is_full());
    assert!(cache.accepting_prefix_len() <= locus.as_slice().len() * 8);
}

#[test]
fn test_neighborhood_of_locus_survives() {
    let locus = [0u8; 32];
    let mut cache: XorCache<&str> = XorCache::new(locus.to_vec(), 4, 0);

    // One close key, then a stream of far keys.
    let mut close = [0u8; 32];
    close[31] = 0x01; // 255 leading zero bits of distance
    cache.put(close.to_vec(), "close");

    for i in 0u8..32 {
        let mut far = [0u8; 32];
        far[0] = 0x80 | i; // 0 leading zero bits of distance
        cache.put(far.to_vec(), "far");
    }

    assert!(cache.contains(&close), "close key never evicted");
    assert_eq!(cache.count(), 4);
}

#[test]
fn test_closest_tracks_xor_metric() {
    let locus = [0u8; 4];
    let mut cache: XorCache<u8> = XorCache::new(locus.to_vec(), 16, 1);
    cache.put(vec![0x81, 0, 0, 0], 1);
    cache.put(vec![0x82, 0, 0, 0], 2);
    cache.put(vec![0x9F, 0, 0, 0], 3);

    let target = [0x83, 0, 0, 0];
    let (key, _) = cache.closest(&target).unwrap();
    let best = xor_distance(&target, key);
    cache.for_each(|k, _| {
        if leading_zeros(&xor_distance(&locus, k)) == 0 {
            assert!(best <= xor_distance(&target, k));
        }
        true
    });
}

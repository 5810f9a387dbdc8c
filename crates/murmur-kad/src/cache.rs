//! Locality-preserving bucketed cache.
//!
//! Entries are bucketed by the number of leading zero bits of
//! `XOR(locus, key)`, so higher bucket indices hold keys closer to the
//! locus. When the cache overflows, eviction scans buckets from index 0
//! upward and removes an entry from the first bucket holding more than
//! `min_per_bucket` entries. Far keys go first; the close neighborhood of
//! the locus survives.
//!
//! The cache is not synchronized; callers that share one synchronize
//! externally.

use std::collections::HashMap;

use crate::dist::{has_prefix, leading_zeros, xor_distance};

/// A key/value pair removed from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<V> {
    /// The entry's key
    pub key: Vec<u8>,
    /// The entry's value
    pub value: V,
}

/// XOR-distance bucketed cache.
pub struct XorCache<V> {
    locus: Vec<u8>,
    min_per_bucket: usize,
    count: usize,
    max: usize,
    buckets: Vec<HashMap<Vec<u8>, V>>,
}

impl<V> XorCache<V> {
    /// Creates a cache around `locus` holding at most `max` entries.
    ///
    /// `min_per_bucket` is the per-bucket floor: eviction never takes from
    /// a bucket at or below it.
    ///
    /// # Panics
    /// Panics if `max` is zero.
    pub fn new(locus: Vec<u8>, max: usize, min_per_bucket: usize) -> Self {
        assert!(max >= 1, "max must be at least 1");
        Self {
            locus,
            min_per_bucket,
            count: 0,
            max,
            buckets: Vec::new(),
        }
    }

    /// Returns the value at `key`.
    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.bucket(key).and_then(|b| b.get(key))
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Inserts or overwrites the entry at `key`, returning the evicted
    /// entry if the insert pushed the cache over capacity.
    pub fn put(&mut self, key: Vec<u8>, value: V) -> Option<Entry<V>> {
        let index = self.bucket_index(&key);
        while self.buckets.len() <= index {
            self.buckets.push(HashMap::new());
        }
        if self.buckets[index].insert(key, value).is_none() {
            self.count += 1;
        }
        if self.count > self.max {
            return self.evict();
        }
        None
    }

    /// Returns true if a put at `key` would add a new entry.
    pub fn would_add(&self, key: &[u8]) -> bool {
        !self.contains(key) && self.would_put(key)
    }

    /// Returns true if a put at `key` would fit without eviction, or would
    /// trigger an eviction of a strictly farther entry.
    pub fn would_put(&self, key: &[u8]) -> bool {
        if self.contains(key) {
            return true;
        }
        let index = self.bucket_index(key);
        if self.count + 1 <= self.max || index >= self.buckets.len() {
            return true;
        }
        self.buckets[..index]
            .iter()
            .any(|b| b.len() > self.min_per_bucket)
    }

    /// Removes and returns the entry at `key`.
    pub fn delete(&mut self, key: &[u8]) -> Option<Entry<V>> {
        let index = self.bucket_index(key);
        let bucket = self.buckets.get_mut(index)?;
        let value = bucket.remove(key)?;
        self.count -= 1;
        Some(Entry {
            key: key.to_vec(),
            value,
        })
    }

    /// Visits entries from the highest bucket down, so the keys closest to
    /// the locus come first. Stops early when `f` returns false.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], &V) -> bool) {
        for bucket in self.buckets.iter().rev() {
            for (key, value) in bucket {
                if !f(key, value) {
                    return;
                }
            }
        }
    }

    /// Visits every entry whose key matches the leading `nbits` of
    /// `prefix`.
    ///
    /// # Panics
    /// Panics if `prefix` is shorter than `nbits` bits.
    pub fn for_each_matching(&self, prefix: &[u8], nbits: usize, mut f: impl FnMut(&[u8], &V)) {
        let start = self.bucket_index(prefix);
        for bucket in self.buckets.iter().skip(start) {
            for (key, value) in bucket {
                if has_prefix(key, prefix, nbits) {
                    f(key, value);
                }
            }
        }
    }

    /// Returns the entry in `key`'s bucket closest to `key` by XOR
    /// distance.
    pub fn closest(&self, key: &[u8]) -> Option<(&[u8], &V)> {
        let bucket = self.bucket(key)?;
        let mut best: Option<(&[u8], &V, Vec<u8>)> = None;
        for (k, v) in bucket {
            let dist = xor_distance(key, k);
            match &best {
                Some((_, _, min)) if dist >= *min => {}
                _ => best = Some((k.as_slice(), v, dist)),
            }
        }
        best.map(|(k, v, _)| (k, v))
    }

    /// Returns whether the cache is full; further puts will attempt an
    /// eviction.
    pub fn is_full(&self) -> bool {
        self.count >= self.max
    }

    /// Number of entries in the cache.
    pub fn count(&self) -> usize {
        self.count
    }

    /// The shortest distance prefix length guaranteed to be retained:
    /// 0 while the cache has room, otherwise the eviction frontier.
    pub fn accepting_prefix_len(&self) -> usize {
        if self.count < self.max {
            return 0;
        }
        for (i, bucket) in self.buckets.iter().enumerate() {
            if bucket.len() > self.min_per_bucket {
                return i + 1;
            }
        }
        self.buckets.len()
    }

    /// The reference key for XOR distance.
    pub fn locus(&self) -> &[u8] {
        &self.locus
    }

    fn bucket(&self, key: &[u8]) -> Option<&HashMap<Vec<u8>, V>> {
        self.buckets.get(self.bucket_index(key))
    }

    fn bucket_index(&self, key: &[u8]) -> usize {
        leading_zeros(&xor_distance(&self.locus, key))
    }

    fn evict(&mut self) -> Option<Entry<V>> {
        let min = self.min_per_bucket;
        let bucket = self.buckets.iter_mut().find(|b| b.len() > min)?;
        let key = bucket.keys().next().cloned()?;
        let value = bucket.remove(&key)?;
        self.count -= 1;
        Some(Entry { key, value })
    }
}

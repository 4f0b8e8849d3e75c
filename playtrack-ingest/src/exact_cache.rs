//! Bounded exact-membership LRU map with per-entry expiry
//!
//! Membership is exact: a key is reported present only if it was inserted and
//! has been neither evicted nor expired. There are no false positives; an
//! evicted key simply reads as absent.
//!
//! Recency is tracked with a monotonically increasing sequence number per
//! entry and a `BTreeMap` from sequence to key, so the least recently used
//! entry is always the first element of the tree.
//!
//! Not synchronized; callers wrap it in a lock.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

struct Slot<V> {
    value: V,
    seq: u64,
    expires_at: Instant,
}

pub struct ExactLru<V> {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, Slot<V>>,
    recency: BTreeMap<u64, String>,
    next_seq: u64,
    evictions: u64,
}

impl<V: Clone> ExactLru<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_seq: 0,
            evictions: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries dropped to make room since creation
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Look up a live entry and mark it most recently used
    pub fn get(&mut self, key: &str) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            None => return None,
            Some(slot) => slot.expires_at <= now,
        };
        if expired {
            self.remove(key);
            return None;
        }

        let seq = self.bump_seq();
        let slot = self.entries.get_mut(key)?;
        self.recency.remove(&slot.seq);
        slot.seq = seq;
        self.recency.insert(seq, key.to_string());
        Some(slot.value.clone())
    }

    /// Membership test without touching recency
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|slot| slot.expires_at > Instant::now())
            .unwrap_or(false)
    }

    /// Insert or replace, evicting the least recently used entry when full
    pub fn insert(&mut self, key: String, value: V) {
        let seq = self.bump_seq();
        let expires_at = Instant::now() + self.ttl;

        if let Some(slot) = self.entries.get_mut(&key) {
            self.recency.remove(&slot.seq);
            slot.value = value;
            slot.seq = seq;
            slot.expires_at = expires_at;
            self.recency.insert(seq, key);
            return;
        }

        while self.entries.len() >= self.capacity {
            if !self.evict_oldest() {
                break;
            }
        }

        self.recency.insert(seq, key.clone());
        self.entries.insert(
            key,
            Slot {
                value,
                seq,
                expires_at,
            },
        );
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.seq);
        Some(slot.value)
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, slot)| slot.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn evict_oldest(&mut self) -> bool {
        let oldest = match self.recency.pop_first() {
            Some((_, key)) => key,
            None => return false,
        };
        self.entries.remove(&oldest);
        self.evictions += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn cache(capacity: usize) -> ExactLru<u32> {
        ExactLru::new(capacity, Duration::from_secs(60))
    }

    #[test]
    fn test_insert_and_get() {
        let mut lru = cache(4);
        lru.insert("a".to_string(), 1);
        assert_eq!(lru.get("a"), Some(1));
        assert!(lru.contains("a"));
        assert!(!lru.contains("b"));
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut lru = cache(2);
        lru.insert("a".to_string(), 1);
        lru.insert("b".to_string(), 2);
        // Touch "a" so "b" becomes the oldest
        assert_eq!(lru.get("a"), Some(1));
        lru.insert("c".to_string(), 3);

        assert!(lru.contains("a"));
        assert!(!lru.contains("b"));
        assert!(lru.contains("c"));
        assert_eq!(lru.len(), 2);
        assert_eq!(lru.evictions(), 1);
    }

    #[test]
    fn test_replace_does_not_grow() {
        let mut lru = cache(2);
        lru.insert("a".to_string(), 1);
        lru.insert("a".to_string(), 5);
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.get("a"), Some(5));
    }

    #[test]
    fn test_remove() {
        let mut lru = cache(2);
        lru.insert("a".to_string(), 1);
        assert_eq!(lru.remove("a"), Some(1));
        assert!(lru.is_empty());
        assert_eq!(lru.remove("a"), None);
    }

    #[test]
    fn test_expired_entries_read_as_absent() {
        let mut lru: ExactLru<u32> = ExactLru::new(4, Duration::from_millis(1));
        lru.insert("a".to_string(), 1);
        std::thread::sleep(Duration::from_millis(5));

        assert!(!lru.contains("a"));
        assert_eq!(lru.get("a"), None);
        assert!(lru.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let mut lru: ExactLru<u32> = ExactLru::new(4, Duration::from_millis(1));
        lru.insert("a".to_string(), 1);
        lru.insert("b".to_string(), 2);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(lru.purge_expired(), 2);
        assert!(lru.is_empty());
    }

    proptest! {
        #[test]
        fn never_reports_unrecorded_key(
            recorded in proptest::collection::vec("[a-z0-9:]{1,24}", 1..200),
            probes in proptest::collection::vec("[a-z0-9:]{1,24}", 1..200),
            capacity in 1usize..64,
        ) {
            let mut lru = cache(capacity);
            let recorded_set: HashSet<String> = recorded.iter().cloned().collect();
            for key in &recorded {
                lru.insert(key.clone(), 0);
            }
            for probe in &probes {
                if !recorded_set.contains(probe) {
                    prop_assert!(!lru.contains(probe));
                    prop_assert!(lru.get(probe).is_none());
                }
            }
            prop_assert!(lru.len() <= capacity);
        }
    }
}

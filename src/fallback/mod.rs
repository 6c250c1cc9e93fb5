//! Bounded in-process fallback tier with FIFO eviction.
//!
//! The fallback store is the safety net that lets the handler answer when the
//! primary store is unreachable. It holds at most `capacity` entries; when a
//! new key arrives at capacity, the entry that was *inserted* first is evicted,
//! regardless of how recently it was read. Entries never expire by time.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::entry::CacheEntry;

/// A fixed-capacity, insertion-ordered map from cache key to [`CacheEntry`].
///
/// All operations take `&self`; a single mutex makes evict-then-insert
/// atomic, so no reader can observe the store above capacity.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use serde_json::json;
/// use tagcache::entry::CacheEntry;
/// use tagcache::fallback::FallbackStore;
///
/// let store = FallbackStore::new(2);
/// let entry = |v: i32| CacheEntry::new(json!(v), Duration::from_secs(60), vec![]);
///
/// store.put("a", entry(1));
/// store.put("b", entry(2));
/// assert_eq!(store.put("c", entry(3)).as_deref(), Some("a"));
///
/// assert!(store.get("a").is_none());
/// assert_eq!(store.len(), 2);
/// ```
#[derive(Debug)]
pub struct FallbackStore {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Slot>,
    // Insertion ledger. Deleted keys leave stale records behind; a record is
    // live only while its sequence number matches the slot's.
    order: VecDeque<(u64, String)>,
    next_seq: u64,
}

#[derive(Debug)]
struct Slot {
    seq: u64,
    entry: CacheEntry,
}

impl FallbackStore {
    /// Creates an empty store. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of the entry stored under `key`.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.lock().entries.get(key).map(|slot| slot.entry.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Inserts or replaces `key`.
    ///
    /// Replacing an existing key keeps its original insertion position and
    /// evicts nothing. Inserting a new key at capacity evicts the
    /// oldest-inserted entry first and returns its key.
    pub fn put(&self, key: impl Into<String>, entry: CacheEntry) -> Option<String> {
        let key = key.into();
        let mut inner = self.lock();

        if let Some(slot) = inner.entries.get_mut(&key) {
            slot.entry = entry;
            return None;
        }

        let evicted = if inner.entries.len() >= self.capacity {
            inner.pop_oldest()
        } else {
            None
        };

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.push_back((seq, key.clone()));
        inner.entries.insert(key, Slot { seq, entry });
        inner.compact(self.capacity);

        evicted
    }

    /// Removes `key`. Returns `true` if it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.lock();
        let removed = inner.entries.remove(key).is_some();
        inner.compact(self.capacity);
        removed
    }

    /// Removes every key in `keys`. Returns how many were present.
    pub fn delete_many<K: AsRef<str>>(&self, keys: &[K]) -> usize {
        let mut inner = self.lock();
        let mut removed = 0;
        for key in keys {
            let key: &str = key.as_ref();
            if inner.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        inner.compact(self.capacity);
        removed
    }

    /// Removes every entry whose own tag list contains `tag`.
    ///
    /// Returns the removed keys.
    pub fn delete_tagged(&self, tag: &str) -> Vec<String> {
        let mut inner = self.lock();
        let doomed: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.has_tag(tag))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            inner.entries.remove(key);
        }
        inner.compact(self.capacity);
        doomed
    }

    /// Live keys, oldest insertion first.
    pub fn keys(&self) -> Vec<String> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter(|(seq, key)| inner.is_live(*seq, key))
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The map is never left half-updated across a panic point.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn is_live(&self, seq: u64, key: &str) -> bool {
        self.entries.get(key).is_some_and(|slot| slot.seq == seq)
    }

    fn pop_oldest(&mut self) -> Option<String> {
        while let Some((seq, key)) = self.order.pop_front() {
            if self.is_live(seq, &key) {
                self.entries.remove(&key);
                return Some(key);
            }
        }
        None
    }

    /// Drops stale ledger records once they outnumber live ones.
    fn compact(&mut self, capacity: usize) {
        if self.order.len() > capacity * 2 {
            let entries = &self.entries;
            self.order
                .retain(|(seq, key)| entries.get(key).is_some_and(|slot| slot.seq == *seq));
        }
    }
}

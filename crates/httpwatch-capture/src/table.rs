//! Bounded concurrent tables
//!
//! Every piece of cross-call state lives in a [`BoundedTable`]. Each operation
//! is atomic for its key and none of them holds a lock across another table
//! call. When a new key arrives at capacity the oldest entry is evicted.
//!
//! Eviction scans the whole table for the lowest sequence number, so it is
//! linear in the capacity. Concurrent inserters may overshoot the capacity
//! for a moment; each insert trims back down before returning, so the bound
//! holds once the inserts settle.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use httpwatch_core::TableSnapshot;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

#[derive(Debug)]
struct Slot<V> {
    value: V,
    seq: u64,
}

/// Fixed-capacity concurrent map with overwrite-on-collision
#[derive(Debug)]
pub struct BoundedTable<K, V>
where
    K: Eq + Hash,
{
    name: &'static str,
    capacity: usize,
    entries: DashMap<K, Slot<V>>,
    seq: AtomicU64,
    inserts: AtomicU64,
    overwrites: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> BoundedTable<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            entries: DashMap::with_capacity(capacity.min(4096)),
            seq: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            overwrites: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store `value`, returning the value it replaced
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        while self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if !self.evict_oldest() {
                break;
            }
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.inserts.fetch_add(1, Ordering::Relaxed);

        match self.entries.entry(key) {
            Entry::Occupied(mut slot) => {
                self.overwrites.fetch_add(1, Ordering::Relaxed);
                let old = slot.insert(Slot { value, seq });
                return Some(old.value);
            }
            Entry::Vacant(slot) => {
                slot.insert(Slot { value, seq });
            }
        }

        // Another inserter may have filled the room freed above
        while self.entries.len() > self.capacity {
            if !self.evict_oldest() {
                break;
            }
        }
        None
    }

    /// Remove and return the entry for `key`
    pub fn take(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, slot)| slot.value)
    }

    /// Remove the entry for `key`, reporting whether one existed
    pub fn remove(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Mutate an existing entry in place. Absent keys are left absent.
    pub fn update<F>(&self, key: &K, f: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        match self.entries.get_mut(key) {
            Some(mut slot) => {
                f(&mut slot.value);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            name: self.name.to_string(),
            len: self.entries.len(),
            capacity: self.capacity,
            inserts: self.inserts.load(Ordering::Relaxed),
            overwrites: self.overwrites.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn evict_oldest(&self) -> bool {
        // The iterator holds shard read locks; collect the key before removing.
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().seq)
            .map(|e| e.key().clone());

        let Some(key) = oldest else {
            return false;
        };
        // A concurrent take may have removed it first; that also frees room
        if self.entries.remove(&key).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            trace!("{}: evicted oldest entry at capacity {}", self.name, self.capacity);
        }
        true
    }
}

impl<K, V> BoundedTable<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Copy of the value stored for `key`
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|slot| slot.value.clone())
    }
}

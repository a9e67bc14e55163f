//! Concurrent TTL cache used for agents, parameter state, and gate configs.
//!
//! DashMap-backed: entries expire `ttl` after insertion and the oldest-read
//! entry is evicted once `max_size` is reached. Concurrent writes to the same
//! key are benign (last writer wins over an equal value on the rebuild path).

use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    last_accessed: Arc<RwLock<Instant>>,
}

pub struct TtlCache<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    max_size: usize,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_size,
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            if entry.inserted_at.elapsed() > self.ttl {
                drop(entry);
                self.entries.remove(key);
                return None;
            }
            *entry.last_accessed.write() = Instant::now();
            return Some(entry.value.clone());
        }
        None
    }

    pub fn insert(&self, key: K, value: V) {
        if self.entries.len() >= self.max_size && !self.entries.contains_key(&key) {
            self.evict_oldest();
        }
        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                last_accessed: Arc::new(RwLock::new(now)),
            },
        );
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| *entry.last_accessed.read())
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

//! Keyed copy-on-write cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Result of [`CacheStore::upsert_with`].
#[derive(Debug, Clone)]
pub struct Upserted<V> {
    /// Entry before the call, `None` when the key was new.
    pub old: Option<Arc<V>>,
    pub new: Arc<V>,
    /// False only when an existing entry was kept as the identical `Arc`.
    pub changed: bool,
}

impl<V> Upserted<V> {
    pub fn is_new(&self) -> bool {
        self.old.is_none()
    }
}

/// Process-wide map from domain key to an immutable value snapshot.
///
/// Constructed explicitly and handed to the repositories that own it.
#[derive(Debug)]
pub struct CacheStore<V> {
    name: &'static str,
    entries: DashMap<String, Arc<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> CacheStore<V> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let found = self.entries.get(key).map(|entry| Arc::clone(entry.value()));
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn set(&self, key: impl Into<String>, value: V) -> Arc<V> {
        let value = Arc::new(value);
        self.entries.insert(key.into(), Arc::clone(&value));
        value
    }

    pub fn set_batch<I, K>(&self, items: I) -> usize
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
    {
        let mut count = 0;
        for (key, value) in items {
            self.entries.insert(key.into(), Arc::new(value));
            count += 1;
        }
        count
    }

    pub fn delete(&self, key: &str) -> Option<Arc<V>> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
        }
    }

    /// Atomically derive a new entry for `key` from the current one.
    ///
    /// A missing key starts from `default()`. `apply` returns the entry to
    /// store; returning the same `Arc` it was given leaves the cache untouched.
    /// `apply` runs under the key's shard lock and must not call back into
    /// this cache.
    pub fn upsert_with<D, F>(&self, key: &str, default: D, apply: F) -> Upserted<V>
    where
        D: FnOnce() -> V,
        F: FnOnce(&Arc<V>) -> Arc<V>,
    {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let old = Arc::clone(slot.get());
                let new = apply(&old);
                let changed = !Arc::ptr_eq(&old, &new);
                if changed {
                    slot.insert(Arc::clone(&new));
                }
                Upserted {
                    old: Some(old),
                    new,
                    changed,
                }
            }
            Entry::Vacant(slot) => {
                let base = Arc::new(default());
                let new = apply(&base);
                slot.insert(Arc::clone(&new));
                Upserted {
                    old: None,
                    new,
                    changed: true,
                }
            }
        }
    }
}

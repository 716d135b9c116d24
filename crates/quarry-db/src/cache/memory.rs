//! In-process cache tier.
//!
//! A map of key to immutable payload guarded by a [`tokio::sync::RwLock`].
//! Lookups take the shared lock; writes, deletes, and resets take the
//! exclusive lock. Expired entries are evicted lazily when a lookup finds
//! them, and optionally by a periodic sweeper.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::cache::ttl::{Expiry, Ttl};

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Arc<[u8]>,
    expiry: Expiry,
}

/// In-process key/payload map with per-entry expiry.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The payload at `key`, if present and not expired.
    pub async fn get(&self, key: &str) -> Option<Arc<[u8]>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return None,
                Some(entry) if !entry.expiry.is_expired(now) => return Some(Arc::clone(&entry.payload)),
                Some(_) => {}
            }
        }

        // Expired: evict, unless a writer refreshed it in between.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.expiry.is_expired(now)) {
            entries.remove(key);
            tracing::debug!(key, "Evicted expired cache entry");
        }
        None
    }

    /// Store `payload` at `key`, replacing any previous entry.
    pub async fn set(&self, key: &str, payload: Arc<[u8]>, ttl: Ttl) {
        let expiry = ttl.expiry_from(Instant::now());
        self.entries
            .write()
            .await
            .insert(key.to_owned(), CacheEntry { payload, expiry });
    }

    /// Delete `key`. Returns whether it was present.
    pub async fn remove(&self, key: &str) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    /// Delete every key starting with `prefix`. Returns how many were removed.
    ///
    /// The exclusive lock is held across the whole scan and delete.
    pub async fn remove_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before.saturating_sub(entries.len())
    }

    /// Replace the whole map with an empty one.
    pub async fn reset(&self) -> usize {
        let old = std::mem::take(&mut *self.entries.write().await);
        old.len()
    }

    /// Remove every expired entry. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.expiry.is_expired(now));
        before.saturating_sub(entries.len())
    }

    /// Number of stored entries, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether no entries are stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Spawn a task that sweeps `cache` every `interval`.
    ///
    /// The task holds only a weak reference and exits once the cache is
    /// dropped.
    pub fn spawn_sweeper(cache: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(cache);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let evicted = cache.sweep().await;
                if evicted > 0 {
                    tracing::debug!(evicted, "Swept expired cache entries");
                }
            }
        })
    }
}

//! Networked cache tier.
//!
//! [`NetworkCache`] dispatches to a backend by enum rather than through a
//! trait object. Every backend offers the same contract: get, set with TTL,
//! delete, and prefix delete.
//!
//! [`LoopbackCache`] keeps entries in a map shared by every clone of the
//! handle. It serves single-node deployments that want a shared tier
//! without a server, and tests that need to control latency or
//! availability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::cache::dragonfly::DragonflyCache;
use crate::cache::ttl::{Expiry, Ttl};
use crate::error::DbError;

/// The networked cache tier.
#[derive(Debug, Clone)]
pub enum NetworkCache {
    /// A `Dragonfly`/Redis server.
    Dragonfly(DragonflyCache),
    /// A process-local shared map.
    Loopback(LoopbackCache),
}

impl NetworkCache {
    /// Backend name for logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Dragonfly(_) => "dragonfly",
            Self::Loopback(_) => "loopback",
        }
    }

    /// Read the payload at `key`. `Ok(None)` means not found.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the lookup fails.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DbError> {
        match self {
            Self::Dragonfly(c) => c.get(key).await,
            Self::Loopback(c) => c.get(key).await,
        }
    }

    /// Store `payload` at `key`.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the write fails.
    pub async fn set(&self, key: &str, payload: &[u8], ttl: Ttl) -> Result<(), DbError> {
        match self {
            Self::Dragonfly(c) => c.set(key, payload, ttl).await,
            Self::Loopback(c) => c.set(key, payload, ttl).await,
        }
    }

    /// Delete `key`.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the delete fails.
    pub async fn delete(&self, key: &str) -> Result<(), DbError> {
        match self {
            Self::Dragonfly(c) => c.delete(key).await,
            Self::Loopback(c) => c.delete(key).await,
        }
    }

    /// Delete every key starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the scan or delete fails.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize, DbError> {
        match self {
            Self::Dragonfly(c) => c.delete_prefix(prefix).await,
            Self::Loopback(c) => c.delete_prefix(prefix).await,
        }
    }
}

impl From<DragonflyCache> for NetworkCache {
    fn from(cache: DragonflyCache) -> Self {
        Self::Dragonfly(cache)
    }
}

impl From<LoopbackCache> for NetworkCache {
    fn from(cache: LoopbackCache) -> Self {
        Self::Loopback(cache)
    }
}

#[derive(Debug, Default)]
struct LoopbackState {
    entries: Mutex<HashMap<String, (Vec<u8>, Expiry)>>,
    latency_ms: AtomicU64,
    unavailable: AtomicBool,
}

/// Shared in-process stand-in for a networked cache.
///
/// Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct LoopbackCache {
    state: Arc<LoopbackState>,
}

impl LoopbackCache {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.state.latency_ms.store(ms, Ordering::Relaxed);
    }

    /// Make every operation fail (`false`) or succeed again (`true`).
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::Relaxed);
    }

    /// Number of stored entries, expired or not.
    pub async fn len(&self) -> usize {
        self.state.entries.lock().await.len()
    }

    /// Whether no entries are stored.
    pub async fn is_empty(&self) -> bool {
        self.state.entries.lock().await.is_empty()
    }

    /// Whether `key` is stored and unexpired, bypassing latency and
    /// availability.
    pub async fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.state
            .entries
            .lock()
            .await
            .get(key)
            .is_some_and(|(_, expiry)| !expiry.is_expired(now))
    }

    async fn round_trip(&self) -> Result<(), DbError> {
        let ms = self.state.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if self.state.unavailable.load(Ordering::Relaxed) {
            return Err(DbError::CacheUnavailable("loopback cache is offline".to_owned()));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DbError> {
        self.round_trip().await?;
        let now = Instant::now();
        let mut entries = self.state.entries.lock().await;
        match entries.get(key) {
            Some((payload, expiry)) if !expiry.is_expired(now) => Ok(Some(payload.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, payload: &[u8], ttl: Ttl) -> Result<(), DbError> {
        self.round_trip().await?;
        let expiry = ttl.expiry_from(Instant::now());
        self.state
            .entries
            .lock()
            .await
            .insert(key.to_owned(), (payload.to_vec(), expiry));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), DbError> {
        self.round_trip().await?;
        self.state.entries.lock().await.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, DbError> {
        self.round_trip().await?;
        let mut entries = self.state.entries.lock().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(entries.len()))
    }
}

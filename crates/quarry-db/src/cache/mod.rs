//! Two-tier result cache in front of query execution.
//!
//! # Lookup
//!
//! ```text
//! key --> memory tier --hit--> payload
//!             | miss
//!             v
//!         network tier (bounded by network_timeout) --hit--> back-fill memory --> payload
//!             | miss / error / timeout
//!             v
//!           None (caller executes against the store, then calls populate)
//! ```
//!
//! Population runs on a spawned task so encoding and the network write never
//! add to the caller's latency. Population tasks of one [`CacheTier`] are
//! serialized by a mutex. A reader takes a [`ReadTicket`] before going to
//! the store; invalidation takes the population mutex and records the
//! invalidated key or prefix with a sequence number, and a population whose
//! key was invalidated after its ticket is dropped. Invalidations of other
//! tables leave it alone.
//!
//! Only lookups and populations are bounded by `network_timeout`. Deletes
//! run to completion so a slow networked tier never keeps invalidated keys.
//!
//! # Modules
//!
//! - [`ttl`] -- TTL and expiry
//! - [`key`] -- Cache key derivation
//! - [`memory`] -- In-process tier
//! - [`network`] -- Networked tier dispatch and the loopback backend
//! - [`dragonfly`] -- `Dragonfly` backend

pub mod dragonfly;
pub mod key;
pub mod memory;
pub mod network;
pub mod ttl;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quarry_mapping::{RowSet, Statement};
use tokio::sync::{Mutex, MutexGuard, Notify};

use crate::error::DbError;
use crate::settings::CacheSettings;

pub use dragonfly::DragonflyCache;
pub use memory::MemoryCache;
pub use network::{LoopbackCache, NetworkCache};
pub use ttl::{Expiry, Ttl};

/// Default bound on a single networked-tier operation.
const DEFAULT_NETWORK_TIMEOUT_MS: u64 = 250;

/// Runtime configuration of a [`CacheTier`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whether reads consult and populate the cache at all.
    pub enabled: bool,
    /// TTL applied when populating either tier.
    pub ttl: Ttl,
    /// Key namespace; full resets only touch keys under it.
    pub namespace: String,
    /// Whether the in-process tier is used.
    pub memory: bool,
    /// Bound on each networked-tier operation.
    pub network_timeout: Duration,
    /// Copy networked-tier hits into the in-process tier.
    pub backfill_memory: bool,
    /// Period of the in-process expiry sweeper, if any.
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Ttl::default(),
            namespace: "quarry".to_owned(),
            memory: true,
            network_timeout: Duration::from_millis(DEFAULT_NETWORK_TIMEOUT_MS),
            backfill_memory: true,
            sweep_interval: None,
        }
    }
}

impl CacheConfig {
    /// Set the TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the key namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Enable or disable the in-process tier.
    #[must_use]
    pub const fn with_memory(mut self, memory: bool) -> Self {
        self.memory = memory;
        self
    }

    /// Set the networked-tier timeout.
    #[must_use]
    pub const fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    /// Enable or disable back-filling the in-process tier.
    #[must_use]
    pub const fn with_backfill_memory(mut self, backfill: bool) -> Self {
        self.backfill_memory = backfill;
        self
    }

    /// Run the in-process sweeper every `interval`.
    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }
}

/// Which tier served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// The in-process tier.
    Memory,
    /// The networked tier.
    Network,
}

/// A cached payload and the tier it came from.
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// Encoded [`RowSet`].
    pub payload: Arc<[u8]>,
    /// Tier that served it.
    pub tier: Tier,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served by the in-process tier.
    pub memory_hits: u64,
    /// Lookups served by the networked tier.
    pub network_hits: u64,
    /// Lookups served by neither tier.
    pub misses: u64,
    /// Hits whose payload failed to decode and were re-executed.
    pub decode_fallbacks: u64,
    /// Read statements sent to the store.
    pub store_queries: u64,
    /// Completed background populations.
    pub populations: u64,
    /// Background populations that failed.
    pub population_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    network_hits: AtomicU64,
    misses: AtomicU64,
    decode_fallbacks: AtomicU64,
    store_queries: AtomicU64,
    populations: AtomicU64,
    population_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// State shared with background population tasks.
#[derive(Debug, Default)]
struct Shared {
    population: Mutex<InvalidationLog>,
    sequence: AtomicU64,
    readers: AtomicUsize,
    pending: AtomicUsize,
    idle: Notify,
    counters: Counters,
}

/// Keys and prefixes invalidated while reads were outstanding, with the
/// sequence number of their latest invalidation.
#[derive(Debug, Default)]
struct InvalidationLog {
    entries: HashMap<String, u64>,
}

impl InvalidationLog {
    fn invalidated_since(&self, key: &str, sequence: u64) -> bool {
        self.entries
            .iter()
            .any(|(prefix, &at)| at > sequence && key.starts_with(prefix.as_str()))
    }
}

/// Snapshot of the invalidation sequence taken before a read goes to the
/// store. Passed to [`CacheTier::populate`]; the result is not cached if its
/// key was invalidated after the ticket was taken.
#[derive(Debug)]
pub struct ReadTicket {
    sequence: u64,
    shared: Arc<Shared>,
}

impl Drop for ReadTicket {
    fn drop(&mut self) {
        self.shared.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Decrements the pending count when a population task ends, even by panic.
struct PendingGuard(Arc<Shared>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// The in-process tier plus an optional networked tier.
#[derive(Debug)]
pub struct CacheTier {
    config: CacheConfig,
    memory: Option<Arc<MemoryCache>>,
    network: Option<NetworkCache>,
    shared: Arc<Shared>,
}

impl CacheTier {
    /// Build a cache tier.
    ///
    /// Starts the in-process sweeper when `config.sweep_interval` is set
    /// and a Tokio runtime is available.
    pub fn new(config: CacheConfig, network: Option<NetworkCache>) -> Self {
        let memory = config.memory.then(|| Arc::new(MemoryCache::new()));
        if let (Some(memory), Some(interval)) = (&memory, config.sweep_interval) {
            if tokio::runtime::Handle::try_current().is_ok() {
                MemoryCache::spawn_sweeper(memory, interval);
            } else {
                tracing::warn!("No Tokio runtime; in-process cache sweeper not started");
            }
        }

        tracing::info!(
            enabled = config.enabled,
            ttl = %config.ttl,
            namespace = config.namespace.as_str(),
            memory = config.memory,
            network = network.as_ref().map_or("none", NetworkCache::name),
            "Cache tier configured"
        );

        Self {
            config,
            memory,
            network,
            shared: Arc::new(Shared::default()),
        }
    }

    /// A tier that never stores anything.
    pub fn disabled() -> Self {
        Self::new(
            CacheConfig {
                enabled: false,
                ..CacheConfig::default()
            },
            None,
        )
    }

    /// Build a cache tier from settings, connecting to `Dragonfly` when a
    /// URL is configured.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the `Dragonfly` connection fails.
    pub async fn from_settings(settings: &CacheSettings) -> Result<Self, DbError> {
        let network = match &settings.dragonfly_url {
            Some(url) => Some(NetworkCache::Dragonfly(DragonflyCache::connect(url).await?)),
            None => None,
        };
        Ok(Self::new(settings.to_config(), network))
    }

    /// The configuration.
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether reads should consult this cache.
    pub const fn is_enabled(&self) -> bool {
        self.config.enabled && (self.memory.is_some() || self.network.is_some())
    }

    /// The in-process tier, if enabled.
    pub fn memory(&self) -> Option<&MemoryCache> {
        self.memory.as_deref()
    }

    /// The networked tier, if configured.
    pub const fn network(&self) -> Option<&NetworkCache> {
        self.network.as_ref()
    }

    /// Key of the cached result of `stmt` against `table`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if the arguments cannot be encoded.
    pub fn key_for(&self, table: &str, stmt: &Statement) -> Result<String, DbError> {
        key::cache_key(&self.config.namespace, table, stmt)
    }

    /// Prefix shared by every key of `table`.
    pub fn table_prefix(&self, table: &str) -> String {
        key::table_prefix(&self.config.namespace, table)
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let c = &self.shared.counters;
        CacheStats {
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            network_hits: c.network_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            decode_fallbacks: c.decode_fallbacks.load(Ordering::Relaxed),
            store_queries: c.store_queries.load(Ordering::Relaxed),
            populations: c.populations.load(Ordering::Relaxed),
            population_failures: c.population_failures.load(Ordering::Relaxed),
        }
    }

    /// Take a ticket for a read about to go to the store.
    pub fn ticket(&self) -> ReadTicket {
        self.shared.readers.fetch_add(1, Ordering::SeqCst);
        ReadTicket {
            sequence: self.shared.sequence.load(Ordering::SeqCst),
            shared: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn record_store_query(&self) {
        bump(&self.shared.counters.store_queries);
    }

    /// Look `key` up in the in-process tier, then the networked tier.
    ///
    /// Networked-tier errors and timeouts are logged and count as misses.
    pub async fn lookup(&self, key: &str) -> Option<CacheHit> {
        if !self.is_enabled() {
            return None;
        }
        let counters = &self.shared.counters;

        if let Some(memory) = &self.memory {
            if let Some(payload) = memory.get(key).await {
                bump(&counters.memory_hits);
                tracing::debug!(key, "Cache hit (memory)");
                return Some(CacheHit {
                    payload,
                    tier: Tier::Memory,
                });
            }
        }

        if let Some(network) = &self.network {
            match self.bounded(network.get(key)).await {
                Ok(Some(bytes)) => {
                    bump(&counters.network_hits);
                    tracing::debug!(key, backend = network.name(), "Cache hit (network)");
                    let payload: Arc<[u8]> = Arc::from(bytes);
                    if self.config.backfill_memory && !self.config.ttl.is_zero() {
                        if let Some(memory) = &self.memory {
                            memory.set(key, Arc::clone(&payload), self.config.ttl).await;
                        }
                    }
                    return Some(CacheHit {
                        payload,
                        tier: Tier::Network,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key, backend = network.name(), error = %e, "Network cache lookup failed, treating as miss");
                }
            }
        }

        bump(&counters.misses);
        None
    }

    /// Schedule population of both tiers with `rows` under `key`.
    ///
    /// `ticket` must have been taken before `rows` were read. Returns
    /// immediately; encoding and writes happen on a spawned task. Failures
    /// are logged and counted, never returned.
    pub fn populate(&self, key: String, rows: RowSet, ticket: ReadTicket) {
        if !self.is_enabled() {
            return;
        }
        if self.config.ttl.is_zero() {
            tracing::debug!(key, "Zero TTL, skipping cache population");
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key, "No Tokio runtime, skipping cache population");
            return;
        };

        let job = Population {
            key,
            rows,
            ttl: self.config.ttl,
            ticket,
            timeout: self.config.network_timeout,
            memory: self.memory.clone(),
            network: self.network.clone(),
        };
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let guard = PendingGuard(Arc::clone(&self.shared));
        runtime.spawn(async move {
            job.run(&guard.0).await;
            drop(guard);
        });
    }

    /// Remove a payload that failed to decode from both tiers.
    pub async fn discard(&self, key: &str) {
        bump(&self.shared.counters.decode_fallbacks);
        if let Err(e) = self.invalidate_key(key).await {
            tracing::warn!(key, error = %e, "Failed to discard undecodable cache entry");
        }
    }

    /// Delete `key` from both tiers.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the networked tier fails; the in-process tier
    /// is cleared regardless.
    pub async fn invalidate_key(&self, key: &str) -> Result<(), DbError> {
        let _population = self.record_invalidation(key).await;
        if let Some(memory) = &self.memory {
            memory.remove(key).await;
        }
        if let Some(network) = &self.network {
            network.delete(key).await?;
        }
        tracing::debug!(key, "Invalidated cache key");
        Ok(())
    }

    /// Delete every key starting with `prefix` from both tiers. Returns
    /// how many in-process entries were removed plus how many networked
    /// keys were deleted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the networked tier fails; the in-process tier
    /// is cleared regardless.
    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<usize, DbError> {
        let _population = self.record_invalidation(prefix).await;
        let mut removed = 0_usize;
        if let Some(memory) = &self.memory {
            removed = removed.saturating_add(memory.remove_prefix(prefix).await);
        }
        if let Some(network) = &self.network {
            removed = removed.saturating_add(network.delete_prefix(prefix).await?);
        }
        tracing::debug!(prefix, removed, "Invalidated cache prefix");
        Ok(removed)
    }

    /// Clear the in-process tier wholesale and delete every networked key
    /// under the namespace.
    ///
    /// Without a namespace the networked tier is left alone: an unscoped
    /// flush would hit data this cache does not own.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the networked tier fails.
    pub async fn reset(&self) -> Result<(), DbError> {
        let _population = self.record_invalidation("").await;
        if let Some(memory) = &self.memory {
            let cleared = memory.reset().await;
            tracing::info!(cleared, "In-process cache reset");
        }
        if let Some(network) = &self.network {
            if self.config.namespace.is_empty() {
                tracing::warn!("Cache namespace is empty; network cache reset skipped");
            } else {
                let prefix = key::namespace_prefix(&self.config.namespace);
                let deleted = network.delete_prefix(&prefix).await?;
                tracing::info!(deleted, namespace = self.config.namespace.as_str(), "Network cache reset");
            }
        }
        Ok(())
    }

    /// Wait until every scheduled population has finished.
    pub async fn settle(&self) {
        loop {
            let idle = self.shared.idle.notified();
            if self.shared.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Lock out populations and log `prefix` as invalidated. The log is
    /// cleared first when no read is outstanding.
    async fn record_invalidation(&self, prefix: &str) -> MutexGuard<'_, InvalidationLog> {
        let mut log = self.shared.population.lock().await;
        let sequence = self.shared.sequence.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if self.shared.readers.load(Ordering::SeqCst) == 0 {
            log.entries.clear();
        }
        log.entries.insert(prefix.to_owned(), sequence);
        log
    }

    async fn bounded<T>(&self, op: impl Future<Output = Result<T, DbError>>) -> Result<T, DbError> {
        with_timeout(self.config.network_timeout, op).await
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    op: impl Future<Output = Result<T, DbError>>,
) -> Result<T, DbError> {
    tokio::time::timeout(timeout, op).await.map_err(|elapsed| {
        DbError::CacheUnavailable(format!("network cache did not answer within {timeout:?} ({elapsed})"))
    })?
}

struct Population {
    key: String,
    rows: RowSet,
    ttl: Ttl,
    ticket: ReadTicket,
    timeout: Duration,
    memory: Option<Arc<MemoryCache>>,
    network: Option<NetworkCache>,
}

impl Population {
    async fn run(self, shared: &Shared) {
        let log = shared.population.lock().await;
        if log.invalidated_since(&self.key, self.ticket.sequence) {
            tracing::debug!(key = self.key.as_str(), "Cache invalidated since the read, population dropped");
            return;
        }
        self.write(shared, log).await;
    }

    /// Encode and store the rows; `_population` is held until both tiers
    /// are written.
    async fn write(self, shared: &Shared, _population: MutexGuard<'_, InvalidationLog>) {
        let payload: Arc<[u8]> = match self.rows.to_bytes() {
            Ok(bytes) => Arc::from(bytes),
            Err(e) => {
                bump(&shared.counters.population_failures);
                tracing::warn!(key = self.key.as_str(), error = %e, "Failed to encode cache payload");
                return;
            }
        };

        if let Some(memory) = &self.memory {
            memory.set(&self.key, Arc::clone(&payload), self.ttl).await;
        }
        if let Some(network) = &self.network {
            if let Err(e) = with_timeout(self.timeout, network.set(&self.key, &payload, self.ttl)).await {
                bump(&shared.counters.population_failures);
                tracing::warn!(
                    key = self.key.as_str(),
                    backend = network.name(),
                    error = %e,
                    "Failed to populate network cache"
                );
                return;
            }
        }

        bump(&shared.counters.populations);
        tracing::debug!(key = self.key.as_str(), rows = self.rows.len(), "Populated cache");
    }
}

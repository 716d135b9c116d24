//! Store and cache handle.
//!
//! A [`Database`] owns the connection pool, the shared [`CacheTier`], and
//! the [`TypeRegistry`] consulted for dynamically typed fields. Typed
//! handles come from [`Database::orm`].

use std::sync::Arc;

use quarry_mapping::{Record, Schema, TypeRegistry};
use sqlx::AnyPool;

use crate::cache::{CacheTier, NetworkCache};
use crate::error::DbError;
use crate::orm::Orm;
use crate::settings::{CacheSettings, Settings, StoreConfig};
use crate::store;

/// Connection pool, cache, and type registry shared by every [`Orm`].
#[derive(Debug, Clone)]
pub struct Database {
    pool: AnyPool,
    cache: Arc<CacheTier>,
    registry: Arc<TypeRegistry>,
    invalidate_on_write: bool,
}

impl Database {
    /// Connect to the store and, when configured, the networked cache tier.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if either connection fails.
    pub async fn connect(settings: &Settings) -> Result<Self, DbError> {
        let pool = store::connect(&settings.database.to_store_config()?).await?;
        let cache = CacheTier::from_settings(&settings.cache).await?;
        Ok(Self::from_parts(pool, cache).with_invalidate_on_write(settings.cache.invalidate_on_write))
    }

    /// Connect to the store at `url` with default pool settings and an
    /// in-process cache only.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection fails.
    pub async fn connect_url(url: &str) -> Result<Self, DbError> {
        let pool = store::connect(&StoreConfig::for_url(url)?).await?;
        let cache = CacheTier::new(CacheSettings::default().to_config(), None);
        Ok(Self::from_parts(pool, cache))
    }

    /// Assemble from an existing pool and cache tier.
    pub fn from_parts(pool: AnyPool, cache: CacheTier) -> Self {
        Self {
            pool,
            cache: Arc::new(cache),
            registry: Arc::new(TypeRegistry::new()),
            invalidate_on_write: false,
        }
    }

    /// Assemble from a pool with a cache built from `settings` and the given
    /// networked tier.
    pub fn with_network_cache(pool: AnyPool, settings: &CacheSettings, network: NetworkCache) -> Self {
        Self::from_parts(pool, CacheTier::new(settings.to_config(), Some(network)))
            .with_invalidate_on_write(settings.invalidate_on_write)
    }

    /// Use `registry` for schemas loaded from now on.
    #[must_use]
    pub fn with_registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Invalidate a table's cached results after every successful write.
    #[must_use]
    pub const fn with_invalidate_on_write(mut self, enabled: bool) -> Self {
        self.invalidate_on_write = enabled;
        self
    }

    /// Load `T`'s schema and return a typed handle.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Mapping`] if `T`'s metadata is malformed.
    pub fn orm<T: Record>(&self) -> Result<Orm<T>, DbError> {
        let schema = Schema::load::<T>(Arc::clone(&self.registry))?;
        tracing::debug!(
            record = schema.record_name(),
            fields = schema.fields().len(),
            "Schema loaded"
        );
        Ok(Orm::new(
            Arc::new(schema),
            Arc::clone(&self.cache),
            self.pool.clone(),
            self.invalidate_on_write,
        ))
    }

    /// The connection pool.
    pub const fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// The shared cache tier.
    pub const fn cache(&self) -> &Arc<CacheTier> {
        &self.cache
    }

    /// The type registry.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Wait for pending cache population, then close the pool and the
    /// `Dragonfly` connection.
    pub async fn close(&self) {
        self.cache.settle().await;
        self.pool.close().await;
        if let Some(NetworkCache::Dragonfly(dragonfly)) = self.cache.network() {
            if let Err(e) = dragonfly.quit().await {
                tracing::warn!(error = %e, "Failed to close Dragonfly connection");
            }
        }
        tracing::info!("Database closed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use quarry_mapping::{MappingError, RecordMeta};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::cache::LoopbackCache;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Widget {
        id: i64,
    }

    impl Record for Widget {
        fn meta() -> RecordMeta {
            RecordMeta::new("widgets").primary_key("id")
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Broken {
        id: i64,
    }

    impl Record for Broken {
        fn meta() -> RecordMeta {
            RecordMeta::new("broken").primary_key("missing")
        }
    }

    #[tokio::test]
    async fn connect_from_settings() {
        let settings = Settings::parse("cache:\n  namespace: test\n  invalidate_on_write: true\n").unwrap();
        let db = Database::connect(&settings).await.unwrap();
        assert_eq!(db.cache().config().namespace, "test");
        assert!(db.cache().network().is_none());
        let orm = db.orm::<Widget>().unwrap();
        assert!(orm.invalidates_on_write());
        db.close().await;
    }

    #[tokio::test]
    async fn malformed_metadata_fails_before_io() {
        let db = Database::connect_url("sqlite::memory:").await.unwrap();
        assert!(matches!(db.orm::<Broken>(), Err(DbError::Mapping(MappingError::Config(_)))));
    }

    #[tokio::test]
    async fn loopback_network_tier() {
        let pool = store::connect(&StoreConfig::for_url("sqlite::memory:").unwrap()).await.unwrap();
        let db = Database::with_network_cache(pool, &CacheSettings::default(), LoopbackCache::new().into());
        assert_eq!(db.cache().network().map(NetworkCache::name), Some("loopback"));
        assert!(db.registry().is_empty());
    }
}

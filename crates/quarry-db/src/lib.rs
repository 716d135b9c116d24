//! Data layer for Quarry: typed ORM handles over `PostgreSQL` or `SQLite`
//! with a two-tier result cache.
//!
//! The in-process tier answers repeat reads without leaving the process.
//! The optional networked tier (`Dragonfly`) shares results between
//! processes. Mutations always go to the store; cached results expire by
//! TTL or are invalidated explicitly.
//!
//! # Architecture
//!
//! ```text
//! Database (pool + CacheTier + TypeRegistry)
//!     |
//!     +-- orm::<T>() --> Orm<T>
//!                          |
//!                          +-- reads ------> CacheTier --miss--> store --> materialize
//!                          |                     |
//!                          |                     +-- memory (MemoryCache)
//!                          |                     +-- network (Dragonfly | Loopback)
//!                          |
//!                          +-- mutations --> store
//!                          +-- begin() ----> OrmTransaction<T> (cache bypassed)
//! ```
//!
//! # Modules
//!
//! - [`database`] -- Pool, cache, and registry ownership
//! - [`orm`] -- Typed reads, mutations, and cache control
//! - [`transaction`] -- Transaction-bound handles
//! - [`cache`] -- In-process and networked cache tiers
//! - [`settings`] -- YAML settings and pool configuration
//! - [`store`] -- Connection and statement execution
//! - [`error`] -- Shared error types

pub mod cache;
pub mod database;
pub mod error;
pub mod orm;
pub mod settings;
pub mod store;
pub mod transaction;

// Re-export primary types for convenience.
pub use cache::{
    CacheConfig, CacheHit, CacheStats, CacheTier, DragonflyCache, LoopbackCache, MemoryCache, NetworkCache, ReadTicket,
    Tier, Ttl,
};
pub use database::Database;
pub use error::DbError;
pub use orm::{Orm, Origin, QueryResult};
pub use settings::{Backend, CacheSettings, DatabaseSettings, Settings, StoreConfig};
pub use transaction::OrmTransaction;

pub use quarry_mapping;

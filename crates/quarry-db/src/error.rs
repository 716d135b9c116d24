//! Error types for the data layer.
//!
//! All errors are propagated via [`DbError`], which wraps mapping errors
//! from `quarry-mapping` and the underlying [`sqlx`] and [`fred`] errors.

use quarry_mapping::MappingError;

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Schema, statement building, or materialization failed.
    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// A store operation failed.
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// A `Dragonfly`/Redis operation failed.
    #[error("Dragonfly error: {0}")]
    Dragonfly(#[from] fred::error::Error),

    /// A serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The transaction was already committed or rolled back.
    #[error("transaction already closed")]
    TransactionClosed,

    /// The networked cache tier is unreachable or refused the operation.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to read a settings file.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse settings YAML.
    #[error("failed to parse settings YAML: {0}")]
    Yaml(#[from] serde_yml::Error),
}

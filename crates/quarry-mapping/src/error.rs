//! Error types for the mapping engine.
//!
//! [`MappingError`] covers everything that can go wrong before a statement
//! reaches a connection: malformed record metadata, unresolvable field
//! names, disallowed operators, and values that cannot be encoded into or
//! decoded out of a row.

/// Errors raised while loading schemas, building statements, or
/// materializing rows.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    /// Record metadata is malformed (not a struct, unknown annotated field,
    /// duplicate primary key, duplicate column).
    #[error("configuration error: {0}")]
    Config(String),

    /// A table-dependent operation was attempted on a record without a
    /// table name.
    #[error("record `{record}` has no table name; set one with `RecordMeta::new`")]
    MissingTable {
        /// Type name of the record.
        record: String,
    },

    /// A primary-key-dependent operation was attempted on a record without
    /// a primary key.
    #[error("record `{record}` has no primary key; mark one with `RecordMeta::primary_key`")]
    MissingPrimaryKey {
        /// Type name of the record.
        record: String,
    },

    /// A field name could not be resolved against the schema.
    #[error("unknown field `{field}` on `{record}`")]
    UnknownField {
        /// Type or table name the lookup ran against.
        record: String,
        /// The field name as supplied by the caller.
        field: String,
    },

    /// An operator outside the allowed set was supplied.
    #[error("operator `{0}` is not allowed")]
    InvalidOperator(String),

    /// An IN condition had no values after flattening.
    #[error("IN condition on `{0}` has no values")]
    EmptyInList(String),

    /// A value could not be turned into a statement parameter.
    #[error("encode error: {0}")]
    Encode(String),

    /// A row or payload could not be turned into the target type.
    #[error("decode error: {0}")]
    Decode(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

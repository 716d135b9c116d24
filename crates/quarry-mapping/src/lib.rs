//! Record-to-table mapping engine for Quarry.
//!
//! This crate is pure: it never opens a connection. It turns record types
//! into table schemas, builds parameterized statements, and converts result
//! rows back into records. The `quarry-db` crate runs those statements and
//! caches their results.
//!
//! # Flow
//!
//! ```text
//! Record type --Schema::load--> Schema
//!     |
//!     +-- Select / Delete ----------> Statement --> store
//!     +-- insert / update builders -> Statement --> store
//!                                                      |
//! Vec<Record> <--materialize-- RowSet <----------------+
//! ```
//!
//! # Modules
//!
//! - [`record`] -- The `Record` trait and its mapping annotations
//! - [`schema`] -- Field-to-column correspondence for one record type
//! - [`registry`] -- Decode targets for dynamically typed fields
//! - [`value`] -- SQL values, result rows, and statements
//! - [`materialize`] -- Result rows to records, field by field
//! - [`mutation`] -- INSERT and UPDATE generation
//! - [`query`] -- SELECT and DELETE builders
//! - [`error`] -- Mapping error type

pub mod error;
pub mod materialize;
pub mod mutation;
pub mod query;
pub mod record;
pub mod registry;
pub mod schema;
pub mod value;

// Re-export primary types for convenience.
pub use error::MappingError;
pub use materialize::{materialize, materialize_as, materialize_first, split_joined};
pub use mutation::{field_values, insert_statement, primary_key_value, update_by_primary_key, update_statement};
pub use query::{Aggregate, Delete, JoinKind, Operator, Order, Select};
pub use record::{Record, RecordMeta};
pub use registry::TypeRegistry;
pub use schema::{FieldDescriptor, Schema, Storage, Target};
pub use value::{ColumnKind, RowSet, SqlType, SqlValue, Statement, quote_ident};

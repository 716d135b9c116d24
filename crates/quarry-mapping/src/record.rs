//! Record registration.
//!
//! A record is a plain serde struct plus a [`RecordMeta`] describing how it
//! maps onto a table. The field list itself is discovered from the record's
//! serialization keys (see [`crate::Schema::load`]); the metadata only
//! carries what serde cannot express: table name, primary key, excluded
//! fields, serialized storage, and column overrides.
//!
//! ```
//! use quarry_mapping::{Record, RecordMeta};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct User {
//!     id: String,
//!     name: String,
//!     tags: Vec<String>,
//! }
//!
//! impl Record for User {
//!     fn meta() -> RecordMeta {
//!         RecordMeta::new("users").primary_key("id").serialized("tags")
//!     }
//! }
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::value::ColumnKind;

/// A struct that can be mapped onto a table row.
///
/// `Default` supplies the zero-valued instance the schema loader inspects
/// and the materializer starts every row from.
pub trait Record: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    /// Mapping annotations for this record type.
    fn meta() -> RecordMeta;
}

/// Per-record mapping annotations.
///
/// All field names refer to serialization keys (after any `serde(rename)`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordMeta {
    pub(crate) table: String,
    pub(crate) primary_keys: Vec<String>,
    pub(crate) excluded: Vec<String>,
    pub(crate) serialized: Vec<String>,
    pub(crate) dynamic: Vec<String>,
    pub(crate) columns: Vec<(String, String)>,
    pub(crate) kinds: Vec<(String, ColumnKind)>,
}

impl RecordMeta {
    /// Annotations for a record stored in `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Mark `field` as the primary key.
    #[must_use]
    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_keys.push(field.into());
        self
    }

    /// Never map `field` to a column.
    #[must_use]
    pub fn exclude(mut self, field: impl Into<String>) -> Self {
        self.excluded.push(field.into());
        self
    }

    /// Store `field` as an encoded JSON document.
    #[must_use]
    pub fn serialized(mut self, field: impl Into<String>) -> Self {
        self.serialized.push(field.into());
        self
    }

    /// Store `field` as an encoded JSON document whose concrete type is
    /// resolved through the [`crate::TypeRegistry`] when decoding.
    #[must_use]
    pub fn dynamic(mut self, field: impl Into<String>) -> Self {
        self.dynamic.push(field.into());
        self
    }

    /// Map `field` to an explicitly named column.
    #[must_use]
    pub fn column(mut self, field: impl Into<String>, column: impl Into<String>) -> Self {
        self.columns.push((field.into(), column.into()));
        self
    }

    /// Declare the storage kind of `field`.
    ///
    /// Needed for `Option` fields, whose zero value (`None`) says nothing
    /// about the column type.
    #[must_use]
    pub fn kind(mut self, field: impl Into<String>, kind: ColumnKind) -> Self {
        self.kinds.push((field.into(), kind));
        self
    }

    /// The table name, empty when none was set.
    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Every field name referenced by an annotation.
    pub(crate) fn referenced_fields(&self) -> impl Iterator<Item = &str> {
        self.primary_keys
            .iter()
            .chain(&self.excluded)
            .chain(&self.serialized)
            .chain(&self.dynamic)
            .map(String::as_str)
            .chain(self.columns.iter().map(|(f, _)| f.as_str()))
            .chain(self.kinds.iter().map(|(f, _)| f.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_annotations() {
        let meta = RecordMeta::new("users")
            .primary_key("id")
            .serialized("tags")
            .exclude("scratch")
            .column("display", "display_name")
            .kind("age", ColumnKind::Integer);
        assert_eq!(meta.table_name(), "users");
        let fields: Vec<&str> = meta.referenced_fields().collect();
        assert_eq!(fields, vec!["id", "scratch", "tags", "display", "age"]);
    }

    #[test]
    fn default_meta_has_no_table() {
        assert_eq!(RecordMeta::default().table_name(), "");
    }
}

//! Schema loading: record type to table/column correspondence.
//!
//! [`Schema::load`] inspects the zero-valued instance of a [`Record`] by
//! serializing it. The serialization keys, in declaration order, are the
//! record's fields; the zero value of each key tells the materializer what
//! shape to convert column values into. Annotations from [`RecordMeta`]
//! then exclude fields, pick the primary key, and set storage modes.
//!
//! A schema is built once per record type and is immutable afterwards.

use std::any::type_name;
use std::collections::HashSet;
use std::sync::Arc;

use convert_case::{Case, Casing};

use crate::error::MappingError;
use crate::record::{Record, RecordMeta};
use crate::registry::TypeRegistry;
use crate::value::ColumnKind;

/// How a field's value is stored in its column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Stored as a native column value (composites still encode as JSON).
    Plain,
    /// Stored as an encoded JSON document.
    Serialized,
    /// Stored as an encoded JSON document, decoded through the registry.
    Dynamic,
}

/// What a column value is converted into when materializing a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// A boolean.
    Bool,
    /// An integer.
    Integer,
    /// A float.
    Float,
    /// A string.
    Text,
    /// A JSON array (list field).
    List,
    /// A JSON object (map or nested record field).
    Map,
    /// Any JSON document.
    Json,
    /// Whatever the column naturally holds (nullable fields with no kind).
    Natural,
}

/// A single mapped field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    /// Serialization key of the field.
    pub name: String,
    /// Column the field maps to.
    pub column: String,
    /// Storage mode.
    pub storage: Storage,
    /// Conversion target used when materializing.
    pub target: Target,
    /// Kind used to type `NULL` parameters.
    pub kind: ColumnKind,
    /// Whether this is the primary key.
    pub primary: bool,
}

/// Table name and field-to-column mapping for one record type.
#[derive(Debug, Clone)]
pub struct Schema {
    record: &'static str,
    table: String,
    fields: Vec<FieldDescriptor>,
    primary: Option<usize>,
    zero: serde_json::Map<String, serde_json::Value>,
    registry: Arc<TypeRegistry>,
}

impl Schema {
    /// Load the schema of `T`.
    ///
    /// No connection is opened. A record without a table name loads
    /// successfully; table-dependent operations fail later with
    /// [`MappingError::MissingTable`].
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Config`] if `T::default()` does not serialize
    /// to a struct, if an annotation names an unknown field, if more than one
    /// primary key is marked, if the primary key is excluded, if two fields
    /// map to the same column, or if the table name contains `:` (the cache
    /// key separator).
    pub fn load<T: Record>(registry: Arc<TypeRegistry>) -> Result<Self, MappingError> {
        let record = type_name::<T>();
        let serde_json::Value::Object(zero) = serde_json::to_value(T::default())? else {
            return Err(MappingError::Config(format!(
                "record `{record}` must serialize to a struct with named fields"
            )));
        };
        let meta = T::meta();
        validate_meta(record, &meta, &zero)?;

        let mut fields = Vec::with_capacity(zero.len());
        let mut primary = None;
        let mut seen_columns = HashSet::new();

        for (name, zero_value) in &zero {
            if meta.excluded.iter().any(|f| f == name) {
                continue;
            }
            let column = meta
                .columns
                .iter()
                .find(|(f, _)| f == name)
                .map_or_else(|| name.clone(), |(_, c)| c.clone());
            if !seen_columns.insert(column.clone()) {
                return Err(MappingError::Config(format!(
                    "record `{record}` maps more than one field to column `{column}`"
                )));
            }

            let storage = if meta.dynamic.iter().any(|f| f == name) {
                Storage::Dynamic
            } else if meta.serialized.iter().any(|f| f == name) {
                Storage::Serialized
            } else {
                Storage::Plain
            };
            let declared = meta.kinds.iter().find(|(f, _)| f == name).map(|(_, k)| *k);
            let (target, inferred) = infer_target(zero_value, declared);
            let kind = match storage {
                Storage::Plain => declared.unwrap_or(inferred),
                Storage::Serialized | Storage::Dynamic => ColumnKind::Json,
            };
            let is_primary = meta.primary_keys.iter().any(|f| f == name);
            if is_primary {
                primary = Some(fields.len());
            }

            fields.push(FieldDescriptor {
                name: name.clone(),
                column,
                storage,
                target,
                kind,
                primary: is_primary,
            });
        }

        tracing::debug!(
            record,
            table = meta.table.as_str(),
            fields = fields.len(),
            "Loaded record schema"
        );

        Ok(Self {
            record,
            table: meta.table,
            fields,
            primary,
            zero,
            registry,
        })
    }

    /// Type name of the record this schema describes.
    pub const fn record_name(&self) -> &'static str {
        self.record
    }

    /// The table name.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::MissingTable`] if the record has no table.
    pub fn table(&self) -> Result<&str, MappingError> {
        if self.table.is_empty() {
            return Err(MappingError::MissingTable {
                record: self.record.to_owned(),
            });
        }
        Ok(&self.table)
    }

    /// Mapped fields in declaration order.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// The primary key field.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::MissingPrimaryKey`] if none was marked.
    pub fn primary_key(&self) -> Result<&FieldDescriptor, MappingError> {
        self.primary
            .and_then(|i| self.fields.get(i))
            .ok_or_else(|| MappingError::MissingPrimaryKey {
                record: self.record.to_owned(),
            })
    }

    /// Resolve a caller-supplied field name.
    ///
    /// Accepts the serialization key, the column name, or a case variant of
    /// either (`UserName` resolves `user_name`).
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::UnknownField`] if nothing matches.
    pub fn field(&self, name: &str) -> Result<&FieldDescriptor, MappingError> {
        self.position(name)
            .and_then(|i| self.fields.get(i))
            .ok_or_else(|| MappingError::UnknownField {
                record: self.display_name().to_owned(),
                field: name.to_owned(),
            })
    }

    /// Match a result column to a field index.
    ///
    /// Tries the exact column name first, then case-converted equivalents.
    pub fn match_column(&self, column: &str) -> Option<usize> {
        self.position(column)
    }

    fn position(&self, name: &str) -> Option<usize> {
        if let Some(i) = self.fields.iter().position(|f| f.column == name) {
            return Some(i);
        }
        if let Some(i) = self.fields.iter().position(|f| f.name == name) {
            return Some(i);
        }
        let snake = name.to_case(Case::Snake);
        if let Some(i) = self
            .fields
            .iter()
            .position(|f| f.column == snake || f.name == snake || f.name.to_case(Case::Snake) == snake)
        {
            return Some(i);
        }
        self.fields
            .iter()
            .position(|f| f.column.eq_ignore_ascii_case(name) || f.name.eq_ignore_ascii_case(name))
    }

    /// Column names in declaration order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.column.as_str())
    }

    /// The serialized zero-valued record, including excluded fields.
    pub const fn zero_object(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.zero
    }

    /// The zero value of a mapped field.
    pub fn zero_value(&self, field: &FieldDescriptor) -> serde_json::Value {
        self.zero
            .get(&field.name)
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }

    /// Registry used to decode dynamic fields.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    fn display_name(&self) -> &str {
        if self.table.is_empty() { self.record } else { &self.table }
    }
}

fn validate_meta(
    record: &str,
    meta: &RecordMeta,
    zero: &serde_json::Map<String, serde_json::Value>,
) -> Result<(), MappingError> {
    if let Some(unknown) = meta.referenced_fields().find(|f| !zero.contains_key(*f)) {
        return Err(MappingError::Config(format!(
            "record `{record}` annotates unknown field `{unknown}`"
        )));
    }
    if meta.table.contains(':') {
        return Err(MappingError::Config(format!(
            "record `{record}` table `{}` contains `:`, which separates cache key segments",
            meta.table
        )));
    }
    if meta.primary_keys.len() > 1 {
        return Err(MappingError::Config(format!(
            "record `{record}` marks more than one primary key: {}",
            meta.primary_keys.join(", ")
        )));
    }
    if let Some(pk) = meta.primary_keys.first() {
        if meta.excluded.contains(pk) {
            return Err(MappingError::Config(format!(
                "record `{record}` excludes its primary key `{pk}`"
            )));
        }
    }
    Ok(())
}

fn infer_target(zero: &serde_json::Value, declared: Option<ColumnKind>) -> (Target, ColumnKind) {
    match zero {
        serde_json::Value::Bool(_) => (Target::Bool, ColumnKind::Bool),
        serde_json::Value::Number(n) if n.is_f64() => (Target::Float, ColumnKind::Float),
        serde_json::Value::Number(_) => (Target::Integer, ColumnKind::Integer),
        serde_json::Value::String(_) => (Target::Text, ColumnKind::Text),
        serde_json::Value::Array(_) => (Target::List, ColumnKind::Json),
        serde_json::Value::Object(_) => (Target::Map, ColumnKind::Json),
        serde_json::Value::Null => match declared {
            Some(ColumnKind::Bool) => (Target::Bool, ColumnKind::Bool),
            Some(ColumnKind::Integer) => (Target::Integer, ColumnKind::Integer),
            Some(ColumnKind::Float) => (Target::Float, ColumnKind::Float),
            Some(ColumnKind::Text) => (Target::Text, ColumnKind::Text),
            Some(ColumnKind::Json) => (Target::Json, ColumnKind::Json),
            Some(ColumnKind::Bytes) | None => (Target::Natural, declared.unwrap_or_default()),
        },
    }
}

//! INSERT and UPDATE statement generation from populated records.
//!
//! Fields are walked in declaration order. Excluded fields never appear;
//! `None` fields bind as typed `NULL`; lists, maps, nested records, and
//! fields marked serialized or dynamic are JSON-encoded into a single text
//! parameter. Placeholders are numbered as arguments are bound, so the SQL
//! text and the argument list can never disagree on order.

use crate::error::MappingError;
use crate::record::Record;
use crate::schema::{FieldDescriptor, Schema, Storage};
use crate::value::{SqlBuf, SqlValue, Statement};

/// Build an `INSERT` for `record`.
///
/// A record with no mapped fields inserts `DEFAULT VALUES`.
///
/// # Errors
///
/// Returns [`MappingError::MissingTable`] if the record has no table, or
/// [`MappingError::Encode`] if a field value cannot be bound.
pub fn insert_statement<T: Record>(schema: &Schema, record: &T) -> Result<Statement, MappingError> {
    let table = schema.table()?;
    let values = field_values(schema, record)?;

    let mut buf = SqlBuf::new("INSERT INTO ");
    buf.push_ident(table);
    if values.is_empty() {
        buf.push(" DEFAULT VALUES");
        return Ok(buf.finish());
    }

    buf.push(" (");
    for (i, (field, _)) in values.iter().enumerate() {
        if i > 0 {
            buf.push(", ");
        }
        buf.push_ident(&field.column);
    }
    buf.push(") VALUES (");
    for (i, (_, value)) in values.into_iter().enumerate() {
        if i > 0 {
            buf.push(", ");
        }
        buf.bind(value)?;
    }
    buf.push(")");
    Ok(buf.finish())
}

/// Build an `UPDATE` setting every field of `record` except the condition
/// field, for rows where `condition_field` equals `condition_value`.
///
/// A `NULL` condition value matches with `IS NULL`.
///
/// # Errors
///
/// Returns [`MappingError::UnknownField`] if the condition field does not
/// resolve, [`MappingError::Encode`] if there is nothing to set or a value
/// cannot be bound, and [`MappingError::MissingTable`] without a table.
pub fn update_statement<T: Record>(
    schema: &Schema,
    record: &T,
    condition_field: &str,
    condition_value: SqlValue,
) -> Result<Statement, MappingError> {
    let table = schema.table()?;
    let condition = schema.field(condition_field)?;
    let values: Vec<_> = field_values(schema, record)?
        .into_iter()
        .filter(|(field, _)| field.name != condition.name)
        .collect();
    if values.is_empty() {
        return Err(MappingError::Encode(format!(
            "update of `{}` has no columns to set",
            schema.record_name()
        )));
    }

    let mut buf = SqlBuf::new("UPDATE ");
    buf.push_ident(table);
    buf.push(" SET ");
    for (i, (field, value)) in values.into_iter().enumerate() {
        if i > 0 {
            buf.push(", ");
        }
        buf.push_ident(&field.column);
        buf.push(" = ");
        buf.bind(value)?;
    }
    buf.push(" WHERE ");
    buf.push_ident(&condition.column);
    if condition_value.is_null() {
        buf.push(" IS NULL");
    } else {
        buf.push(" = ");
        buf.bind(condition_value)?;
    }
    Ok(buf.finish())
}

/// Build an `UPDATE` keyed by the record's own primary key value.
///
/// # Errors
///
/// Returns [`MappingError::MissingPrimaryKey`] without a primary key, plus
/// everything [`update_statement`] returns.
pub fn update_by_primary_key<T: Record>(schema: &Schema, record: &T) -> Result<Statement, MappingError> {
    let pk = schema.primary_key()?;
    let key = primary_key_value(schema, record)?;
    update_statement(schema, record, &pk.name, key)
}

/// The primary key value of `record`.
///
/// # Errors
///
/// Returns [`MappingError::MissingPrimaryKey`] without a primary key.
pub fn primary_key_value<T: Record>(schema: &Schema, record: &T) -> Result<SqlValue, MappingError> {
    let pk = schema.primary_key()?;
    field_values(schema, record)?
        .into_iter()
        .find(|(field, _)| field.name == pk.name)
        .map(|(_, value)| value)
        .ok_or_else(|| MappingError::MissingPrimaryKey {
            record: schema.record_name().to_owned(),
        })
}

/// Every mapped field of `record` paired with its bind value, in
/// declaration order.
///
/// # Errors
///
/// Returns [`MappingError::Encode`] if the record does not serialize to a
/// struct or a value cannot be bound.
pub fn field_values<'s, T: Record>(
    schema: &'s Schema,
    record: &T,
) -> Result<Vec<(&'s FieldDescriptor, SqlValue)>, MappingError> {
    let serde_json::Value::Object(mut object) = serde_json::to_value(record)? else {
        return Err(MappingError::Encode(format!(
            "record `{}` did not serialize to a struct",
            schema.record_name()
        )));
    };

    schema
        .fields()
        .iter()
        .map(|field| {
            let value = object.remove(&field.name).unwrap_or(serde_json::Value::Null);
            bind_value(field, &value).map(|v| (field, v))
        })
        .collect()
}

fn bind_value(field: &FieldDescriptor, value: &serde_json::Value) -> Result<SqlValue, MappingError> {
    if value.is_null() {
        return Ok(SqlValue::Null(field.kind));
    }
    if matches!(field.storage, Storage::Serialized | Storage::Dynamic)
        || value.is_array()
        || value.is_object()
    {
        return Ok(SqlValue::Text(serde_json::to_string(value)?));
    }
    SqlValue::from_json(value).map_err(|e| match e {
        MappingError::Encode(msg) => MappingError::Encode(format!("field `{}`: {msg}", field.name)),
        other => other,
    })
}

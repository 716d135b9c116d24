//! Row materialization: [`RowSet`] rows into typed records.
//!
//! Every row starts from the record's zero value. Each result column is
//! matched to a field (exact name first, then case-converted variants) and
//! converted according to the field's storage and target; unmatched columns
//! are ignored so extra columns never break older record types.
//!
//! Conversion is best-effort per field: a value that cannot be converted is
//! logged and the field keeps its zero value, and the rest of the row is
//! still materialized.

use std::any::type_name;

use crate::error::MappingError;
use crate::record::Record;
use crate::schema::{FieldDescriptor, Schema, Storage, Target};
use crate::value::{RowSet, SqlValue};

/// Materialize every row of `rows` into `T`.
///
/// # Errors
///
/// Returns [`MappingError::Config`] if `schema` was not loaded for `T`, or
/// [`MappingError::Decode`] if a row cannot be turned into `T` even with
/// every offending field reset to its zero value.
pub fn materialize<T: Record>(schema: &Schema, rows: &RowSet) -> Result<Vec<T>, MappingError> {
    materialize_as::<T, T>(schema, rows)
}

/// Materialize every row of `rows` into `T`, wrapped as `P`.
///
/// `P` is typically `T` itself, `Box<T>`, or `Arc<T>`; the conversion is
/// identical for all of them.
///
/// # Errors
///
/// See [`materialize`].
pub fn materialize_as<T, P>(schema: &Schema, rows: &RowSet) -> Result<Vec<P>, MappingError>
where
    T: Record,
    P: From<T>,
{
    check_schema::<T>(schema)?;
    let column_map: Vec<Option<usize>> = rows
        .columns
        .iter()
        .map(|c| schema.match_column(c))
        .collect();

    rows.rows
        .iter()
        .map(|row| materialize_row::<T>(schema, &rows.columns, &column_map, row).map(P::from))
        .collect()
}

/// Materialize the first row of `rows`, if any.
///
/// # Errors
///
/// See [`materialize`].
pub fn materialize_first<T: Record>(
    schema: &Schema,
    rows: &RowSet,
) -> Result<Option<T>, MappingError> {
    check_schema::<T>(schema)?;
    let Some(first) = rows.rows.first() else {
        return Ok(None);
    };
    let column_map: Vec<Option<usize>> = rows
        .columns
        .iter()
        .map(|c| schema.match_column(c))
        .collect();
    materialize_row::<T>(schema, &rows.columns, &column_map, first).map(Some)
}

/// Extract the columns of one table from a joined result.
///
/// Joined selects alias every column as `<table>__<column>`; the returned
/// set carries only `table`'s columns with the prefix stripped.
pub fn split_joined(rows: &RowSet, table: &str) -> RowSet {
    let prefix = format!("{table}__");
    let picked: Vec<(usize, String)> = rows
        .columns
        .iter()
        .enumerate()
        .filter_map(|(i, c)| c.strip_prefix(&prefix).map(|rest| (i, rest.to_owned())))
        .collect();

    RowSet {
        columns: picked.iter().map(|(_, c)| c.clone()).collect(),
        rows: rows
            .rows
            .iter()
            .map(|row| {
                picked
                    .iter()
                    .map(|(i, _)| row.get(*i).cloned().unwrap_or(SqlValue::NULL))
                    .collect()
            })
            .collect(),
    }
}

fn check_schema<T: Record>(schema: &Schema) -> Result<(), MappingError> {
    if schema.record_name() == type_name::<T>() {
        Ok(())
    } else {
        Err(MappingError::Config(format!(
            "schema for `{}` cannot materialize `{}`",
            schema.record_name(),
            type_name::<T>()
        )))
    }
}

fn materialize_row<T: Record>(
    schema: &Schema,
    columns: &[String],
    column_map: &[Option<usize>],
    row: &[SqlValue],
) -> Result<T, MappingError> {
    let mut object = schema.zero_object().clone();
    let mut assigned: Vec<(String, Vec<serde_json::Value>)> = Vec::new();

    for ((cell, slot), column) in row.iter().zip(column_map).zip(columns) {
        let Some(field) = slot.and_then(|i| schema.fields().get(i)) else {
            continue;
        };
        match convert_cell(schema, field, cell) {
            Ok(Some(value)) => {
                object.insert(field.name.clone(), value.clone());
                let mut candidates = vec![value];
                candidates.extend(natural_alternates(field, cell));
                assigned.push((field.name.clone(), candidates));
            }
            Ok(None) => {
                object.insert(field.name.clone(), schema.zero_value(field));
            }
            Err(e) => {
                tracing::warn!(
                    record = schema.record_name(),
                    field = field.name.as_str(),
                    column = column.as_str(),
                    error = %e,
                    "Column value not convertible, field left at zero value"
                );
            }
        }
    }

    match serde_json::from_value::<T>(serde_json::Value::Object(object)) {
        Ok(record) => Ok(record),
        Err(_) => salvage_row(schema, assigned),
    }
}

/// Re-apply converted values one at a time, trying each candidate of a
/// field in turn and dropping the field when the record type rejects all
/// of them.
fn salvage_row<T: Record>(
    schema: &Schema,
    assigned: Vec<(String, Vec<serde_json::Value>)>,
) -> Result<T, MappingError> {
    let mut object = schema.zero_object().clone();
    for (name, candidates) in assigned {
        let previous = object.get(&name).cloned().unwrap_or(serde_json::Value::Null);
        let mut rejection = None;
        for candidate in candidates {
            object.insert(name.clone(), candidate);
            match serde_json::from_value::<T>(serde_json::Value::Object(object.clone())) {
                Ok(_) => {
                    rejection = None;
                    break;
                }
                Err(e) => rejection = Some(e),
            }
        }
        if let Some(e) = rejection {
            tracing::warn!(
                record = schema.record_name(),
                field = name.as_str(),
                error = %e,
                "Field value rejected by record type, field left at zero value"
            );
            object.insert(name, previous);
        }
    }
    serde_json::from_value(serde_json::Value::Object(object)).map_err(|e| {
        MappingError::Decode(format!(
            "zero value of `{}` does not round-trip: {e}",
            schema.record_name()
        ))
    })
}

/// Other readings of a cell for a field whose zero value is null, tried
/// when the natural one is rejected: JSON text holding a list or object
/// (how composites are written), and 0/1 integers as booleans.
fn natural_alternates(field: &FieldDescriptor, cell: &SqlValue) -> Vec<serde_json::Value> {
    if field.target != Target::Natural || field.storage != Storage::Plain {
        return Vec::new();
    }
    let encoded = match cell {
        SqlValue::Text(s) => Some(s.as_bytes()),
        SqlValue::Bytes(b) => Some(b.as_slice()),
        _ => None,
    };
    let mut alternates = Vec::new();
    if let Some(value) = encoded
        .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(bytes).ok())
        .filter(|v| v.is_array() || v.is_object())
    {
        alternates.push(value);
    }
    match cell {
        SqlValue::Int(0) => alternates.push(serde_json::Value::Bool(false)),
        SqlValue::Int(1) => alternates.push(serde_json::Value::Bool(true)),
        _ => {}
    }
    alternates
}

/// Convert one cell for `field`; `Ok(None)` means "use the zero value".
fn convert_cell(
    schema: &Schema,
    field: &FieldDescriptor,
    cell: &SqlValue,
) -> Result<Option<serde_json::Value>, MappingError> {
    if cell.is_null() {
        return Ok(None);
    }
    let value = match field.storage {
        Storage::Serialized => serde_json::from_slice(encoded_bytes(field, cell)?)?,
        Storage::Dynamic => schema
            .registry()
            .decode(&field.name, encoded_bytes(field, cell)?)?,
        Storage::Plain => convert_plain(field, cell)?,
    };
    Ok(Some(value))
}

fn encoded_bytes<'a>(field: &FieldDescriptor, cell: &'a SqlValue) -> Result<&'a [u8], MappingError> {
    match cell {
        SqlValue::Text(s) => Ok(s.as_bytes()),
        SqlValue::Bytes(b) => Ok(b),
        other => Err(MappingError::Decode(format!(
            "field `{}` expects an encoded document, column holds {other:?}",
            field.name
        ))),
    }
}

fn convert_plain(field: &FieldDescriptor, cell: &SqlValue) -> Result<serde_json::Value, MappingError> {
    let mismatch = || {
        MappingError::Decode(format!(
            "cannot convert {cell:?} into {:?} field `{}`",
            field.target, field.name
        ))
    };

    match (field.target, cell) {
        (Target::Natural, _) => Ok(cell.to_json()),

        (Target::Text, SqlValue::Text(s)) => Ok(serde_json::Value::String(s.clone())),
        (Target::Text, SqlValue::Bytes(b)) => String::from_utf8(b.clone())
            .ok()
            .map(serde_json::Value::String)
            .ok_or_else(mismatch),
        (Target::Text, SqlValue::Int(i)) => Ok(serde_json::Value::String(i.to_string())),
        (Target::Text, SqlValue::Float(f)) => Ok(serde_json::Value::String(f.to_string())),
        (Target::Text, SqlValue::Bool(b)) => Ok(serde_json::Value::String(b.to_string())),

        (Target::Integer, SqlValue::Int(i)) => Ok(serde_json::Value::from(*i)),
        (Target::Integer, SqlValue::Bool(b)) => Ok(serde_json::Value::from(i64::from(*b))),
        (Target::Integer, SqlValue::Float(f)) if f.fract() == 0.0 => format!("{f:.0}")
            .parse::<i64>()
            .ok()
            .map(serde_json::Value::from)
            .ok_or_else(mismatch),
        (Target::Integer, SqlValue::Text(s)) => parse_integer(s.trim()).ok_or_else(mismatch),

        (Target::Float, SqlValue::Float(f)) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(mismatch),
        (Target::Float, SqlValue::Int(i)) => Ok(serde_json::Value::from(*i)),
        (Target::Float, SqlValue::Text(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .ok_or_else(mismatch),

        (Target::Bool, SqlValue::Bool(b)) => Ok(serde_json::Value::Bool(*b)),
        (Target::Bool, SqlValue::Int(i)) => Ok(serde_json::Value::Bool(*i != 0)),
        (Target::Bool, SqlValue::Text(s)) => parse_bool(s.trim())
            .map(serde_json::Value::Bool)
            .ok_or_else(mismatch),

        (Target::List | Target::Map | Target::Json, SqlValue::Text(_) | SqlValue::Bytes(_)) => {
            let bytes = encoded_bytes(field, cell)?;
            let value: serde_json::Value = serde_json::from_slice(bytes)?;
            match (field.target, &value) {
                (Target::List, serde_json::Value::Array(_))
                | (Target::Map, serde_json::Value::Object(_))
                | (Target::Json, _) => Ok(value),
                _ => Err(mismatch()),
            }
        }

        _ => Err(mismatch()),
    }
}

fn parse_integer(s: &str) -> Option<serde_json::Value> {
    s.parse::<i64>()
        .map(serde_json::Value::from)
        .or_else(|_| s.parse::<u64>().map(serde_json::Value::from))
        .ok()
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" => Some(true),
        "false" | "f" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::record::RecordMeta;
    use crate::registry::TypeRegistry;
    use crate::value::ColumnKind;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Address {
        city: String,
        zip: String,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Member {
        id: String,
        #[serde(rename = "FullName")]
        full_name: String,
        age: i64,
        score: f64,
        active: bool,
        nickname: Option<String>,
        verified: Option<bool>,
        tags: Vec<String>,
        limits: BTreeMap<String, i64>,
        address: Address,
        extra: serde_json::Value,
    }

    impl Record for Member {
        fn meta() -> RecordMeta {
            RecordMeta::new("members")
                .primary_key("id")
                .serialized("tags")
                .dynamic("extra")
                .kind("verified", ColumnKind::Bool)
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Settings {
        theme: String,
    }

    fn schema() -> Schema {
        let registry = TypeRegistry::new().register::<Settings>("extra");
        Schema::load::<Member>(Arc::new(registry)).unwrap()
    }

    fn text(s: &str) -> SqlValue {
        SqlValue::Text(s.to_owned())
    }

    fn full_rows() -> RowSet {
        let mut rows = RowSet::new([
            "id", "full_name", "age", "score", "active", "nickname", "verified", "tags", "limits",
            "address", "extra", "unexpected",
        ]);
        rows.push_row(vec![
            text("m1"),
            text("Ann Lee"),
            SqlValue::Int(31),
            SqlValue::Float(4.5),
            SqlValue::Int(1),
            SqlValue::NULL,
            SqlValue::Int(0),
            text(r#"["a","b"]"#),
            text(r#"{"daily":5}"#),
            text(r#"{"city":"Oslo","zip":"0150"}"#),
            SqlValue::Bytes(br#"{"theme":"dark"}"#.to_vec()),
            text("ignored"),
        ])
        .unwrap();
        rows
    }

    #[test]
    fn materializes_every_field_kind() {
        let members: Vec<Member> = materialize(&schema(), &full_rows()).unwrap();
        assert_eq!(members.len(), 1);
        let m = &members[0];
        assert_eq!(m.id, "m1");
        assert_eq!(m.full_name, "Ann Lee");
        assert_eq!(m.age, 31);
        assert!((m.score - 4.5).abs() < f64::EPSILON);
        assert!(m.active);
        assert_eq!(m.nickname, None);
        assert_eq!(m.verified, Some(false));
        assert_eq!(m.tags, vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(m.limits.get("daily"), Some(&5));
        assert_eq!(m.address.city, "Oslo");
        assert_eq!(m.extra, serde_json::json!({"theme": "dark"}));
    }

    #[test]
    fn boxed_and_plain_targets_agree() {
        let schema = schema();
        let rows = full_rows();
        let plain: Vec<Member> = materialize(&schema, &rows).unwrap();
        let boxed: Vec<Box<Member>> = materialize_as::<Member, Box<Member>>(&schema, &rows).unwrap();
        let shared: Vec<Arc<Member>> = materialize_as::<Member, Arc<Member>>(&schema, &rows).unwrap();
        assert_eq!(plain[0], *boxed[0]);
        assert_eq!(plain[0], *shared[0]);
    }

    #[test]
    fn nulls_become_zero_values() {
        let mut rows = RowSet::new(["id", "age", "tags", "address"]);
        rows.push_row(vec![text("m2"), SqlValue::NULL, SqlValue::NULL, SqlValue::NULL])
            .unwrap();
        let m: Member = materialize_first(&schema(), &rows).unwrap().unwrap();
        assert_eq!(m.age, 0);
        assert!(m.tags.is_empty());
        assert_eq!(m.address, Address::default());
    }

    #[test]
    fn unconvertible_fields_keep_zero_and_rest_survives() {
        let mut rows = RowSet::new(["id", "age", "tags", "address"]);
        rows.push_row(vec![
            text("m3"),
            text("not a number"),
            text("{broken"),
            text(r#"{"city":7}"#),
        ])
        .unwrap();
        let m: Member = materialize_first(&schema(), &rows).unwrap().unwrap();
        assert_eq!(m.id, "m3");
        assert_eq!(m.age, 0);
        assert!(m.tags.is_empty());
        assert_eq!(m.address, Address::default());
    }

    #[test]
    fn text_columns_convert_into_scalars() {
        let mut rows = RowSet::new(["id", "age", "score", "active"]);
        rows.push_row(vec![text("m4"), text(" 42 "), text("2.25"), text("true")])
            .unwrap();
        let m: Member = materialize_first(&schema(), &rows).unwrap().unwrap();
        assert_eq!(m.age, 42);
        assert!((m.score - 2.25).abs() < f64::EPSILON);
        assert!(m.active);
    }

    #[test]
    fn raw_bytes_convert_into_text() {
        let mut rows = RowSet::new(["id", "FullName"]);
        rows.push_row(vec![text("m5"), SqlValue::Bytes(b"Bo".to_vec())]).unwrap();
        let m: Member = materialize_first(&schema(), &rows).unwrap().unwrap();
        assert_eq!(m.full_name, "Bo");
    }

    #[test]
    fn dynamic_field_that_is_not_a_document_stays_zero() {
        let mut rows = RowSet::new(["id", "extra"]);
        rows.push_row(vec![text("m6"), text("42")]).unwrap();
        let m: Member = materialize_first(&schema(), &rows).unwrap().unwrap();
        assert_eq!(m.extra, serde_json::Value::Null);
    }

    #[test]
    fn unhinted_nullable_fields_accept_encoded_composites_and_flags() {
        #[derive(Debug, Default, Serialize, Deserialize)]
        struct Loose {
            id: String,
            labels: Option<Vec<String>>,
            home: Option<Address>,
            flagged: Option<bool>,
            note: Option<String>,
        }
        impl Record for Loose {
            fn meta() -> RecordMeta {
                RecordMeta::new("loose").primary_key("id")
            }
        }
        let schema = Schema::load::<Loose>(Arc::new(TypeRegistry::new())).unwrap();
        let mut rows = RowSet::new(["id", "labels", "home", "flagged", "note"]);
        rows.push_row(vec![
            text("l1"),
            text(r#"["x","y"]"#),
            text(r#"{"city":"Bergen","zip":"5003"}"#),
            SqlValue::Int(1),
            text(r#"["kept","as","text"]"#),
        ])
        .unwrap();
        let l: Loose = materialize_first(&schema, &rows).unwrap().unwrap();
        assert_eq!(l.labels, Some(vec!["x".to_owned(), "y".to_owned()]));
        assert_eq!(l.home.unwrap().city, "Bergen");
        assert_eq!(l.flagged, Some(true));
        assert_eq!(l.note.as_deref(), Some(r#"["kept","as","text"]"#));
    }

    #[test]
    fn nullable_flag_outside_zero_and_one_stays_unset() {
        #[derive(Debug, Default, Serialize, Deserialize)]
        struct Flagged {
            id: String,
            flagged: Option<bool>,
        }
        impl Record for Flagged {
            fn meta() -> RecordMeta {
                RecordMeta::new("flagged").primary_key("id")
            }
        }
        let schema = Schema::load::<Flagged>(Arc::new(TypeRegistry::new())).unwrap();
        let mut rows = RowSet::new(["id", "flagged"]);
        rows.push_row(vec![text("f1"), SqlValue::Int(7)]).unwrap();
        let f: Flagged = materialize_first(&schema, &rows).unwrap().unwrap();
        assert_eq!(f.id, "f1");
        assert_eq!(f.flagged, None);
    }

    #[test]
    fn empty_result_yields_nothing() {
        let rows = RowSet::new(["id"]);
        assert!(materialize::<Member>(&schema(), &rows).unwrap().is_empty());
        assert!(materialize_first::<Member>(&schema(), &rows).unwrap().is_none());
    }

    #[test]
    fn schema_of_another_type_is_refused() {
        #[derive(Debug, Default, Serialize, Deserialize)]
        struct Other {
            id: String,
        }
        impl Record for Other {
            fn meta() -> RecordMeta {
                RecordMeta::new("others")
            }
        }
        let rows = RowSet::new(["id"]);
        assert!(matches!(
            materialize::<Other>(&schema(), &rows),
            Err(MappingError::Config(_))
        ));
    }

    #[test]
    fn split_joined_strips_table_prefix() {
        let mut rows = RowSet::new(["members__id", "orders__id", "orders__total"]);
        rows.push_row(vec![text("m1"), text("o1"), SqlValue::Int(9)]).unwrap();
        let orders = split_joined(&rows, "orders");
        assert_eq!(orders.columns, vec!["id".to_owned(), "total".to_owned()]);
        assert_eq!(orders.rows[0], vec![text("o1"), SqlValue::Int(9)]);
        let members = split_joined(&rows, "members");
        assert_eq!(members.columns, vec!["id".to_owned()]);
    }
}

//! Driver-independent values, result rows, and parameterized statements.
//!
//! Everything that crosses the boundary between the mapping engine and a
//! connection is expressed in these types. A [`RowSet`] is what the store
//! hands back and what the cache stores; a [`Statement`] is what the
//! builders hand to the store.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::MappingError;

/// Storage kind of a column.
///
/// Used to type `NULL` parameters so strict dialects (`PostgreSQL`) accept
/// them, and to steer conversion of nullable fields whose Rust type cannot
/// be inferred from a zero value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    /// Boolean column.
    Bool,
    /// 64-bit integer column.
    Integer,
    /// Double-precision column.
    Float,
    /// Text column.
    #[default]
    Text,
    /// Raw byte column.
    Bytes,
    /// Text column holding a JSON document.
    Json,
}

/// A single SQL value: a statement parameter or a result cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    /// SQL `NULL`, typed with the column kind it binds as.
    Null(ColumnKind),
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// A list of values. Only valid as the argument of an IN condition,
    /// where it is flattened into individual parameters.
    List(Vec<SqlValue>),
}

impl SqlValue {
    /// Untyped `NULL` (binds as text).
    pub const NULL: Self = Self::Null(ColumnKind::Text);

    /// Whether this value is SQL `NULL`.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    /// Convert a JSON value into a SQL value.
    ///
    /// Scalars map to their natural SQL counterpart, arrays become
    /// [`SqlValue::List`], and objects are encoded as JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Encode`] for unsigned integers above
    /// `i64::MAX`, which no supported dialect can bind.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, MappingError> {
        match value {
            serde_json::Value::Null => Ok(Self::NULL),
            serde_json::Value::Bool(b) => Ok(Self::Bool(*b)),
            serde_json::Value::Number(n) => number_to_sql(n),
            serde_json::Value::String(s) => Ok(Self::Text(s.clone())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(Self::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            serde_json::Value::Object(_) => Ok(Self::Text(serde_json::to_string(value)?)),
        }
    }

    /// Convert this value into its natural JSON counterpart.
    ///
    /// Bytes that are valid UTF-8 become a string; other bytes become an
    /// array of numbers. Non-finite floats become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null(_) => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(b) => std::str::from_utf8(b).map_or_else(
                |_| serde_json::Value::from(b.clone()),
                |s| serde_json::Value::String(s.to_owned()),
            ),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
        }
    }
}

fn number_to_sql(n: &serde_json::Number) -> Result<SqlValue, MappingError> {
    if let Some(i) = n.as_i64() {
        return Ok(SqlValue::Int(i));
    }
    if n.is_u64() {
        return Err(MappingError::Encode(format!(
            "integer {n} does not fit in a signed 64-bit column"
        )));
    }
    n.as_f64()
        .map(SqlValue::Float)
        .ok_or_else(|| MappingError::Encode(format!("unsupported number {n}")))
}

/// Rust types with a fixed column kind, used to type `None` parameters.
pub trait SqlType {
    /// The column kind values of this type bind as.
    const KIND: ColumnKind;
}

macro_rules! impl_sql_value {
    ($($ty:ty => $kind:ident, $variant:ident($conv:expr);)*) => {
        $(
            impl SqlType for $ty {
                const KIND: ColumnKind = ColumnKind::$kind;
            }

            impl From<$ty> for SqlValue {
                fn from(value: $ty) -> Self {
                    Self::$variant($conv(value))
                }
            }
        )*
    };
}

impl_sql_value! {
    bool => Bool, Bool(std::convert::identity);
    i64 => Integer, Int(std::convert::identity);
    i32 => Integer, Int(i64::from);
    i16 => Integer, Int(i64::from);
    u32 => Integer, Int(i64::from);
    u16 => Integer, Int(i64::from);
    f64 => Float, Float(std::convert::identity);
    f32 => Float, Float(f64::from);
    String => Text, Text(std::convert::identity);
    &str => Text, Text(str::to_owned);
    &String => Text, Text(String::clone);
}

impl<T> From<Option<T>> for SqlValue
where
    T: Into<Self> + SqlType,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null(T::KIND), Into::into)
    }
}

impl<T> From<Vec<T>> for SqlValue
where
    T: Into<Self>,
{
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for SqlValue {
    /// Lossy conversion; out-of-range unsigned integers become text.
    fn from(value: serde_json::Value) -> Self {
        Self::from_json(&value).unwrap_or_else(|_| Self::Text(value.to_string()))
    }
}

/// A driver-independent result set: column names plus row cells.
///
/// This is the cursor the materializer consumes and the payload the cache
/// stores (as JSON bytes).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    /// Column names in result order.
    pub columns: Vec<String>,
    /// Row cells; every row has exactly `columns.len()` cells.
    pub rows: Vec<Vec<SqlValue>>,
}

impl RowSet {
    /// Create an empty result set with the given columns.
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Decode`] if the row width differs from the
    /// column count.
    pub fn push_row(&mut self, row: Vec<SqlValue>) -> Result<(), MappingError> {
        if row.len() != self.columns.len() {
            return Err(MappingError::Decode(format!(
                "row has {} cells but result has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Number of rows.
    pub const fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no rows.
    pub const fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column by exact name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Encode as a cache payload.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Serialization`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MappingError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a cache payload, validating row widths.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Serialization`] for malformed bytes and
    /// [`MappingError::Decode`] for ragged rows.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MappingError> {
        let decoded: Self = serde_json::from_slice(bytes)?;
        if let Some(bad) = decoded.rows.iter().find(|r| r.len() != decoded.columns.len()) {
            return Err(MappingError::Decode(format!(
                "cached row has {} cells but result has {} columns",
                bad.len(),
                decoded.columns.len()
            )));
        }
        Ok(decoded)
    }
}

/// A parameterized SQL statement.
///
/// Placeholders are positional (`$1`, `$2`, ...) and numbered in the order
/// their arguments appear in `args`. No value is ever spliced into `sql`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    /// SQL text with positional placeholders.
    pub sql: String,
    /// Arguments, one per placeholder, in placeholder order.
    pub args: Vec<SqlValue>,
}

impl Statement {
    /// Create a statement from raw parts.
    pub fn new(sql: impl Into<String>, args: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }

    /// Placeholder numbers in the order they appear in the SQL text.
    ///
    /// Quoted identifiers and string literals are skipped.
    pub fn placeholders(&self) -> Vec<usize> {
        let mut found = Vec::new();
        let mut chars = self.sql.char_indices().peekable();
        let mut quote: Option<char> = None;
        while let Some((_, c)) = chars.next() {
            if let Some(q) = quote {
                if c == q {
                    quote = None;
                }
                continue;
            }
            match c {
                '"' | '\'' => quote = Some(c),
                '$' => {
                    let mut digits = String::new();
                    while let Some((_, d)) = chars.peek().copied().filter(|(_, d)| d.is_ascii_digit()) {
                        digits.push(d);
                        chars.next();
                    }
                    if let Ok(n) = digits.parse::<usize>() {
                        found.push(n);
                    }
                }
                _ => {}
            }
        }
        found
    }

    /// Number of distinct placeholders.
    pub fn placeholder_count(&self) -> usize {
        self.placeholders().into_iter().collect::<BTreeSet<_>>().len()
    }
}

/// Quote an identifier for `PostgreSQL` and `SQLite`, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Incremental SQL writer that numbers placeholders as arguments are bound.
#[derive(Debug, Default)]
pub(crate) struct SqlBuf {
    sql: String,
    args: Vec<SqlValue>,
}

impl SqlBuf {
    pub(crate) fn new(prefix: &str) -> Self {
        Self {
            sql: prefix.to_owned(),
            args: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, fragment: &str) {
        self.sql.push_str(fragment);
    }

    pub(crate) fn push_ident(&mut self, ident: &str) {
        self.sql.push_str(&quote_ident(ident));
    }

    /// Append a placeholder for `value`.
    pub(crate) fn bind(&mut self, value: SqlValue) -> Result<(), MappingError> {
        if matches!(value, SqlValue::List(_)) {
            return Err(MappingError::Encode(
                "list values are only valid inside IN conditions".to_owned(),
            ));
        }
        self.args.push(value);
        self.sql.push('$');
        self.sql.push_str(&self.args.len().to_string());
        Ok(())
    }

    pub(crate) fn finish(self) -> Statement {
        Statement {
            sql: self.sql,
            args: self.args,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn option_none_carries_kind() {
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null(ColumnKind::Integer));
        assert_eq!(SqlValue::from(Some("x")), SqlValue::Text("x".to_owned()));
    }

    #[test]
    fn vec_becomes_list() {
        let value = SqlValue::from(vec![1_i64, 2]);
        assert_eq!(value, SqlValue::List(vec![SqlValue::Int(1), SqlValue::Int(2)]));
    }

    #[test]
    fn json_objects_encode_as_text() {
        let value = SqlValue::from_json(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(value, SqlValue::Text(r#"{"a":1}"#.to_owned()));
    }

    #[test]
    fn oversized_unsigned_is_rejected() {
        let err = SqlValue::from_json(&serde_json::json!(u64::MAX)).unwrap_err();
        assert!(matches!(err, MappingError::Encode(_)));
    }

    #[test]
    fn bytes_to_json_prefers_text() {
        assert_eq!(SqlValue::Bytes(b"hi".to_vec()).to_json(), serde_json::json!("hi"));
        assert_eq!(SqlValue::Bytes(vec![0xff]).to_json(), serde_json::json!([255]));
    }

    #[test]
    fn placeholders_skip_quoted_text() {
        let stmt = Statement::new(r#"SELECT "a$1" FROM t WHERE x = $1 AND y = '$9' AND z = $2"#, vec![]);
        assert_eq!(stmt.placeholders(), vec![1, 2]);
        assert_eq!(stmt.placeholder_count(), 2);
    }

    #[test]
    fn quote_ident_doubles_quotes() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn row_set_rejects_ragged_rows() {
        let mut rows = RowSet::new(["id", "name"]);
        assert!(rows.push_row(vec![SqlValue::Int(1)]).is_err());
        rows.push_row(vec![SqlValue::Int(1), SqlValue::Text("a".to_owned())]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.column_index("name"), Some(1));
    }

    #[test]
    fn row_set_payload_round_trip_validates_width() {
        let mut rows = RowSet::new(["id"]);
        rows.push_row(vec![SqlValue::Int(7)]).unwrap();
        let bytes = rows.to_bytes().unwrap();
        assert_eq!(RowSet::from_bytes(&bytes).unwrap(), rows);

        let ragged = br#"{"columns":["id"],"rows":[[{"Int":1},{"Int":2}]]}"#;
        assert!(matches!(RowSet::from_bytes(ragged), Err(MappingError::Decode(_))));
        assert!(RowSet::from_bytes(b"garbage").is_err());
    }

    #[test]
    fn sql_buf_numbers_in_bind_order() {
        let mut buf = SqlBuf::new("SELECT * FROM t WHERE a = ");
        buf.bind(SqlValue::Int(1)).unwrap();
        buf.push(" AND b = ");
        buf.bind(SqlValue::Text("x".to_owned())).unwrap();
        assert!(buf.bind(SqlValue::List(vec![])).is_err());
        let stmt = buf.finish();
        assert_eq!(stmt.sql, "SELECT * FROM t WHERE a = $1 AND b = $2");
        assert_eq!(stmt.args.len(), 2);
    }
}

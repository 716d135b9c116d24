//! Fluent SELECT and DELETE builders.
//!
//! Field names are resolved against the record schema as methods are
//! called; the first resolution failure is kept and returned by `build()`,
//! so a chain of builder calls never panics and never silently drops a
//! condition. Operators only ever come from [`Operator`], and every value
//! is bound as a positional parameter.

mod condition;
mod delete;
mod select;

pub use delete::Delete;
pub use select::Select;

use std::fmt;

use crate::error::MappingError;

/// Condition operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// `=`
    Eq,
    /// `!=`
    NotEq,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `LIKE`
    Like,
    /// `IN (...)`
    In,
    /// `BETWEEN .. AND ..`
    Between,
    /// `IS NULL`
    IsNull,
    /// `IS NOT NULL`
    IsNotNull,
}

impl Operator {
    /// SQL text of the operator.
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Like => "LIKE",
            Self::In => "IN",
            Self::Between => "BETWEEN",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
        }
    }

    /// Parse a caller-supplied comparison operator.
    ///
    /// Only `=`, `!=`, `>`, `<`, `>=`, `<=` and `LIKE` (any case) are
    /// accepted. Surrounding whitespace is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::InvalidOperator`] for anything else.
    pub fn parse_comparison(op: &str) -> Result<Self, MappingError> {
        match op.trim() {
            "=" => Ok(Self::Eq),
            "!=" => Ok(Self::NotEq),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            other if other.eq_ignore_ascii_case("like") => Ok(Self::Like),
            _ => Err(MappingError::InvalidOperator(op.to_owned())),
        }
    }

    /// Whether this operator compares against a single bound value.
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::NotEq | Self::Gt | Self::Ge | Self::Lt | Self::Le | Self::Like
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

impl Order {
    const fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Join flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// `INNER JOIN`
    Inner,
    /// `LEFT JOIN`
    Left,
}

impl JoinKind {
    const fn as_sql(self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::Left => "LEFT JOIN",
        }
    }
}

/// Aggregate functions usable in HAVING clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    /// `COUNT`
    Count,
    /// `SUM`
    Sum,
    /// `AVG`
    Avg,
    /// `MIN`
    Min,
    /// `MAX`
    Max,
}

impl Aggregate {
    const fn as_sql(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

/// Rebuild a deferred builder error so `build()` can be called repeatedly.
fn replay(err: &MappingError) -> MappingError {
    match err {
        MappingError::Config(m) => MappingError::Config(m.clone()),
        MappingError::MissingTable { record } => MappingError::MissingTable { record: record.clone() },
        MappingError::MissingPrimaryKey { record } => MappingError::MissingPrimaryKey { record: record.clone() },
        MappingError::UnknownField { record, field } => MappingError::UnknownField {
            record: record.clone(),
            field: field.clone(),
        },
        MappingError::InvalidOperator(op) => MappingError::InvalidOperator(op.clone()),
        MappingError::EmptyInList(c) => MappingError::EmptyInList(c.clone()),
        MappingError::Encode(m) => MappingError::Encode(m.clone()),
        MappingError::Decode(m) => MappingError::Decode(m.clone()),
        MappingError::Serialization(e) => MappingError::Encode(e.to_string()),
    }
}

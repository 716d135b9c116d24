use crate::error::MappingError;
use crate::query::Operator;
use crate::schema::Schema;
use crate::value::{SqlBuf, SqlValue};

/// A resolved column, remembered with the table it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ColumnRef {
    pub(crate) table: String,
    pub(crate) column: String,
}

impl ColumnRef {
    pub(crate) fn write(&self, buf: &mut SqlBuf, qualified: bool) {
        if qualified {
            buf.push_ident(&self.table);
            buf.push(".");
        }
        buf.push_ident(&self.column);
    }

    /// Output alias used by joined selects.
    pub(crate) fn alias(&self) -> String {
        format!("{}__{}", self.table, self.column)
    }
}

/// Resolve `field` against a set of schemas; the first is the default for
/// unqualified names, `table.field` picks a schema by table name.
pub(crate) fn resolve(schemas: &[&Schema], field: &str) -> Result<ColumnRef, MappingError> {
    let Some(base) = schemas.first() else {
        return Err(MappingError::Config("no schema to resolve against".to_owned()));
    };

    if let Some((table, name)) = field.split_once('.') {
        for schema in schemas {
            if schema.table()? == table {
                let descriptor = schema.field(name)?;
                return Ok(ColumnRef {
                    table: table.to_owned(),
                    column: descriptor.column.clone(),
                });
            }
        }
        return Err(MappingError::UnknownField {
            record: base.table()?.to_owned(),
            field: field.to_owned(),
        });
    }

    let descriptor = base.field(field)?;
    Ok(ColumnRef {
        table: base.table()?.to_owned(),
        column: descriptor.column.clone(),
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Compare(Operator, SqlValue),
    In(Vec<SqlValue>),
    Between(SqlValue, SqlValue),
    IsNull,
    IsNotNull,
}

/// One WHERE term.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Condition {
    column: ColumnRef,
    predicate: Predicate,
}

impl Condition {
    pub(crate) fn new(column: ColumnRef, op: Operator, value: SqlValue) -> Result<Self, MappingError> {
        let predicate = match op {
            Operator::Eq if value.is_null() => Predicate::IsNull,
            Operator::NotEq if value.is_null() => Predicate::IsNotNull,
            Operator::IsNull => Predicate::IsNull,
            Operator::IsNotNull => Predicate::IsNotNull,
            Operator::In => {
                let values = flatten(value);
                if values.is_empty() {
                    return Err(MappingError::EmptyInList(column.column));
                }
                Predicate::In(values)
            }
            Operator::Between => match value {
                SqlValue::List(bounds) => match <[SqlValue; 2]>::try_from(bounds) {
                    Ok([low, high]) => Predicate::Between(low, high),
                    Err(bounds) => {
                        return Err(MappingError::Encode(format!(
                            "BETWEEN on `{}` needs two bounds, got {}",
                            column.column,
                            bounds.len()
                        )));
                    }
                },
                _ => {
                    return Err(MappingError::Encode(format!(
                        "BETWEEN on `{}` needs two bounds",
                        column.column
                    )));
                }
            },
            Operator::Eq
            | Operator::NotEq
            | Operator::Gt
            | Operator::Ge
            | Operator::Lt
            | Operator::Le
            | Operator::Like => {
                if matches!(value, SqlValue::List(_)) {
                    return Err(MappingError::Encode(format!(
                        "`{op}` on `{}` takes a single value",
                        column.column
                    )));
                }
                Predicate::Compare(op, value)
            }
        };
        Ok(Self { column, predicate })
    }

    pub(crate) fn write(&self, buf: &mut SqlBuf, qualified: bool) -> Result<(), MappingError> {
        self.column.write(buf, qualified);
        match &self.predicate {
            Predicate::Compare(op, value) => {
                buf.push(" ");
                buf.push(op.as_sql());
                buf.push(" ");
                buf.bind(value.clone())?;
            }
            Predicate::In(values) => {
                buf.push(" IN (");
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        buf.push(", ");
                    }
                    buf.bind(value.clone())?;
                }
                buf.push(")");
            }
            Predicate::Between(low, high) => {
                buf.push(" BETWEEN ");
                buf.bind(low.clone())?;
                buf.push(" AND ");
                buf.bind(high.clone())?;
            }
            Predicate::IsNull => buf.push(" IS NULL"),
            Predicate::IsNotNull => buf.push(" IS NOT NULL"),
        }
        Ok(())
    }
}

/// Write ` WHERE a AND b ...` when there are conditions.
pub(crate) fn write_where(
    buf: &mut SqlBuf,
    conditions: &[Condition],
    qualified: bool,
) -> Result<(), MappingError> {
    for (i, condition) in conditions.iter().enumerate() {
        buf.push(if i == 0 { " WHERE " } else { " AND " });
        condition.write(buf, qualified)?;
    }
    Ok(())
}

/// Flatten one level of nested lists; a scalar becomes a single value.
fn flatten(value: SqlValue) -> Vec<SqlValue> {
    match value {
        SqlValue::List(items) => items
            .into_iter()
            .flat_map(|item| match item {
                SqlValue::List(inner) => inner,
                scalar => vec![scalar],
            })
            .collect(),
        scalar => vec![scalar],
    }
}

/// Filter methods shared by the SELECT and DELETE builders. The builder
/// must provide `fn push_condition(self, field: &str, op: Operator, value: SqlValue) -> Self`.
macro_rules! filter_methods {
    () => {
        /// Keep rows where `field` equals `value` (`IS NULL` for a null value).
        #[must_use]
        pub fn filter_eq(self, field: &str, value: impl Into<SqlValue>) -> Self {
            self.push_condition(field, Operator::Eq, value.into())
        }

        /// Keep rows where `field` differs from `value` (`IS NOT NULL` for a null value).
        #[must_use]
        pub fn filter_ne(self, field: &str, value: impl Into<SqlValue>) -> Self {
            self.push_condition(field, Operator::NotEq, value.into())
        }

        /// Keep rows where `field > value`.
        #[must_use]
        pub fn filter_gt(self, field: &str, value: impl Into<SqlValue>) -> Self {
            self.push_condition(field, Operator::Gt, value.into())
        }

        /// Keep rows where `field >= value`.
        #[must_use]
        pub fn filter_ge(self, field: &str, value: impl Into<SqlValue>) -> Self {
            self.push_condition(field, Operator::Ge, value.into())
        }

        /// Keep rows where `field < value`.
        #[must_use]
        pub fn filter_lt(self, field: &str, value: impl Into<SqlValue>) -> Self {
            self.push_condition(field, Operator::Lt, value.into())
        }

        /// Keep rows where `field <= value`.
        #[must_use]
        pub fn filter_le(self, field: &str, value: impl Into<SqlValue>) -> Self {
            self.push_condition(field, Operator::Le, value.into())
        }

        /// Keep rows where `field LIKE pattern`.
        #[must_use]
        pub fn filter_like(self, field: &str, pattern: impl Into<SqlValue>) -> Self {
            self.push_condition(field, Operator::Like, pattern.into())
        }

        /// Keep rows where `field` is one of `values`.
        ///
        /// Accepts a list or a single value; nested lists are flattened one
        /// level. An empty list is an error at `build()`.
        #[must_use]
        pub fn filter_in(self, field: &str, values: impl Into<SqlValue>) -> Self {
            self.push_condition(field, Operator::In, values.into())
        }

        /// Keep rows where `low <= field <= high`.
        #[must_use]
        pub fn filter_between(
            self,
            field: &str,
            low: impl Into<SqlValue>,
            high: impl Into<SqlValue>,
        ) -> Self {
            self.push_condition(field, Operator::Between, SqlValue::List(vec![low.into(), high.into()]))
        }

        /// Keep rows where `field` is `NULL`.
        #[must_use]
        pub fn filter_is_null(self, field: &str) -> Self {
            self.push_condition(field, Operator::IsNull, SqlValue::NULL)
        }

        /// Keep rows where `field` is not `NULL`.
        #[must_use]
        pub fn filter_is_not_null(self, field: &str) -> Self {
            self.push_condition(field, Operator::IsNotNull, SqlValue::NULL)
        }

        /// Keep rows matching an arbitrary [`Operator`].
        ///
        /// `In` takes a list, `Between` a two-element list, and the null
        /// checks ignore `value`.
        #[must_use]
        pub fn filter(self, field: &str, op: Operator, value: impl Into<SqlValue>) -> Self {
            self.push_condition(field, op, value.into())
        }

        /// Keep rows matching a caller-supplied comparison operator.
        ///
        /// The operator must be one of `=, !=, >, <, >=, <=, LIKE`; anything
        /// else is an [`MappingError::InvalidOperator`] at `build()`.
        #[must_use]
        pub fn filter_compare(mut self, field: &str, op: &str, value: impl Into<SqlValue>) -> Self {
            match Operator::parse_comparison(op) {
                Ok(op) => self.push_condition(field, op, value.into()),
                Err(e) => {
                    self.defer(e);
                    self
                }
            }
        }
    };
}

pub(crate) use filter_methods;

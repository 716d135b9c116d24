use crate::error::MappingError;
use crate::query::condition::{filter_methods, resolve, write_where, Condition};
use crate::query::{replay, Operator};
use crate::schema::Schema;
use crate::value::{SqlBuf, SqlValue, Statement};

/// DELETE builder.
///
/// A delete with no conditions is refused at [`Delete::build`] unless
/// [`Delete::all`] was called.
#[derive(Debug)]
pub struct Delete<'s> {
    schema: &'s Schema,
    conditions: Vec<Condition>,
    all: bool,
    error: Option<MappingError>,
}

impl<'s> Delete<'s> {
    /// Delete from `schema`'s table.
    pub const fn new(schema: &'s Schema) -> Self {
        Self {
            schema,
            conditions: Vec::new(),
            all: false,
            error: None,
        }
    }

    /// The schema rows are deleted from.
    pub const fn schema(&self) -> &'s Schema {
        self.schema
    }

    filter_methods!();

    /// Allow deleting every row when no condition is set.
    #[must_use]
    pub const fn all(mut self) -> Self {
        self.all = true;
        self
    }

    /// Render the statement.
    ///
    /// # Errors
    ///
    /// Returns the first error recorded by a builder method,
    /// [`MappingError::MissingTable`] without a table, or
    /// [`MappingError::Encode`] for an unconditional delete without
    /// [`Delete::all`].
    pub fn build(&self) -> Result<Statement, MappingError> {
        if let Some(e) = &self.error {
            return Err(replay(e));
        }
        let table = self.schema.table()?;
        if self.conditions.is_empty() && !self.all {
            return Err(MappingError::Encode(format!(
                "refusing to delete every row of `{table}` without `all()`"
            )));
        }
        let mut buf = SqlBuf::new("DELETE FROM ");
        buf.push_ident(table);
        write_where(&mut buf, &self.conditions, false)?;
        Ok(buf.finish())
    }

    fn push_condition(mut self, field: &str, op: Operator, value: SqlValue) -> Self {
        match resolve(&[self.schema], field).and_then(|column| Condition::new(column, op, value)) {
            Ok(condition) => self.conditions.push(condition),
            Err(e) => self.defer(e),
        }
        self
    }

    fn defer(&mut self, err: MappingError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::record::{Record, RecordMeta};
    use crate::registry::TypeRegistry;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Session {
        token: String,
        user_id: i64,
        expires_at: i64,
    }

    impl Record for Session {
        fn meta() -> RecordMeta {
            RecordMeta::new("sessions").primary_key("token")
        }
    }

    fn schema() -> Schema {
        Schema::load::<Session>(Arc::new(TypeRegistry::new())).unwrap()
    }

    #[test]
    fn conditional_delete() {
        let schema = schema();
        let stmt = Delete::new(&schema)
            .filter_eq("user_id", 7_i64)
            .filter_lt("expires_at", 1_000_i64)
            .build()
            .unwrap();
        assert_eq!(
            stmt.sql,
            r#"DELETE FROM "sessions" WHERE "user_id" = $1 AND "expires_at" < $2"#
        );
        assert_eq!(stmt.args, vec![SqlValue::Int(7), SqlValue::Int(1_000)]);
    }

    #[test]
    fn unconditional_delete_needs_all() {
        let schema = schema();
        assert!(matches!(Delete::new(&schema).build(), Err(MappingError::Encode(_))));
        let stmt = Delete::new(&schema).all().build().unwrap();
        assert_eq!(stmt.sql, r#"DELETE FROM "sessions""#);
    }

    #[test]
    fn in_list_and_compare() {
        let schema = schema();
        let stmt = Delete::new(&schema)
            .filter_in("token", vec!["a", "b"])
            .filter_compare("user_id", "!=", 0_i64)
            .build()
            .unwrap();
        assert_eq!(
            stmt.sql,
            r#"DELETE FROM "sessions" WHERE "token" IN ($1, $2) AND "user_id" != $3"#
        );
    }

    #[test]
    fn bad_operator_blocks_the_delete() {
        let schema = schema();
        let err = Delete::new(&schema)
            .filter_compare("user_id", "OR 1=1 --", 0_i64)
            .build()
            .unwrap_err();
        assert!(matches!(err, MappingError::InvalidOperator(_)));
    }

    #[test]
    fn failed_condition_never_widens_the_delete() {
        let schema = schema();
        let err = Delete::new(&schema).all().filter_eq("nope", 1_i64).build().unwrap_err();
        assert!(matches!(err, MappingError::UnknownField { .. }));
    }
}

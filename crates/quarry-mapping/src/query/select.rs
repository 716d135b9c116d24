use crate::error::MappingError;
use crate::query::condition::{filter_methods, resolve, write_where, ColumnRef, Condition};
use crate::query::{replay, Aggregate, JoinKind, Operator, Order};
use crate::schema::Schema;
use crate::value::{ColumnKind, SqlBuf, SqlValue, Statement};

#[derive(Debug, Clone)]
struct Join<'s> {
    kind: JoinKind,
    schema: &'s Schema,
    left: ColumnRef,
    right: ColumnRef,
}

#[derive(Debug, Clone)]
struct Having {
    aggregate: Aggregate,
    column: Option<ColumnRef>,
    op: Operator,
    value: SqlValue,
}

/// SELECT builder over one record schema, optionally joined to others.
///
/// ```
/// # use std::sync::Arc;
/// # use quarry_mapping::{Order, Record, RecordMeta, Schema, Select, TypeRegistry};
/// # #[derive(Default, serde::Serialize, serde::Deserialize)]
/// # struct User { id: i64, name: String, age: i64 }
/// # impl Record for User {
/// #     fn meta() -> RecordMeta { RecordMeta::new("users").primary_key("id") }
/// # }
/// let schema = Schema::load::<User>(Arc::new(TypeRegistry::new()))?;
/// let stmt = Select::new(&schema)
///     .filter_ge("age", 18_i64)
///     .order_by("name", Order::Asc)
///     .limit(10)
///     .build()?;
/// assert_eq!(
///     stmt.sql,
///     r#"SELECT "id", "name", "age" FROM "users" WHERE "age" >= $1 ORDER BY "name" ASC LIMIT $2"#
/// );
/// # Ok::<(), quarry_mapping::MappingError>(())
/// ```
#[derive(Debug)]
pub struct Select<'s> {
    schema: &'s Schema,
    joins: Vec<Join<'s>>,
    conditions: Vec<Condition>,
    projection: Option<Vec<ColumnRef>>,
    order: Vec<(ColumnRef, Order)>,
    group: Vec<ColumnRef>,
    having: Vec<Having>,
    limit: Option<i64>,
    offset: Option<i64>,
    error: Option<MappingError>,
}

impl<'s> Select<'s> {
    /// Select every mapped column of `schema`'s table.
    pub const fn new(schema: &'s Schema) -> Self {
        Self {
            schema,
            joins: Vec::new(),
            conditions: Vec::new(),
            projection: None,
            order: Vec::new(),
            group: Vec::new(),
            having: Vec::new(),
            limit: None,
            offset: None,
            error: None,
        }
    }

    /// The schema rows are selected from.
    pub const fn schema(&self) -> &'s Schema {
        self.schema
    }

    /// Whether the select joins other tables.
    pub fn is_joined(&self) -> bool {
        !self.joins.is_empty()
    }

    filter_methods!();

    /// Join `other`'s table on `left_field = right_field`.
    ///
    /// `left_field` resolves against the tables already in the query
    /// (qualify with `table.field` to pick a joined one); `right_field`
    /// resolves against `other`.
    #[must_use]
    pub fn join(mut self, kind: JoinKind, other: &'s Schema, left_field: &str, right_field: &str) -> Self {
        let left = resolve(&self.schemas(), left_field);
        let right = resolve(&[other], right_field.rsplit('.').next().unwrap_or(right_field));
        let duplicate = other.table().ok().is_some_and(|t| {
            self.schemas().iter().any(|s| s.table().ok() == Some(t))
        });
        match (left, right) {
            (_, _) if duplicate => self.defer(MappingError::Config(format!(
                "table `{}` is already part of the query",
                other.table().unwrap_or_default()
            ))),
            (Ok(left), Ok(right)) => self.joins.push(Join {
                kind,
                schema: other,
                left,
                right,
            }),
            (Err(e), _) | (_, Err(e)) => self.defer(e),
        }
        self
    }

    /// Restrict the selected columns to `fields`.
    #[must_use]
    pub fn columns<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let resolved: Result<Vec<_>, _> = fields
            .into_iter()
            .map(|f| resolve(&self.schemas(), f.as_ref()))
            .collect();
        match resolved {
            Ok(columns) => self.projection = Some(columns),
            Err(e) => self.defer(e),
        }
        self
    }

    /// Append an ORDER BY term.
    #[must_use]
    pub fn order_by(mut self, field: &str, order: Order) -> Self {
        match resolve(&self.schemas(), field) {
            Ok(column) => self.order.push((column, order)),
            Err(e) => self.defer(e),
        }
        self
    }

    /// Append a GROUP BY term.
    #[must_use]
    pub fn group_by(mut self, field: &str) -> Self {
        match resolve(&self.schemas(), field) {
            Ok(column) => self.group.push(column),
            Err(e) => self.defer(e),
        }
        self
    }

    /// Append `HAVING aggregate(field) op value`.
    ///
    /// Only the comparison operators are valid here.
    #[must_use]
    pub fn having(mut self, aggregate: Aggregate, field: &str, op: Operator, value: impl Into<SqlValue>) -> Self {
        match resolve(&self.schemas(), field) {
            Ok(column) => self.push_having(aggregate, Some(column), op, value.into()),
            Err(e) => self.defer(e),
        }
        self
    }

    /// Append `HAVING COUNT(*) op n`.
    #[must_use]
    pub fn having_count(mut self, op: Operator, n: i64) -> Self {
        self.push_having(Aggregate::Count, None, op, SqlValue::Int(n));
        self
    }

    /// Return at most `n` rows.
    #[must_use]
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(i64::try_from(n).unwrap_or(i64::MAX));
        self
    }

    /// Skip the first `n` rows.
    #[must_use]
    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(i64::try_from(n).unwrap_or(i64::MAX));
        self
    }

    /// Render the statement.
    ///
    /// Joined selects alias every column as `<table>__<column>`.
    ///
    /// # Errors
    ///
    /// Returns the first error recorded by a builder method, or a
    /// [`MappingError::MissingTable`] if the schema has no table.
    pub fn build(&self) -> Result<Statement, MappingError> {
        self.check()?;
        let qualified = self.is_joined();

        let mut buf = SqlBuf::new("SELECT ");
        let columns = self.output_columns()?;
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                buf.push(", ");
            }
            if self.is_bool(column) {
                buf.push("CAST(");
                column.write(&mut buf, qualified);
                buf.push(" AS INTEGER) AS ");
                buf.push_ident(&if qualified { column.alias() } else { column.column.clone() });
                continue;
            }
            column.write(&mut buf, qualified);
            if qualified {
                buf.push(" AS ");
                buf.push_ident(&column.alias());
            }
        }
        self.write_body(&mut buf)?;

        for (i, (column, order)) in self.order.iter().enumerate() {
            buf.push(if i == 0 { " ORDER BY " } else { ", " });
            column.write(&mut buf, qualified);
            buf.push(" ");
            buf.push(order.as_sql());
        }
        match (self.limit, self.offset) {
            (None, None) => {}
            (limit, offset) => {
                buf.push(" LIMIT ");
                buf.bind(SqlValue::Int(limit.unwrap_or(i64::MAX)))?;
                if let Some(offset) = offset {
                    buf.push(" OFFSET ");
                    buf.bind(SqlValue::Int(offset))?;
                }
            }
        }
        Ok(buf.finish())
    }

    /// Render a `COUNT(*)` over the same rows, ignoring projection,
    /// ordering, and paging.
    ///
    /// # Errors
    ///
    /// Same as [`Select::build`].
    pub fn build_count(&self) -> Result<Statement, MappingError> {
        self.check()?;
        if self.group.is_empty() && self.having.is_empty() {
            let mut buf = SqlBuf::new("SELECT COUNT(*)");
            self.write_body(&mut buf)?;
            return Ok(buf.finish());
        }
        let mut buf = SqlBuf::new("SELECT COUNT(*) FROM (SELECT 1");
        self.write_body(&mut buf)?;
        buf.push(") AS ");
        buf.push_ident("grouped");
        Ok(buf.finish())
    }

    fn check(&self) -> Result<(), MappingError> {
        if let Some(e) = &self.error {
            return Err(replay(e));
        }
        self.schema.table().map(|_| ())
    }

    /// FROM, joins, WHERE, GROUP BY, and HAVING.
    fn write_body(&self, buf: &mut SqlBuf) -> Result<(), MappingError> {
        let qualified = self.is_joined();
        buf.push(" FROM ");
        buf.push_ident(self.schema.table()?);
        for join in &self.joins {
            buf.push(" ");
            buf.push(join.kind.as_sql());
            buf.push(" ");
            buf.push_ident(join.schema.table()?);
            buf.push(" ON ");
            join.left.write(buf, true);
            buf.push(" = ");
            join.right.write(buf, true);
        }
        write_where(buf, &self.conditions, qualified)?;

        for (i, column) in self.group.iter().enumerate() {
            buf.push(if i == 0 { " GROUP BY " } else { ", " });
            column.write(buf, qualified);
        }
        for (i, having) in self.having.iter().enumerate() {
            buf.push(if i == 0 { " HAVING " } else { " AND " });
            buf.push(having.aggregate.as_sql());
            buf.push("(");
            match &having.column {
                Some(column) => column.write(buf, qualified),
                None => buf.push("*"),
            }
            buf.push(") ");
            buf.push(having.op.as_sql());
            buf.push(" ");
            buf.bind(having.value.clone())?;
        }
        Ok(())
    }

    fn output_columns(&self) -> Result<Vec<ColumnRef>, MappingError> {
        if let Some(projection) = &self.projection {
            return Ok(projection.clone());
        }
        let mut columns = Vec::new();
        for schema in self.schemas() {
            let table = schema.table()?;
            columns.extend(schema.column_names().map(|column| ColumnRef {
                table: table.to_owned(),
                column: column.to_owned(),
            }));
        }
        Ok(columns)
    }

    /// Whether `column` holds a bool-kind field; those are selected as 0/1
    /// integers.
    fn is_bool(&self, column: &ColumnRef) -> bool {
        self.schemas()
            .into_iter()
            .filter(|schema| schema.table().is_ok_and(|table| table == column.table))
            .flat_map(Schema::fields)
            .any(|field| field.column == column.column && field.kind == ColumnKind::Bool)
    }

    fn schemas(&self) -> Vec<&'s Schema> {
        std::iter::once(self.schema)
            .chain(self.joins.iter().map(|j| j.schema))
            .collect()
    }

    fn push_having(&mut self, aggregate: Aggregate, column: Option<ColumnRef>, op: Operator, value: SqlValue) {
        if !op.is_comparison() || matches!(value, SqlValue::List(_)) {
            self.defer(MappingError::InvalidOperator(format!("HAVING {op}")));
            return;
        }
        self.having.push(Having {
            aggregate,
            column,
            op,
            value,
        });
    }

    fn push_condition(mut self, field: &str, op: Operator, value: SqlValue) -> Self {
        match resolve(&self.schemas(), field).and_then(|column| Condition::new(column, op, value)) {
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

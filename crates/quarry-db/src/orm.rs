//! Typed ORM handle.
//!
//! An [`Orm<T>`] pairs the schema of one record type with a store executor
//! and the shared [`CacheTier`]. Reads go through the cache, mutations go
//! straight to the store.
//!
//! ```text
//! Select / Statement
//!     |
//!     +-- caching off, or inside a transaction --------------------+
//!     |                                                            v
//!     +-- key --> CacheTier::lookup --hit--> decode --> materialize --> records
//!                     | miss                   | undecodable: discard key
//!                     v                        v
//!                   store <--------------------+
//!                     |
//!                     +--> materialize --> records
//!                     +--> CacheTier::populate (background)
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use quarry_mapping::{
    Delete, MappingError, Record, RowSet, Schema, Select, SqlValue, Statement, insert_statement,
    materialize, materialize_first, split_joined, update_by_primary_key, update_statement,
};
use sqlx::AnyPool;

use crate::cache::{CacheStats, CacheTier, Tier};
use crate::error::DbError;
use crate::store::{Executor, TxState};
use crate::transaction::OrmTransaction;

/// Where a read's rows came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Executed against the store.
    Store,
    /// Served from a cache tier.
    Cache(Tier),
}

/// Result of a raw read: the statement that produced it, its rows, and
/// where the rows came from.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// The statement as executed (or as keyed in the cache).
    pub statement: Statement,
    /// Result rows.
    pub rows: RowSet,
    /// Store or cache.
    pub origin: Origin,
}

impl QueryResult {
    /// Materialize the rows into records described by `schema`.
    ///
    /// # Errors
    ///
    /// See [`quarry_mapping::materialize`].
    pub fn records<T: Record>(&self, schema: &Schema) -> Result<Vec<T>, DbError> {
        Ok(materialize(schema, &self.rows)?)
    }

    /// Whether the rows were served from a cache tier.
    pub const fn is_cached(&self) -> bool {
        matches!(self.origin, Origin::Cache(_))
    }
}

/// Typed handle for one record type.
///
/// Cheap to clone; clones share the schema, the cache, and the executor.
pub struct Orm<T: Record> {
    schema: Arc<Schema>,
    cache: Arc<CacheTier>,
    executor: Executor,
    use_cache: bool,
    invalidate_on_write: bool,
    record: PhantomData<fn() -> T>,
}

impl<T: Record> Clone for Orm<T> {
    fn clone(&self) -> Self {
        Self {
            schema: Arc::clone(&self.schema),
            cache: Arc::clone(&self.cache),
            executor: self.executor.clone(),
            use_cache: self.use_cache,
            invalidate_on_write: self.invalidate_on_write,
            record: PhantomData,
        }
    }
}

impl<T: Record> std::fmt::Debug for Orm<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orm")
            .field("record", &self.schema.record_name())
            .field("in_transaction", &self.executor.in_transaction())
            .field("use_cache", &self.use_cache)
            .finish_non_exhaustive()
    }
}

impl<T: Record> Orm<T> {
    pub(crate) const fn new(
        schema: Arc<Schema>,
        cache: Arc<CacheTier>,
        pool: AnyPool,
        invalidate_on_write: bool,
    ) -> Self {
        Self {
            schema,
            cache,
            executor: Executor::Pool(pool),
            use_cache: true,
            invalidate_on_write,
            record: PhantomData,
        }
    }

    fn bound_to(&self, state: TxState) -> Self {
        Self {
            executor: Executor::Transaction(state),
            ..self.clone()
        }
    }

    /// The schema of `T`.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The shared cache tier.
    pub const fn cache(&self) -> &Arc<CacheTier> {
        &self.cache
    }

    /// Current cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Whether pooled mutations drop the table's cached results.
    pub const fn invalidates_on_write(&self) -> bool {
        self.invalidate_on_write
    }

    /// Whether statements run inside a transaction.
    pub const fn is_transactional(&self) -> bool {
        self.executor.in_transaction()
    }

    /// A SELECT builder over `T`'s table.
    pub fn select(&self) -> Select<'_> {
        Select::new(&self.schema)
    }

    /// A DELETE builder over `T`'s table.
    pub fn delete_where(&self) -> Delete<'_> {
        Delete::new(&self.schema)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Every row of the table.
    pub async fn get_all(&self) -> Result<Vec<T>, DbError> {
        self.fetch(&self.select()).await
    }

    /// The row whose primary key equals `key`.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::MissingPrimaryKey`] if `T` has no primary key.
    pub async fn get_by_primary_key(&self, key: impl Into<SqlValue>) -> Result<Option<T>, DbError> {
        let pk = self.schema.primary_key()?;
        let select = self.select().filter_eq(&pk.name, key).limit(1);
        self.fetch_one(&select).await
    }

    /// Rows where `field` equals `value` (`IS NULL` for a null value).
    pub async fn get_by_field_equals(&self, field: &str, value: impl Into<SqlValue>) -> Result<Vec<T>, DbError> {
        self.fetch(&self.select().filter_eq(field, value)).await
    }

    /// Rows where `field` differs from `value` (`IS NOT NULL` for a null value).
    pub async fn get_by_field_not_equals(
        &self,
        field: &str,
        value: impl Into<SqlValue>,
    ) -> Result<Vec<T>, DbError> {
        self.fetch(&self.select().filter_ne(field, value)).await
    }

    /// Rows where `field > value`.
    pub async fn get_by_field_greater_than(
        &self,
        field: &str,
        value: impl Into<SqlValue>,
    ) -> Result<Vec<T>, DbError> {
        self.fetch(&self.select().filter_gt(field, value)).await
    }

    /// Rows where `field >= value`.
    pub async fn get_by_field_greater_or_equal(
        &self,
        field: &str,
        value: impl Into<SqlValue>,
    ) -> Result<Vec<T>, DbError> {
        self.fetch(&self.select().filter_ge(field, value)).await
    }

    /// Rows where `field < value`.
    pub async fn get_by_field_less_than(
        &self,
        field: &str,
        value: impl Into<SqlValue>,
    ) -> Result<Vec<T>, DbError> {
        self.fetch(&self.select().filter_lt(field, value)).await
    }

    /// Rows where `field <= value`.
    pub async fn get_by_field_less_or_equal(
        &self,
        field: &str,
        value: impl Into<SqlValue>,
    ) -> Result<Vec<T>, DbError> {
        self.fetch(&self.select().filter_le(field, value)).await
    }

    /// Rows where `field LIKE pattern`.
    pub async fn get_by_field_like(&self, field: &str, pattern: impl Into<SqlValue>) -> Result<Vec<T>, DbError> {
        self.fetch(&self.select().filter_like(field, pattern)).await
    }

    /// Rows where `field` is one of `values`.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::EmptyInList`] if `values` is empty.
    pub async fn get_by_field_in(&self, field: &str, values: impl Into<SqlValue>) -> Result<Vec<T>, DbError> {
        self.fetch(&self.select().filter_in(field, values)).await
    }

    /// Rows where `field BETWEEN low AND high`.
    pub async fn get_by_field_between(
        &self,
        field: &str,
        low: impl Into<SqlValue>,
        high: impl Into<SqlValue>,
    ) -> Result<Vec<T>, DbError> {
        self.fetch(&self.select().filter_between(field, low, high)).await
    }

    /// Rows where `field IS NULL`.
    pub async fn get_by_field_is_null(&self, field: &str) -> Result<Vec<T>, DbError> {
        self.fetch(&self.select().filter_is_null(field)).await
    }

    /// Rows where `field IS NOT NULL`.
    pub async fn get_by_field_is_not_null(&self, field: &str) -> Result<Vec<T>, DbError> {
        self.fetch(&self.select().filter_is_not_null(field)).await
    }

    /// Rows where `field <op> value`, with `op` one of `=`, `!=`, `>`,
    /// `>=`, `<`, `<=`, `LIKE`.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::InvalidOperator`] for any other operator,
    /// before anything is sent to the store.
    pub async fn get_by_field_compare(
        &self,
        field: &str,
        op: &str,
        value: impl Into<SqlValue>,
    ) -> Result<Vec<T>, DbError> {
        self.fetch(&self.select().filter_compare(field, op, value)).await
    }

    /// The first row where `field` equals `value`.
    pub async fn get_first_by_field_equals(
        &self,
        field: &str,
        value: impl Into<SqlValue>,
    ) -> Result<Option<T>, DbError> {
        self.fetch_one(&self.select().filter_eq(field, value).limit(1)).await
    }

    /// Run a SELECT built over `T`'s schema.
    pub async fn fetch(&self, select: &Select<'_>) -> Result<Vec<T>, DbError> {
        let stmt = select.build()?;
        self.read_with(&stmt, |rows, _| materialize(&self.schema, rows)).await
    }

    /// Run a SELECT and materialize only its first row.
    pub async fn fetch_one(&self, select: &Select<'_>) -> Result<Option<T>, DbError> {
        let stmt = select.build()?;
        self.read_with(&stmt, |rows, _| materialize_first(&self.schema, rows))
            .await
    }

    /// Run a joined SELECT and materialize each row as a `T` and a `U`.
    ///
    /// `other` is the schema joined in. The `U` side is `None` when every
    /// one of its columns is `NULL` (an unmatched LEFT JOIN row).
    ///
    /// Results are cached under `T`'s table.
    pub async fn fetch_joined<U: Record>(
        &self,
        select: &Select<'_>,
        other: &Schema,
    ) -> Result<Vec<(T, Option<U>)>, DbError> {
        let stmt = select.build()?;
        let own_table = self.schema.table()?;
        let other_table = other.table()?;
        self.read_with(&stmt, |rows, _| {
            let left = materialize::<T>(&self.schema, &split_joined(rows, own_table))?;
            let right_rows = split_joined(rows, other_table);
            let right = materialize::<U>(other, &right_rows)?;
            Ok(left
                .into_iter()
                .zip(right)
                .zip(&right_rows.rows)
                .map(|((l, r), cells)| (l, (!cells.iter().all(SqlValue::is_null)).then_some(r)))
                .collect())
        })
        .await
    }

    /// Number of rows the SELECT would return, ignoring paging.
    pub async fn count(&self, select: &Select<'_>) -> Result<u64, DbError> {
        let stmt = select.build_count()?;
        self.read_with(&stmt, |rows, _| {
            match rows.rows.first().and_then(|row| row.first()) {
                Some(SqlValue::Int(n)) => u64::try_from(*n)
                    .map_err(|e| MappingError::Decode(format!("negative row count {n}: {e}"))),
                other => Err(MappingError::Decode(format!("COUNT(*) returned {other:?}"))),
            }
        })
        .await
    }

    /// Run a raw statement through the cache.
    ///
    /// The result is keyed under `T`'s table, so table invalidation covers
    /// it.
    pub async fn query(&self, stmt: &Statement) -> Result<QueryResult, DbError> {
        self.read_with(stmt, |rows, origin| {
            Ok(QueryResult {
                statement: stmt.clone(),
                rows: rows.clone(),
                origin,
            })
        })
        .await
    }

    /// Cache key of `stmt`, or `None` when this read bypasses the cache.
    fn read_key(&self, stmt: &Statement) -> Result<Option<String>, DbError> {
        if !self.use_cache || self.executor.in_transaction() || !self.cache.is_enabled() {
            return Ok(None);
        }
        Ok(Some(self.cache.key_for(self.schema.table()?, stmt)?))
    }

    async fn read_with<R>(
        &self,
        stmt: &Statement,
        convert: impl Fn(&RowSet, Origin) -> Result<R, MappingError>,
    ) -> Result<R, DbError> {
        let key = self.read_key(stmt)?;

        if let Some(key) = key.as_deref() {
            if let Some(hit) = self.cache.lookup(key).await {
                let origin = Origin::Cache(hit.tier);
                match RowSet::from_bytes(&hit.payload).and_then(|rows| convert(&rows, origin)) {
                    Ok(result) => return Ok(result),
                    Err(e) => {
                        tracing::warn!(
                            record = self.schema.record_name(),
                            key,
                            error = %e,
                            "Cached payload could not be decoded, re-executing"
                        );
                        self.cache.discard(key).await;
                    }
                }
            }
        }

        let ticket = key.is_some().then(|| self.cache.ticket());
        let rows = self.executor.fetch(stmt).await?;
        self.cache.record_store_query();
        let result = convert(&rows, Origin::Store)?;
        if let (Some(key), Some(ticket)) = (key, ticket) {
            self.cache.populate(key, rows, ticket);
        }
        Ok(result)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert `record`. Returns the number of rows inserted.
    pub async fn insert(&self, record: &T) -> Result<u64, DbError> {
        let stmt = insert_statement(&self.schema, record)?;
        self.write(&stmt).await
    }

    /// Insert every record in one transaction; either all are inserted or
    /// none are.
    pub async fn insert_many(&self, records: &[T]) -> Result<u64, DbError> {
        let statements = records
            .iter()
            .map(|record| insert_statement(&self.schema, record))
            .collect::<Result<Vec<_>, _>>()?;
        if statements.is_empty() {
            return Ok(0);
        }

        if self.executor.in_transaction() {
            return self.execute_all(&statements).await;
        }
        let tx = self.begin().await?;
        match tx.execute_all(&statements).await {
            Ok(inserted) => {
                tx.commit().await?;
                Ok(inserted)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback after failed batch insert failed");
                }
                Err(e)
            }
        }
    }

    async fn execute_all(&self, statements: &[Statement]) -> Result<u64, DbError> {
        let mut total: u64 = 0;
        for stmt in statements {
            total = total.saturating_add(self.executor.execute(stmt).await?);
        }
        Ok(total)
    }

    /// Update `record`'s row, located by its primary key.
    pub async fn update(&self, record: &T) -> Result<u64, DbError> {
        let stmt = update_by_primary_key(&self.schema, record)?;
        self.write(&stmt).await
    }

    /// Update rows where `field` equals `value`, setting every other field
    /// from `record`.
    pub async fn update_by(&self, record: &T, field: &str, value: impl Into<SqlValue>) -> Result<u64, DbError> {
        let stmt = update_statement(&self.schema, record, field, value.into())?;
        self.write(&stmt).await
    }

    /// Delete the row whose primary key equals `key`.
    pub async fn delete_by_primary_key(&self, key: impl Into<SqlValue>) -> Result<u64, DbError> {
        let pk = self.schema.primary_key()?;
        self.delete(&self.delete_where().filter_eq(&pk.name, key)).await
    }

    /// Delete rows where `field` equals `value`.
    pub async fn delete_by_field_equals(&self, field: &str, value: impl Into<SqlValue>) -> Result<u64, DbError> {
        self.delete(&self.delete_where().filter_eq(field, value)).await
    }

    /// Delete rows where `field <op> value`; see
    /// [`Orm::get_by_field_compare`] for the accepted operators.
    pub async fn delete_by_field_compare(
        &self,
        field: &str,
        op: &str,
        value: impl Into<SqlValue>,
    ) -> Result<u64, DbError> {
        self.delete(&self.delete_where().filter_compare(field, op, value)).await
    }

    /// Delete rows where `field` is one of `values`.
    pub async fn delete_by_field_in(&self, field: &str, values: impl Into<SqlValue>) -> Result<u64, DbError> {
        self.delete(&self.delete_where().filter_in(field, values)).await
    }

    /// Run a DELETE built over `T`'s schema.
    pub async fn delete(&self, delete: &Delete<'_>) -> Result<u64, DbError> {
        let stmt = delete.build()?;
        self.write(&stmt).await
    }

    /// Run a raw statement against the store, bypassing the cache.
    pub async fn execute(&self, stmt: &Statement) -> Result<u64, DbError> {
        self.write(stmt).await
    }

    async fn write(&self, stmt: &Statement) -> Result<u64, DbError> {
        let affected = self.executor.execute(stmt).await?;
        if self.invalidate_on_write && !self.executor.in_transaction() {
            self.invalidate_after_write().await;
        }
        Ok(affected)
    }

    pub(crate) async fn invalidate_after_write(&self) {
        if let Err(e) = self.invalidate_table().await {
            tracing::warn!(
                record = self.schema.record_name(),
                error = %e,
                "Cache invalidation after write failed"
            );
        }
    }

    // =========================================================================
    // Cache control
    // =========================================================================

    /// Drop the cached result of `stmt` from both tiers.
    pub async fn invalidate_query(&self, stmt: &Statement) -> Result<(), DbError> {
        let key = self.cache.key_for(self.schema.table()?, stmt)?;
        self.cache.invalidate_key(&key).await
    }

    /// Drop the cached result of `select` from both tiers.
    pub async fn invalidate_select(&self, select: &Select<'_>) -> Result<(), DbError> {
        self.invalidate_query(&select.build()?).await
    }

    /// Drop every cached result of `T`'s table from both tiers.
    pub async fn invalidate_table(&self) -> Result<usize, DbError> {
        let prefix = self.cache.table_prefix(self.schema.table()?);
        self.cache.invalidate_prefix(&prefix).await
    }

    /// Drop every cached key starting with `prefix` from both tiers.
    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<usize, DbError> {
        self.cache.invalidate_prefix(prefix).await
    }

    /// Clear the whole cache (the networked tier only within the namespace).
    pub async fn reset_cache(&self) -> Result<(), DbError> {
        self.cache.reset().await
    }

    /// A handle whose reads never touch the cache.
    #[must_use]
    pub fn without_cache(&self) -> Self {
        Self {
            use_cache: false,
            ..self.clone()
        }
    }

    /// Wait for background cache population to finish.
    pub async fn settle_cache(&self) {
        self.cache.settle().await;
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Begin a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if this handle is already inside a
    /// transaction, or [`DbError::Sql`] if the store refuses to begin.
    pub async fn begin(&self) -> Result<OrmTransaction<T>, DbError> {
        let state = match &self.executor {
            Executor::Pool(pool) => TxState::begin(pool).await?,
            Executor::Transaction(_) => {
                return Err(DbError::Config("nested transactions are not supported".to_owned()));
            }
        };
        Ok(OrmTransaction::new(self.bound_to(state.clone()), state))
    }

    /// Run `work` inside a transaction.
    ///
    /// Commits when `work` returns `Ok`, rolls back when it returns `Err`,
    /// and rolls back before resuming the panic when it panics. A
    /// transaction that `work` closed itself is left alone.
    pub async fn transaction<R, F, Fut>(&self, work: F) -> Result<R, DbError>
    where
        F: FnOnce(OrmTransaction<T>) -> Fut,
        Fut: Future<Output = Result<R, DbError>>,
    {
        let tx = self.begin().await?;
        let handle = tx.clone();
        let outcome = AssertUnwindSafe(async move { work(handle).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                if tx.is_open().await {
                    tx.commit().await?;
                }
                Ok(value)
            }
            Ok(Err(e)) => {
                tx.rollback_if_open("unit of work failed").await;
                Err(e)
            }
            Err(panic) => {
                tx.rollback_if_open("unit of work panicked").await;
                std::panic::resume_unwind(panic)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use quarry_mapping::{RecordMeta, TypeRegistry};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::cache::CacheConfig;
    use crate::settings::StoreConfig;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: i64,
        body: String,
    }

    impl Record for Note {
        fn meta() -> RecordMeta {
            RecordMeta::new("notes").primary_key("id")
        }
    }

    async fn orm() -> Orm<Note> {
        let pool = crate::store::connect(&StoreConfig::for_url("sqlite::memory:").unwrap()).await.unwrap();
        let schema = Arc::new(Schema::load::<Note>(Arc::new(TypeRegistry::new())).unwrap());
        let cache = Arc::new(CacheTier::new(CacheConfig::default(), None));
        let orm = Orm::new(schema, cache, pool, false);
        orm.execute(&Statement::new("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)", vec![]))
            .await
            .unwrap();
        orm
    }

    #[tokio::test]
    async fn second_read_is_served_from_memory() {
        let orm = orm().await;
        orm.insert(&Note { id: 1, body: "a".to_owned() }).await.unwrap();

        let stmt = orm.select().build().unwrap();
        let first = orm.query(&stmt).await.unwrap();
        assert_eq!(first.origin, Origin::Store);
        orm.settle_cache().await;
        let second = orm.query(&stmt).await.unwrap();
        assert_eq!(second.origin, Origin::Cache(Tier::Memory));
        assert!(second.is_cached());
        assert_eq!(second.rows, first.rows);
        assert_eq!(second.records::<Note>(orm.schema()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn without_cache_always_hits_the_store() {
        let orm = orm().await;
        let plain = orm.without_cache();
        plain.get_all().await.unwrap();
        plain.get_all().await.unwrap();
        plain.settle_cache().await;
        let stats = orm.cache_stats();
        assert_eq!(stats.store_queries, 2);
        assert_eq!(stats.misses, 0);
        assert!(orm.cache().memory().unwrap().is_empty().await);
    }

    #[tokio::test]
    async fn undecodable_payload_falls_back_to_the_store() {
        let orm = orm().await;
        orm.insert(&Note { id: 1, body: "a".to_owned() }).await.unwrap();
        let stmt = orm.select().build().unwrap();
        let key = orm.cache().key_for("notes", &stmt).unwrap();
        orm.cache()
            .memory()
            .unwrap()
            .set(&key, Arc::from(&b"not a row set"[..]), crate::cache::Ttl::Never)
            .await;

        let notes = orm.get_all().await.unwrap();
        assert_eq!(notes, vec![Note { id: 1, body: "a".to_owned() }]);
        assert_eq!(orm.cache_stats().decode_fallbacks, 1);
        orm.settle_cache().await;
        assert_eq!(orm.query(&stmt).await.unwrap().origin, Origin::Cache(Tier::Memory));
    }

    #[tokio::test]
    async fn invalid_operator_never_reaches_the_store() {
        let orm = orm().await;
        let err = orm.get_by_field_compare("id", "; DROP TABLE notes", 1).await.unwrap_err();
        assert!(matches!(err, DbError::Mapping(MappingError::InvalidOperator(_))));
        let err = orm.delete_by_field_compare("id", "<>", 1).await.unwrap_err();
        assert!(matches!(err, DbError::Mapping(MappingError::InvalidOperator(_))));
        assert_eq!(orm.cache_stats().store_queries, 0);
    }

    #[tokio::test]
    async fn count_respects_filters() {
        let orm = orm().await;
        let notes: Vec<Note> = (1..=5).map(|id| Note { id, body: format!("n{id}") }).collect();
        assert_eq!(orm.insert_many(&notes).await.unwrap(), 5);
        assert_eq!(orm.count(&orm.select()).await.unwrap(), 5);
        assert_eq!(orm.count(&orm.select().filter_gt("id", 3).limit(1)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn nested_begin_is_refused() {
        let orm = orm().await;
        let tx = orm.begin().await.unwrap();
        assert!(tx.is_transactional());
        assert!(matches!(tx.begin().await, Err(DbError::Config(_))));
        tx.rollback().await.unwrap();
    }
}

//! Store connection and statement execution.
//!
//! Uses [`sqlx`]'s `Any` driver so one code path serves `PostgreSQL` and
//! `SQLite`. Statements always arrive fully parameterized from the
//! builders; arguments are bound positionally and never spliced into SQL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use quarry_mapping::{ColumnKind, MappingError, RowSet, SqlValue, Statement};
use sqlx::any::{AnyArguments, AnyConnectOptions, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Column, Row, Transaction, ValueRef};
use tokio::sync::Mutex;

use crate::error::DbError;
use crate::settings::StoreConfig;

type AnyQuery<'q> = Query<'q, Any, AnyArguments<'q>>;

/// Open a connection pool shaped by `config`.
///
/// # Errors
///
/// Returns [`DbError::Config`] if the URL cannot be parsed.
/// Returns [`DbError::Sql`] if the connection fails.
pub async fn connect(config: &StoreConfig) -> Result<AnyPool, DbError> {
    sqlx::any::install_default_drivers();

    let connect_options: AnyConnectOptions = config
        .url()
        .parse()
        .map_err(|e: sqlx::Error| DbError::Config(format!("Invalid database URL: {e}")))?;

    let pool = AnyPoolOptions::new()
        .max_connections(config.pool_size())
        .min_connections(config.min_connections())
        .acquire_timeout(config.acquire_timeout())
        .idle_timeout(config.idle_timeout())
        .max_lifetime(config.max_lifetime())
        .connect_with(connect_options)
        .await?;

    tracing::info!(
        backend = config.backend().name(),
        pool_size = config.pool_size(),
        "Connected to store"
    );

    Ok(pool)
}

/// An open transaction shared by the handles derived from it.
#[derive(Clone)]
pub(crate) struct TxState {
    slot: Arc<Mutex<Option<Transaction<'static, Any>>>>,
    dirty: Arc<AtomicBool>,
}

impl TxState {
    pub(crate) async fn begin(pool: &AnyPool) -> Result<Self, DbError> {
        let tx = pool.begin().await?;
        tracing::debug!("Transaction started");
        Ok(Self {
            slot: Arc::new(Mutex::new(Some(tx))),
            dirty: Arc::new(AtomicBool::new(false)),
        })
    }

    pub(crate) async fn is_open(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Whether any statement wrote through this transaction.
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) async fn commit(&self) -> Result<(), DbError> {
        let tx = self.slot.lock().await.take().ok_or(DbError::TransactionClosed)?;
        tx.commit().await?;
        tracing::debug!("Transaction committed");
        Ok(())
    }

    pub(crate) async fn rollback(&self) -> Result<(), DbError> {
        let tx = self.slot.lock().await.take().ok_or(DbError::TransactionClosed)?;
        tx.rollback().await?;
        tracing::debug!("Transaction rolled back");
        Ok(())
    }

    /// Whether the transaction is still open, without waiting for the lock.
    /// A locked slot counts as open.
    pub(crate) fn try_is_open(&self) -> bool {
        self.slot.try_lock().map_or(true, |slot| slot.is_some())
    }
}

impl std::fmt::Debug for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxState")
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}

/// Where statements run: the pool, or an open transaction.
#[derive(Debug, Clone)]
pub(crate) enum Executor {
    Pool(AnyPool),
    Transaction(TxState),
}

impl Executor {
    pub(crate) const fn in_transaction(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }

    /// Run a row-returning statement.
    pub(crate) async fn fetch(&self, stmt: &Statement) -> Result<RowSet, DbError> {
        tracing::debug!(sql = stmt.sql.as_str(), args = stmt.args.len(), "Fetching");
        let query = build_query(stmt)?;
        let rows = match self {
            Self::Pool(pool) => query.fetch_all(pool).await?,
            Self::Transaction(state) => {
                let mut slot = state.slot.lock().await;
                let tx = slot.as_mut().ok_or(DbError::TransactionClosed)?;
                query.fetch_all(&mut **tx).await?
            }
        };
        to_row_set(&rows)
    }

    /// Run a statement and return the number of affected rows.
    pub(crate) async fn execute(&self, stmt: &Statement) -> Result<u64, DbError> {
        tracing::debug!(sql = stmt.sql.as_str(), args = stmt.args.len(), "Executing");
        let query = build_query(stmt)?;
        let result = match self {
            Self::Pool(pool) => query.execute(pool).await?,
            Self::Transaction(state) => {
                let mut slot = state.slot.lock().await;
                let tx = slot.as_mut().ok_or(DbError::TransactionClosed)?;
                let result = query.execute(&mut **tx).await?;
                state.dirty.store(true, Ordering::Release);
                result
            }
        };
        Ok(result.rows_affected())
    }
}

fn build_query(stmt: &Statement) -> Result<AnyQuery<'_>, DbError> {
    stmt.args
        .iter()
        .try_fold(sqlx::query::<Any>(&stmt.sql), bind)
}

fn bind<'q>(query: AnyQuery<'q>, value: &SqlValue) -> Result<AnyQuery<'q>, DbError> {
    Ok(match value {
        SqlValue::Null(kind) => match kind {
            ColumnKind::Bool => query.bind(None::<bool>),
            ColumnKind::Integer => query.bind(None::<i64>),
            ColumnKind::Float => query.bind(None::<f64>),
            ColumnKind::Text | ColumnKind::Json => query.bind(None::<String>),
            ColumnKind::Bytes => query.bind(None::<Vec<u8>>),
        },
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Text(s) => query.bind(s.clone()),
        SqlValue::Bytes(b) => query.bind(b.clone()),
        SqlValue::List(_) => {
            return Err(MappingError::Encode(
                "a list can only be bound as the argument of an IN condition".to_owned(),
            )
            .into());
        }
    })
}

fn to_row_set(rows: &[AnyRow]) -> Result<RowSet, DbError> {
    let Some(first) = rows.first() else {
        return Ok(RowSet::default());
    };
    let mut set = RowSet::new(first.columns().iter().map(|c| c.name().to_owned()));
    for row in rows {
        let cells = (0..row.len())
            .map(|index| decode_cell(row, index))
            .collect::<Result<Vec<_>, _>>()?;
        set.push_row(cells)?;
    }
    Ok(set)
}

fn decode_cell(row: &AnyRow, index: usize) -> Result<SqlValue, DbError> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(SqlValue::NULL);
    }
    if let Ok(b) = row.try_get::<bool, _>(index) {
        return Ok(SqlValue::Bool(b));
    }
    if let Ok(i) = row.try_get::<i64, _>(index) {
        return Ok(SqlValue::Int(i));
    }
    if let Ok(f) = row.try_get::<f64, _>(index) {
        return Ok(SqlValue::Float(f));
    }
    if let Ok(s) = row.try_get::<String, _>(index) {
        return Ok(SqlValue::Text(s));
    }
    if let Ok(b) = row.try_get::<Vec<u8>, _>(index) {
        return Ok(SqlValue::Bytes(b));
    }
    let column = row.columns().get(index).map_or("?", |c| c.name());
    Err(MappingError::Decode(format!("column `{column}` has a type the store driver cannot decode")).into())
}

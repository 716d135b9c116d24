//! Transaction-bound ORM handles.
//!
//! [`OrmTransaction`] dereferences to an [`Orm`] whose statements run on
//! the transaction's connection. Reads through it bypass the cache, so
//! uncommitted rows are never published to either tier.

use std::ops::Deref;
use std::sync::Arc;

use quarry_mapping::Record;

use crate::error::DbError;
use crate::orm::Orm;
use crate::store::TxState;

/// An open transaction plus a handle routed through it.
///
/// Clones share the same transaction. Dropping the last clone while the
/// transaction is still open rolls it back and logs a warning.
pub struct OrmTransaction<T: Record> {
    orm: Orm<T>,
    state: TxState,
    handles: Arc<()>,
}

impl<T: Record> OrmTransaction<T> {
    pub(crate) fn new(orm: Orm<T>, state: TxState) -> Self {
        Self {
            orm,
            state,
            handles: Arc::new(()),
        }
    }

    /// Whether the transaction has not been committed or rolled back.
    pub async fn is_open(&self) -> bool {
        self.state.is_open().await
    }

    /// Commit the transaction.
    ///
    /// With `invalidate_on_write` enabled, the table's cached results are
    /// dropped once a transaction that wrote commits.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::TransactionClosed`] if it was already committed or
    /// rolled back, or [`DbError::Sql`] if the commit fails.
    pub async fn commit(&self) -> Result<(), DbError> {
        self.state.commit().await?;
        if self.state.is_dirty() && self.orm.invalidates_on_write() {
            self.orm.invalidate_after_write().await;
        }
        Ok(())
    }

    /// Roll the transaction back.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::TransactionClosed`] if it was already committed or
    /// rolled back, or [`DbError::Sql`] if the rollback fails.
    pub async fn rollback(&self) -> Result<(), DbError> {
        self.state.rollback().await
    }

    pub(crate) async fn rollback_if_open(&self, reason: &str) {
        if !self.is_open().await {
            return;
        }
        match self.rollback().await {
            Ok(()) => tracing::debug!(reason, "Transaction rolled back"),
            Err(e) => tracing::warn!(reason, error = %e, "Transaction rollback failed"),
        }
    }
}

impl<T: Record> Deref for OrmTransaction<T> {
    type Target = Orm<T>;

    fn deref(&self) -> &Self::Target {
        &self.orm
    }
}

impl<T: Record> Clone for OrmTransaction<T> {
    fn clone(&self) -> Self {
        Self {
            orm: self.orm.clone(),
            state: self.state.clone(),
            handles: Arc::clone(&self.handles),
        }
    }
}

impl<T: Record> std::fmt::Debug for OrmTransaction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrmTransaction")
            .field("orm", &self.orm)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<T: Record> Drop for OrmTransaction<T> {
    fn drop(&mut self) {
        if Arc::strong_count(&self.handles) == 1 && self.state.try_is_open() {
            tracing::warn!(
                record = self.orm.schema().record_name(),
                "Transaction dropped while open; it will be rolled back"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use quarry_mapping::{RecordMeta, Statement};
    use serde::{Deserialize, Serialize};

    use crate::database::Database;

    use super::*;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: i64,
        label: String,
    }

    impl Record for Item {
        fn meta() -> RecordMeta {
            RecordMeta::new("items").primary_key("id")
        }
    }

    async fn setup() -> Orm<Item> {
        let db = Database::connect_url("sqlite::memory:").await.unwrap();
        let orm = db.orm::<Item>().unwrap();
        orm.execute(&Statement::new("CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)", vec![]))
            .await
            .unwrap();
        orm
    }

    fn item(id: i64) -> Item {
        Item {
            id,
            label: format!("item {id}"),
        }
    }

    #[tokio::test]
    async fn commit_publishes_rows() {
        let orm = setup().await;
        let tx = orm.begin().await.unwrap();
        tx.insert(&item(1)).await.unwrap();
        assert_eq!(tx.get_all().await.unwrap(), vec![item(1)]);
        tx.commit().await.unwrap();
        assert!(!tx.is_open().await);
        assert_eq!(orm.get_all().await.unwrap(), vec![item(1)]);
    }

    #[tokio::test]
    async fn rollback_discards_rows() {
        let orm = setup().await;
        let tx = orm.begin().await.unwrap();
        tx.insert(&item(1)).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(orm.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_close_is_an_error() {
        let orm = setup().await;
        let tx = orm.begin().await.unwrap();
        tx.commit().await.unwrap();
        assert!(matches!(tx.commit().await, Err(DbError::TransactionClosed)));
        assert!(matches!(tx.rollback().await, Err(DbError::TransactionClosed)));
        assert!(matches!(tx.insert(&item(2)).await, Err(DbError::TransactionClosed)));
    }

    #[tokio::test]
    async fn reads_inside_a_transaction_bypass_the_cache() {
        let orm = setup().await;
        let tx = orm.begin().await.unwrap();
        tx.get_all().await.unwrap();
        tx.get_all().await.unwrap();
        tx.rollback().await.unwrap();
        orm.settle_cache().await;
        let stats = orm.cache_stats();
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.populations, 0);
        assert_eq!(stats.store_queries, 2);
    }
}

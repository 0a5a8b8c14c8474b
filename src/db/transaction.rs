//! Ambient transactions.
//!
//! A transaction opened by `Database::run_in_transaction` is wrapped in an
//! [`AmbientTransaction`] and attached to the caller's context. The sqlx
//! transaction lives in a mutex-guarded slot: statements issued through the
//! context lock it in turn, and finishing the block empties the slot so a
//! leaked context cannot reach a finished transaction.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, TransactionInfo};
use chrono::{DateTime, Utc};
use sqlx::{MySql, Postgres, Sqlite, Transaction};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Database-specific transaction wrapper.
pub enum DbTransaction {
    MySql(Transaction<'static, MySql>),
    Postgres(Transaction<'static, Postgres>),
    SQLite(Transaction<'static, Sqlite>),
}

impl DbTransaction {
    /// Get the database type for this transaction.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbTransaction::MySql(_) => DatabaseType::MySQL,
            DbTransaction::Postgres(_) => DatabaseType::PostgreSQL,
            DbTransaction::SQLite(_) => DatabaseType::SQLite,
        }
    }

    pub async fn commit(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::SQLite(tx) => tx.commit().await.map_err(DbError::from),
        }
    }

    pub async fn rollback(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::SQLite(tx) => tx.rollback().await.map_err(DbError::from),
        }
    }
}

impl std::fmt::Debug for DbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DbTransaction").field(&self.db_type()).finish()
    }
}

/// A transaction carried by a [`Context`](crate::context::Context).
pub struct AmbientTransaction {
    id: String,
    db_type: DatabaseType,
    started_at: DateTime<Utc>,
    slot: Mutex<Option<DbTransaction>>,
    savepoints: AtomicU32,
}

impl AmbientTransaction {
    pub(crate) fn new(tx: DbTransaction) -> Self {
        let id = generate_transaction_id();
        let db_type = tx.db_type();
        info!(transaction_id = %id, db_type = %db_type, "Transaction started");
        Self {
            id,
            db_type,
            started_at: Utc::now(),
            slot: Mutex::new(Some(tx)),
            savepoints: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    /// Snapshot of this transaction's metadata.
    pub async fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.id.clone(),
            database_type: self.db_type,
            started_at: self.started_at,
            savepoints: self.savepoints.load(Ordering::Relaxed),
            active: self.slot.lock().await.is_some(),
        }
    }

    /// Lock the transaction for one statement. Fails once the transaction
    /// has been committed or rolled back.
    pub(crate) async fn lock(&self) -> DbResult<TransactionLock<'_>> {
        let guard = self.slot.lock().await;
        if guard.is_none() {
            return Err(DbError::transaction(
                "Transaction is no longer active",
                &self.id,
            ));
        }
        Ok(TransactionLock { guard })
    }

    /// Name for the next nested block's savepoint.
    pub(crate) fn next_savepoint(&self) -> String {
        let seq = self.savepoints.fetch_add(1, Ordering::Relaxed) + 1;
        format!("sp_{seq}")
    }

    pub(crate) async fn commit(&self) -> DbResult<()> {
        let tx = self.take().await?;
        tx.commit().await?;
        debug!(transaction_id = %self.id, "Transaction committed");
        Ok(())
    }

    pub(crate) async fn rollback(&self) -> DbResult<()> {
        let tx = self.take().await?;
        tx.rollback().await?;
        debug!(transaction_id = %self.id, "Transaction rolled back");
        Ok(())
    }

    async fn take(&self) -> DbResult<DbTransaction> {
        self.slot.lock().await.take().ok_or_else(|| {
            DbError::transaction("Transaction is no longer active", &self.id)
        })
    }
}

impl std::fmt::Debug for AmbientTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmbientTransaction")
            .field("id", &self.id)
            .field("db_type", &self.db_type)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a live transaction for the duration of one statement.
pub(crate) struct TransactionLock<'a> {
    guard: MutexGuard<'a, Option<DbTransaction>>,
}

impl TransactionLock<'_> {
    pub(crate) fn get(&mut self) -> DbResult<&mut DbTransaction> {
        self.guard
            .as_mut()
            .ok_or_else(|| DbError::internal("transaction slot emptied while locked"))
    }
}

fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_format() {
        let id = generate_transaction_id();
        assert!(id.starts_with("tx_"));
        assert_eq!(id.len(), 35);
        assert_ne!(id, generate_transaction_id());
    }

    #[tokio::test]
    async fn test_finished_transaction_rejects_statements() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let tx = pool.begin().await.unwrap();
        let ambient = AmbientTransaction::new(DbTransaction::SQLite(tx));

        assert!(ambient.info().await.active);
        ambient.commit().await.unwrap();
        assert!(!ambient.info().await.active);

        let err = ambient.lock().await.err().unwrap();
        assert!(matches!(err, DbError::Transaction { .. }));
        assert!(ambient.rollback().await.is_err());
    }

    #[tokio::test]
    async fn test_savepoint_names_increase() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let tx = pool.begin().await.unwrap();
        let ambient = AmbientTransaction::new(DbTransaction::SQLite(tx));
        assert_eq!(ambient.next_savepoint(), "sp_1");
        assert_eq!(ambient.next_savepoint(), "sp_2");
        assert_eq!(ambient.info().await.savepoints, 2);
        ambient.rollback().await.unwrap();
    }
}

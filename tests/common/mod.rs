//! Shared helpers for integration tests.

#![allow(dead_code)]

use ambient_db::{ConnectionSettings, Context, Database, QueryParam};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A file-backed SQLite database plus a migrations directory, both removed
/// when dropped.
pub struct TestDb {
    pub db: Database,
    pub dir: TempDir,
}

impl TestDb {
    pub fn migrations_dir(&self) -> PathBuf {
        self.dir.path().join("migrations")
    }

    pub fn write_migration(&self, file_name: &str, sql: &str) {
        write_migration(&self.migrations_dir(), file_name, sql);
    }

    /// Row count of `table`, read on the pool.
    pub async fn count(&self, table: &str) -> i64 {
        count_rows(&self.db, &Context::background(), table).await
    }

    /// Whether `table` exists, read on the pool.
    pub async fn table_exists(&self, table: &str) -> bool {
        let rows = self
            .db
            .fetch_all(
                &Context::background(),
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
                &[QueryParam::from(table)],
            )
            .await
            .unwrap();
        !rows.is_empty()
    }
}

/// Connect to a fresh SQLite file with room for concurrent connections.
pub async fn sqlite_db() -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");
    let migrations = dir.path().join("migrations");
    std::fs::create_dir(&migrations).unwrap();

    let settings = ConnectionSettings::new(format!("sqlite://{}?mode=rwc", path.display()))
        .unwrap()
        .with_pool_size(4)
        .with_migrations_dir(migrations);
    let db = Database::connect(settings).await.unwrap();
    TestDb { db, dir }
}

/// Connect and create an `accounts` table.
pub async fn sqlite_db_with_accounts() -> TestDb {
    let test = sqlite_db().await;
    test.db
        .exec(
            &Context::background(),
            "CREATE TABLE accounts (id INTEGER PRIMARY KEY, owner TEXT NOT NULL, balance INTEGER NOT NULL)",
            &[],
        )
        .await
        .unwrap();
    test
}

pub fn write_migration(dir: &Path, file_name: &str, sql: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(file_name), sql).unwrap();
}

pub async fn count_rows(db: &Database, ctx: &Context, table: &str) -> i64 {
    let rows = db
        .fetch_all(ctx, &format!("SELECT COUNT(*) AS n FROM {table}"), &[])
        .await
        .unwrap();
    rows[0]["n"].as_i64().unwrap()
}

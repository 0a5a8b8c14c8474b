//! Schema migrations.
//!
//! Versions applied so far are recorded in the `schema_migrations` table.
//! [`Migrator::migrate`] creates that table if needed and applies every
//! pending script in one transaction: either all of them land or none do.
//!
//! MySQL commits DDL implicitly, so on MySQL a failing script can leave the
//! statements before it applied.

mod discovery;

pub use discovery::{MigrationScript, discover};

use crate::context::Context;
use crate::db::Database;
use crate::db::model::rewrite_placeholders;
use crate::error::DbError;
use crate::models::{DatabaseType, QueryParam};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Bookkeeping table holding one row per applied version.
pub const MIGRATIONS_TABLE: &str = "schema_migrations";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("table {0} already exists")]
    AlreadyInitialized(String),

    #[error("failed to read migrations directory {}: {source}", .path.display())]
    Discovery {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid migration file name: {0} (expected <version>_<name>.up.sql or .down.sql)")]
    InvalidFileName(String),

    #[error("duplicate migration version {0}")]
    DuplicateVersion(i64),

    #[error("migration {0} has a down script but no up script")]
    MissingUp(i64),

    #[error("migration {0} has no down script")]
    MissingDown(i64),

    #[error("migration {version}_{name} failed: {source}")]
    Script {
        version: i64,
        name: String,
        source: Box<DbError>,
    },

    #[error(transparent)]
    Database(Box<DbError>),
}

impl MigrationError {
    pub fn is_already_initialized(&self) -> bool {
        matches!(self, Self::AlreadyInitialized(_))
    }
}

impl From<DbError> for MigrationError {
    fn from(err: DbError) -> Self {
        Self::Database(Box::new(err))
    }
}

/// Migration commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationCommand {
    /// Create the bookkeeping table.
    Init,
    /// Apply every pending version.
    Up,
    /// Revert the latest version.
    Down,
    /// Report the current version.
    Version,
}

/// Versions before and after a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub old_version: i64,
    pub new_version: i64,
    /// Versions applied (or reverted, for a rollback) in order.
    pub applied: Vec<i64>,
}

impl MigrationReport {
    pub fn is_up_to_date(&self) -> bool {
        self.old_version == self.new_version
    }
}

/// Runs the scripts of one migrations directory.
#[derive(Debug, Clone)]
pub struct Migrator {
    dir: PathBuf,
}

impl Migrator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn discover(&self) -> Result<Vec<MigrationScript>, MigrationError> {
        discover(&self.dir)
    }

    /// Initialize if needed and apply all pending scripts in one transaction.
    pub async fn migrate(
        &self,
        db: &Database,
        ctx: &Context,
    ) -> Result<MigrationReport, MigrationError> {
        let scripts = self.discover()?;

        let report = db
            .run_in_transaction(ctx, |ctx, db| async move {
                match self.init(&db, &ctx).await {
                    Err(err) if !err.is_already_initialized() => return Err(err),
                    _ => {}
                }
                self.up(&db, &ctx, &scripts).await
            })
            .await?;

        if report.is_up_to_date() {
            info!(version = report.new_version, "database schema up to date");
        } else {
            info!(
                from = report.old_version,
                to = report.new_version,
                "database schema migrated"
            );
        }
        Ok(report)
    }

    /// Revert the latest applied version in one transaction.
    pub async fn rollback(
        &self,
        db: &Database,
        ctx: &Context,
    ) -> Result<MigrationReport, MigrationError> {
        let scripts = self.discover()?;

        let report = db
            .run_in_transaction(ctx, |ctx, db| async move {
                self.down(&db, &ctx, &scripts).await
            })
            .await?;

        info!(
            from = report.old_version,
            to = report.new_version,
            "database schema rolled back"
        );
        Ok(report)
    }

    /// Run a single command on the context's route. Returns the versions
    /// before and after.
    pub async fn run(
        &self,
        db: &Database,
        ctx: &Context,
        command: MigrationCommand,
    ) -> Result<(i64, i64), MigrationError> {
        let report = match command {
            MigrationCommand::Init => {
                self.init(db, ctx).await?;
                MigrationReport::default()
            }
            MigrationCommand::Up => self.up(db, ctx, &self.discover()?).await?,
            MigrationCommand::Down => self.down(db, ctx, &self.discover()?).await?,
            MigrationCommand::Version => {
                let version = self.current_version(db, ctx).await?;
                MigrationReport {
                    old_version: version,
                    new_version: version,
                    applied: Vec::new(),
                }
            }
        };
        Ok((report.old_version, report.new_version))
    }

    /// Latest applied version; 0 when nothing was applied or the bookkeeping
    /// table does not exist.
    pub async fn current_version(&self, db: &Database, ctx: &Context) -> Result<i64, MigrationError> {
        if !table_exists(db, ctx).await? {
            return Ok(0);
        }
        let sql = format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}");
        let version = db.fetch_i64(ctx, "migrate", &sql, &[]).await?;
        Ok(version.unwrap_or(0))
    }

    async fn init(&self, db: &Database, ctx: &Context) -> Result<(), MigrationError> {
        // Probe first: a failed CREATE would abort a PostgreSQL transaction
        if table_exists(db, ctx).await? {
            return Err(MigrationError::AlreadyInitialized(MIGRATIONS_TABLE.to_string()));
        }
        db.exec(ctx, create_table_sql(db.database_type()), &[]).await?;
        info!(table = MIGRATIONS_TABLE, "Initialized migrations table");
        Ok(())
    }

    async fn up(
        &self,
        db: &Database,
        ctx: &Context,
        scripts: &[MigrationScript],
    ) -> Result<MigrationReport, MigrationError> {
        let old_version = self.current_version(db, ctx).await?;
        let mut report = MigrationReport {
            old_version,
            new_version: old_version,
            applied: Vec::new(),
        };

        let (insert_sql, _) = rewrite_placeholders(
            &format!("INSERT INTO {MIGRATIONS_TABLE} (version, name) VALUES (?, ?)"),
            db.database_type(),
        );

        for script in scripts.iter().filter(|s| s.version > old_version) {
            info!(version = script.version, name = %script.name, "applying migration");
            run_script(db, ctx, script, &script.up).await?;
            db.exec(
                ctx,
                &insert_sql,
                &[
                    QueryParam::Int(script.version),
                    QueryParam::String(script.name.clone()),
                ],
            )
            .await?;
            report.new_version = script.version;
            report.applied.push(script.version);
        }
        Ok(report)
    }

    async fn down(
        &self,
        db: &Database,
        ctx: &Context,
        scripts: &[MigrationScript],
    ) -> Result<MigrationReport, MigrationError> {
        let old_version = self.current_version(db, ctx).await?;
        if old_version == 0 {
            return Ok(MigrationReport::default());
        }

        let script = scripts
            .iter()
            .find(|s| s.version == old_version)
            .ok_or(MigrationError::MissingDown(old_version))?;
        let down = script
            .down
            .as_ref()
            .ok_or(MigrationError::MissingDown(old_version))?;

        info!(version = script.version, name = %script.name, "reverting migration");
        run_script(db, ctx, script, down).await?;

        let (delete_sql, _) = rewrite_placeholders(
            &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?"),
            db.database_type(),
        );
        db.exec(ctx, &delete_sql, &[QueryParam::Int(old_version)])
            .await?;

        Ok(MigrationReport {
            old_version,
            new_version: self.current_version(db, ctx).await?,
            applied: vec![old_version],
        })
    }
}

async fn run_script(
    db: &Database,
    ctx: &Context,
    script: &MigrationScript,
    path: &Path,
) -> Result<(), MigrationError> {
    let script_error = |source: DbError| MigrationError::Script {
        version: script.version,
        name: script.name.clone(),
        source: Box::new(source),
    };

    let sql = std::fs::read_to_string(path).map_err(|e| {
        script_error(DbError::invalid_input(format!(
            "failed to read {}: {}",
            path.display(),
            e
        )))
    })?;
    if sql.trim().is_empty() {
        return Ok(());
    }
    db.exec(ctx, &sql, &[]).await.map_err(script_error)?;
    Ok(())
}

async fn table_exists(db: &Database, ctx: &Context) -> Result<bool, MigrationError> {
    let sql = match db.database_type() {
        DatabaseType::PostgreSQL => {
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1"
        }
        DatabaseType::MySQL => {
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?"
        }
        DatabaseType::SQLite => {
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?"
        }
    };
    let count = db
        .fetch_i64(ctx, "migrate", sql, &[QueryParam::from(MIGRATIONS_TABLE)])
        .await?;
    Ok(count.unwrap_or(0) > 0)
}

fn create_table_sql(db_type: DatabaseType) -> &'static str {
    match db_type {
        DatabaseType::PostgreSQL => {
            "CREATE TABLE schema_migrations (\
                id BIGSERIAL PRIMARY KEY, \
                version BIGINT NOT NULL UNIQUE, \
                name TEXT NOT NULL, \
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now())"
        }
        DatabaseType::MySQL => {
            "CREATE TABLE schema_migrations (\
                id BIGINT AUTO_INCREMENT PRIMARY KEY, \
                version BIGINT NOT NULL UNIQUE, \
                name VARCHAR(255) NOT NULL, \
                applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)"
        }
        DatabaseType::SQLite => {
            "CREATE TABLE schema_migrations (\
                id INTEGER PRIMARY KEY AUTOINCREMENT, \
                version INTEGER NOT NULL UNIQUE, \
                name TEXT NOT NULL, \
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP)"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(MigrationError::AlreadyInitialized(MIGRATIONS_TABLE.into()).is_already_initialized());
        assert!(!MigrationError::MissingDown(3).is_already_initialized());
    }

    #[test]
    fn test_script_error_names_the_script() {
        let err = MigrationError::Script {
            version: 2,
            name: "add_orders".into(),
            source: Box::new(DbError::internal("boom")),
        };
        assert_eq!(
            err.to_string(),
            "migration 2_add_orders failed: Internal error: boom"
        );
    }

    #[test]
    fn test_database_error_is_transparent() {
        let err = MigrationError::from(DbError::invalid_input("bad"));
        assert_eq!(err.to_string(), "Invalid input: bad");
    }

    #[test]
    fn test_create_table_sql_names_bookkeeping_table() {
        for db_type in [DatabaseType::PostgreSQL, DatabaseType::MySQL, DatabaseType::SQLite] {
            assert!(create_table_sql(db_type).contains(MIGRATIONS_TABLE));
        }
    }

    #[test]
    fn test_report_up_to_date() {
        let report = MigrationReport {
            old_version: 3,
            new_version: 3,
            applied: Vec::new(),
        };
        assert!(report.is_up_to_date());
    }
}

//! Ambient DB Library
//!
//! Context-aware SQL access for PostgreSQL, MySQL and SQLite. Statements
//! issued with a [`Context`] join the transaction that context carries, so
//! code inside a `run_in_transaction` block needs no transaction handle.
//! The crate also bounds every round trip with a timeout and ships a
//! transactional schema migrator.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod migrate;
pub mod models;
pub mod timeout;

pub use config::Config;
pub use context::{CancelGuard, CancelReason, Context};
pub use db::{Database, Model, QueryHook, TableRef};
pub use error::{DbError, DbResult};
pub use migrate::{MigrationCommand, MigrationError, MigrationReport, Migrator};
pub use models::{ConnectionSettings, DatabaseType, ExecResult, JsonRow, QueryParam};

//! Configuration handling for the `ambient-db` binary.
//!
//! This module provides configuration management via CLI arguments and
//! environment variables. The library itself only sees the resulting
//! [`ConnectionSettings`].

use crate::error::DbResult;
use crate::models::ConnectionSettings;
use crate::models::connection::DEFAULT_MIGRATIONS_DIR;
use clap::{Parser, Subcommand};
use std::time::Duration;

pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// What the binary does once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Apply pending migrations
    Migrate,
    /// Revert the latest migration
    Rollback,
    /// Print the current schema version
    Version,
    /// Check that the database answers
    Ping,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Migrate => write!(f, "migrate"),
            Self::Rollback => write!(f, "rollback"),
            Self::Version => write!(f, "version"),
            Self::Ping => write!(f, "ping"),
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "ambient-db",
    about = "Database schema migrations and connectivity checks",
    version,
    author
)]
pub struct Config {
    /// Connection URL (postgres://, mysql://, sqlite:)
    #[arg(long, value_name = "URL", env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    /// Read timeout in seconds (0 disables)
    #[arg(long, default_value_t = DEFAULT_READ_TIMEOUT_SECS, env = "DB_READ_TIMEOUT")]
    pub read_timeout: u64,

    /// Write timeout in seconds (0 disables)
    #[arg(long, default_value_t = DEFAULT_WRITE_TIMEOUT_SECS, env = "DB_WRITE_TIMEOUT")]
    pub write_timeout: u64,

    /// Default statement timeout in seconds (0 disables)
    #[arg(long, default_value_t = DEFAULT_STATEMENT_TIMEOUT_SECS, env = "DB_STMT_TIMEOUT")]
    pub statement_timeout: u64,

    /// Connection acquire timeout in seconds
    #[arg(long, default_value_t = DEFAULT_ACQUIRE_TIMEOUT_SECS, env = "DB_ACQUIRE_TIMEOUT")]
    pub acquire_timeout: u64,

    /// Pool size (0 keeps the default: 10, or 1 for SQLite)
    #[arg(long, default_value_t = 0, env = "DB_NUM_CONNS")]
    pub pool_size: u32,

    /// Directory holding <version>_<name>.up.sql scripts
    #[arg(long, default_value = DEFAULT_MIGRATIONS_DIR, env = "DB_MIGRATIONS_DIR")]
    pub migrations_dir: String,

    /// Require TLS for the database connection
    #[arg(long, env = "DB_TLS")]
    pub tls: bool,

    /// Do not log statements before they are sent
    #[arg(long, env = "DB_DISABLE_BEFORE_QUERY_LOG")]
    pub disable_before_query_log: bool,

    /// Do not log statements after they complete
    #[arg(long, env = "DB_DISABLE_AFTER_QUERY_LOG")]
    pub disable_after_query_log: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DB_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DB_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Build library-level connection settings.
    pub fn connection_settings(&self) -> DbResult<ConnectionSettings> {
        let mut settings = ConnectionSettings::new(&self.database_url)?
            .with_pool_size(self.pool_size)
            .with_migrations_dir(&self.migrations_dir)
            .with_statement_timeout(Duration::from_secs(self.statement_timeout))
            .with_io_timeouts(
                Duration::from_secs(self.read_timeout),
                Duration::from_secs(self.write_timeout),
            );
        settings.acquire_timeout = Duration::from_secs(self.acquire_timeout);
        settings.tls = self.tls;
        settings.before_query_log = !self.disable_before_query_log;
        settings.after_query_log = !self.disable_after_query_log;
        Ok(settings)
    }
}

//! Data models shared across the crate.
//!
//! This module re-exports all model types used throughout the library.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{ConnectionSettings, DatabaseType, TransactionInfo};
pub use query::{ExecResult, JsonRow, QueryParam};

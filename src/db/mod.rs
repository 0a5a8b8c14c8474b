//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection pool creation per backend
//! - Context-routed statement execution
//! - Ambient transactions and savepoints
//! - Query hooks for instrumentation
//! - A small model query builder
//! - Type mappings from driver rows to JSON

#[macro_use]
pub mod macros;
pub mod executor;
pub mod handle;
pub mod hook;
pub mod model;
pub mod params;
pub mod pool;
pub mod transaction;
pub mod types;

pub use handle::Database;
pub use hook::{QueryEvent, QueryHook, QueryOutcome, Route, TracingQueryHook};
pub use model::{Model, ModelQuery, TableRef};
pub use pool::{DbPool, create_pool};
pub use transaction::{AmbientTransaction, DbTransaction};

//! Query instrumentation.
//!
//! A [`QueryHook`] observes every statement issued through a `Database`
//! handle, before it is sent and after it completes.

use crate::context::{Context, Scope};
use crate::error::DbError;
use std::time::Duration;
use tracing::{debug, warn};

/// Where a statement runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Pool,
    /// The ambient transaction with the given id.
    Transaction(String),
}

impl Route {
    pub(crate) fn of(ctx: &Context) -> Self {
        match ctx.scope() {
            Scope::Pool => Route::Pool,
            Scope::Transaction(tx) => Route::Transaction(tx.id().to_string()),
        }
    }

    pub fn is_transaction(&self) -> bool {
        matches!(self, Route::Transaction(_))
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Pool => write!(f, "pool"),
            Route::Transaction(id) => write!(f, "{id}"),
        }
    }
}

/// A statement about to be sent.
#[derive(Debug, Clone)]
pub struct QueryEvent<'a> {
    /// `exec`, `fetch`, `select`, `count`, ...
    pub operation: &'static str,
    pub sql: &'a str,
    pub param_count: usize,
    pub route: Route,
}

/// How a statement finished.
#[derive(Debug)]
pub struct QueryOutcome<'a> {
    pub elapsed: Duration,
    /// Rows affected or returned, when the statement succeeded.
    pub rows: Option<u64>,
    pub error: Option<&'a DbError>,
}

pub trait QueryHook: Send + Sync {
    fn before_query(&self, _event: &QueryEvent<'_>) {}

    fn after_query(&self, _event: &QueryEvent<'_>, _outcome: &QueryOutcome<'_>) {}
}

/// Logs statements through `tracing`. Installed by `Database::connect`.
#[derive(Debug, Clone, Copy)]
pub struct TracingQueryHook {
    pub before_enabled: bool,
    pub after_enabled: bool,
}

impl Default for TracingQueryHook {
    fn default() -> Self {
        Self {
            before_enabled: true,
            after_enabled: true,
        }
    }
}

impl QueryHook for TracingQueryHook {
    fn before_query(&self, event: &QueryEvent<'_>) {
        if self.before_enabled {
            debug!(
                operation = event.operation,
                sql = %event.sql,
                params = event.param_count,
                route = %event.route,
                "Executing query"
            );
        }
    }

    fn after_query(&self, event: &QueryEvent<'_>, outcome: &QueryOutcome<'_>) {
        if !self.after_enabled {
            return;
        }
        let elapsed_ms = u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX);
        match outcome.error {
            None => debug!(
                operation = event.operation,
                route = %event.route,
                rows = ?outcome.rows,
                elapsed_ms,
                "Query finished"
            ),
            // Cancellation is the caller's decision, not a query failure
            Some(err) if err.is_cancelled() => debug!(
                operation = event.operation,
                route = %event.route,
                error = %err,
                elapsed_ms,
                "Query cancelled"
            ),
            Some(err) => warn!(
                operation = event.operation,
                sql = %event.sql,
                route = %event.route,
                error = %err,
                elapsed_ms,
                "Query failed"
            ),
        }
    }
}

//! The database handle.
//!
//! [`Database`] wraps one connection pool. Every statement it issues is
//! routed by the caller's [`Context`]: inside a `run_in_transaction` block it
//! joins the ambient transaction, anywhere else it runs on the pool.

use crate::context::{Context, Scope};
use crate::db::executor::{self, bounded};
use crate::db::hook::{QueryEvent, QueryHook, QueryOutcome, Route, TracingQueryHook};
use crate::db::model::{ModelQuery, TableRef};
use crate::db::pool::{DbPool, create_pool};
use crate::db::transaction::AmbientTransaction;
use crate::error::{DbError, DbResult};
use crate::migrate::{MigrationError, MigrationReport, Migrator};
use crate::models::{ConnectionSettings, DatabaseType, ExecResult, JsonRow, QueryParam, TransactionInfo};
use crate::timeout::with_context_timeout_value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Cheaply cloneable handle to a pooled database.
///
/// A handle never changes after construction; [`Database::with_timeout`] and
/// [`Database::with_hook`] return new handles sharing the same pool.
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    settings: Arc<ConnectionSettings>,
    read_timeout: Duration,
    write_timeout: Duration,
    hooks: Arc<Vec<Arc<dyn QueryHook>>>,
}

impl Database {
    /// Open a pool for `settings` and install the tracing query hook.
    pub async fn connect(settings: ConnectionSettings) -> DbResult<Self> {
        let pool = create_pool(&settings).await?;
        let server_version = pool.server_version().await;
        info!(
            url = %settings.masked_url(),
            db_type = %settings.db_type,
            server_version = ?server_version,
            "Connected successfully"
        );

        let hook = TracingQueryHook {
            before_enabled: settings.before_query_log,
            after_enabled: settings.after_query_log,
        };
        Ok(Self::from_pool(pool, settings).with_hook(hook))
    }

    /// Wrap an existing pool. No hooks are installed.
    pub fn from_pool(pool: DbPool, settings: ConnectionSettings) -> Self {
        Self {
            pool,
            read_timeout: settings.read_timeout,
            write_timeout: settings.write_timeout,
            settings: Arc::new(settings),
            hooks: Arc::new(Vec::new()),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn database_type(&self) -> DatabaseType {
        self.pool.db_type()
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// New handle that also reports to `hook`.
    pub fn with_hook(&self, hook: impl QueryHook + 'static) -> Self {
        let mut hooks = self.hooks.as_ref().clone();
        hooks.push(Arc::new(hook));
        Self {
            hooks: Arc::new(hooks),
            ..self.clone()
        }
    }

    /// New handle whose read and write timeouts are both `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            read_timeout: timeout,
            write_timeout: timeout,
            ..self.clone()
        }
    }

    /// Round-trip a trivial statement on the pool.
    pub async fn ping(&self) -> DbResult<()> {
        self.exec(&Context::background(), "SELECT 1", &[]).await?;
        Ok(())
    }

    /// Close the pool. Later statements fail with a connection error.
    pub async fn close(&self) {
        self.pool.close().await;
        info!(db_type = %self.database_type(), "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Execute one statement on the context's route.
    pub async fn exec(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<ExecResult> {
        self.instrumented(
            ctx,
            "exec",
            sql,
            params,
            self.write_timeout,
            |result: &ExecResult| result.rows_affected,
            executor::execute(&self.pool, ctx, sql, params),
        )
        .await
    }

    /// Fetch all rows of a query on the context's route.
    pub async fn fetch_all(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<JsonRow>> {
        self.fetch_all_as(ctx, "fetch", sql, params).await
    }

    pub(crate) async fn fetch_all_as(
        &self,
        ctx: &Context,
        operation: &'static str,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<JsonRow>> {
        self.instrumented(
            ctx,
            operation,
            sql,
            params,
            self.read_timeout,
            |rows: &Vec<JsonRow>| rows.len() as u64,
            executor::fetch_all(&self.pool, ctx, sql, params),
        )
        .await
    }

    pub(crate) async fn fetch_i64(
        &self,
        ctx: &Context,
        operation: &'static str,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<i64>> {
        self.instrumented(
            ctx,
            operation,
            sql,
            params,
            self.read_timeout,
            |value: &Option<i64>| u64::from(value.is_some()),
            executor::fetch_i64(&self.pool, ctx, sql, params),
        )
        .await
    }

    /// Start a query over `tables`. The route is fixed by `ctx` now; nothing
    /// is sent until a terminal method runs.
    pub fn model_query(
        &self,
        ctx: &Context,
        tables: impl IntoIterator<Item = TableRef>,
    ) -> ModelQuery {
        ModelQuery::new(self.clone(), ctx.clone(), tables.into_iter().collect())
    }

    /// Metadata of the context's ambient transaction, if any.
    pub async fn transaction_info(&self, ctx: &Context) -> Option<TransactionInfo> {
        match ctx.scope() {
            Scope::Pool => None,
            Scope::Transaction(tx) => Some(tx.info().await),
        }
    }

    /// Run `f` inside a transaction.
    ///
    /// `f` receives a context carrying the transaction and a clone of this
    /// handle. The transaction commits when `f` returns `Ok` and rolls back
    /// when it returns `Err`; the error is returned unchanged. If `f` panics
    /// or its future is dropped, the transaction is rolled back when the
    /// connection is released.
    ///
    /// When `ctx` already carries a transaction, the block runs inside a
    /// savepoint of that transaction instead.
    pub async fn run_in_transaction<F, Fut, T, E>(&self, ctx: &Context, f: F) -> Result<T, E>
    where
        F: FnOnce(Context, Database) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        if let Scope::Transaction(tx) = ctx.scope() {
            return self.run_in_savepoint(ctx, Arc::clone(tx), f).await;
        }

        let tx = bounded(ctx, None, "begin", self.pool.begin()).await?;
        let ambient = Arc::new(AmbientTransaction::new(tx));
        let tx_ctx = ctx.with_transaction(Arc::clone(&ambient));

        match f(tx_ctx, self.clone()).await {
            Ok(value) => {
                ambient.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = ambient.rollback().await {
                    warn!(
                        transaction_id = %ambient.id(),
                        error = %rollback_err,
                        "Rollback failed"
                    );
                }
                Err(err)
            }
        }
    }

    async fn run_in_savepoint<F, Fut, T, E>(
        &self,
        ctx: &Context,
        tx: Arc<AmbientTransaction>,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Context, Database) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        let name = tx.next_savepoint();
        self.exec(ctx, &format!("SAVEPOINT {name}"), &[]).await?;

        // Release and rollback must run even if the caller's context is done
        let control = ctx.detached();
        match f(ctx.clone(), self.clone()).await {
            Ok(value) => {
                self.exec(&control, &format!("RELEASE SAVEPOINT {name}"), &[])
                    .await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self
                    .exec(&control, &format!("ROLLBACK TO SAVEPOINT {name}"), &[])
                    .await
                {
                    warn!(
                        transaction_id = %tx.id(),
                        savepoint = %name,
                        error = %rollback_err,
                        "Rollback to savepoint failed"
                    );
                }
                Err(err)
            }
        }
    }

    /// Run `f` under a context bounded by the configured statement timeout.
    /// A zero statement timeout only scopes cancellation.
    pub async fn with_context_timeout<F, Fut, T>(&self, ctx: &Context, f: F) -> T
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = T>,
    {
        let timeout = self.settings.statement_timeout;
        if timeout.is_zero() {
            let (scoped, _guard) = ctx.with_cancel();
            return f(scoped).await;
        }
        with_context_timeout_value(ctx, timeout, f).await
    }

    /// Apply pending migrations from the configured directory.
    pub async fn migrate(&self, ctx: &Context) -> Result<MigrationReport, MigrationError> {
        Migrator::new(&self.settings.migrations_dir)
            .migrate(self, ctx)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn instrumented<T, F>(
        &self,
        ctx: &Context,
        operation: &'static str,
        sql: &str,
        params: &[QueryParam],
        limit: Duration,
        rows: impl Fn(&T) -> u64,
        fut: F,
    ) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        let event = QueryEvent {
            operation,
            sql,
            param_count: params.len(),
            route: Route::of(ctx),
        };
        for hook in self.hooks.iter() {
            hook.before_query(&event);
        }

        let start = Instant::now();
        let limit = (!limit.is_zero()).then_some(limit);
        let result = bounded(ctx, limit, operation, fut).await;

        let outcome = QueryOutcome {
            elapsed: start.elapsed(),
            rows: result.as_ref().ok().map(&rows),
            error: result.as_ref().err(),
        };
        for hook in self.hooks.iter() {
            hook.after_query(&event, &outcome);
        }
        result
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("url", &self.settings.masked_url())
            .field("db_type", &self.database_type())
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

//! Statement execution.
//!
//! Every statement is routed by the caller's context: a context in the pool
//! scope runs on the pool, a context in a transaction scope runs on that
//! transaction's connection. The round trip is raced against the context's
//! cancellation and, when configured, a per-operation time limit.
//!
//! # Architecture
//!
//! The backend-specific functions live in submodules (`mysql`, `postgres`,
//! `sqlite`) and are generic over `sqlx::Executor`, so the same function
//! serves `&Pool` and `&mut Connection`.

use crate::context::{Context, Scope};
use crate::db::params::{mysql_query, postgres_query, sqlite_query};
use crate::db::pool::DbPool;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{ExecResult, JsonRow, QueryParam};
use sqlx::Row;
use std::future::Future;
use std::time::Duration;

/// Run `fut` unless `ctx` is already done, failing early if `ctx` is
/// cancelled or `limit` elapses first. Dropping `fut` abandons the round trip.
pub(crate) async fn bounded<T, F>(
    ctx: &Context,
    limit: Option<Duration>,
    operation: &str,
    fut: F,
) -> DbResult<T>
where
    F: Future<Output = DbResult<T>>,
{
    if let Some(reason) = ctx.err() {
        return Err(DbError::cancelled(operation, reason));
    }

    let round_trip = async {
        match limit {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(DbError::timeout(operation, limit)),
            },
            None => fut.await,
        }
    };

    tokio::select! {
        result = round_trip => result,
        reason = ctx.done() => Err(DbError::cancelled(operation, reason)),
    }
}

/// Dispatch `$f` to the backend module matching the context's route.
macro_rules! route {
    ($pool:expr, $ctx:expr, $f:ident($($arg:expr),*)) => {
        match $ctx.scope() {
            Scope::Pool => impl_db_dispatch!($pool, {
                MySql(p) => mysql::$f(p, $($arg),*).await,
                Postgres(p) => postgres::$f(p, $($arg),*).await,
                SQLite(p) => sqlite::$f(p, $($arg),*).await,
            }),
            Scope::Transaction(tx) => {
                let mut lock = tx.lock().await?;
                impl_tx_dispatch!(lock.get()?, {
                    MySql(t) => mysql::$f(&mut **t, $($arg),*).await,
                    Postgres(t) => postgres::$f(&mut **t, $($arg),*).await,
                    SQLite(t) => sqlite::$f(&mut **t, $($arg),*).await,
                })
            }
        }
    };
}

/// Execute one statement. Without parameters the SQL is sent unprepared, so
/// it may hold several statements (migration scripts rely on this).
pub(crate) async fn execute(
    pool: &DbPool,
    ctx: &Context,
    sql: &str,
    params: &[QueryParam],
) -> DbResult<ExecResult> {
    route!(pool, ctx, execute(sql, params))
}

/// Fetch every row of a query, decoded to JSON maps.
pub(crate) async fn fetch_all(
    pool: &DbPool,
    ctx: &Context,
    sql: &str,
    params: &[QueryParam],
) -> DbResult<Vec<JsonRow>> {
    route!(pool, ctx, fetch_all(sql, params))
}

/// First column of the first row as an integer. `None` for no rows or NULL.
pub(crate) async fn fetch_i64(
    pool: &DbPool,
    ctx: &Context,
    sql: &str,
    params: &[QueryParam],
) -> DbResult<Option<i64>> {
    route!(pool, ctx, fetch_i64(sql, params))
}

fn first_i64<R>(row: Option<R>) -> DbResult<Option<i64>>
where
    R: Row,
    usize: sqlx::ColumnIndex<R>,
    i64: for<'r> sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    match row {
        Some(row) => Ok(row.try_get::<Option<i64>, _>(0usize)?),
        None => Ok(None),
    }
}

mod mysql {
    use super::*;
    use sqlx::{Executor, MySql};

    pub async fn execute<'c, E>(
        executor: E,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<ExecResult>
    where
        E: Executor<'c, Database = MySql>,
    {
        let result = if params.is_empty() {
            executor.execute(sql).await?
        } else {
            mysql_query(sql, params).execute(executor).await?
        };
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: i64::try_from(result.last_insert_id()).ok().filter(|id| *id > 0),
        })
    }

    pub async fn fetch_all<'c, E>(
        executor: E,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<JsonRow>>
    where
        E: Executor<'c, Database = MySql>,
    {
        let rows = mysql_query(sql, params).fetch_all(executor).await?;
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    pub async fn fetch_i64<'c, E>(
        executor: E,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<i64>>
    where
        E: Executor<'c, Database = MySql>,
    {
        first_i64(mysql_query(sql, params).fetch_optional(executor).await?)
    }
}

mod postgres {
    use super::*;
    use sqlx::{Executor, Postgres};

    pub async fn execute<'c, E>(
        executor: E,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<ExecResult>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let result = if params.is_empty() {
            executor.execute(sql).await?
        } else {
            postgres_query(sql, params).execute(executor).await?
        };
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: None,
        })
    }

    pub async fn fetch_all<'c, E>(
        executor: E,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<JsonRow>>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let rows = postgres_query(sql, params).fetch_all(executor).await?;
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    pub async fn fetch_i64<'c, E>(
        executor: E,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<i64>>
    where
        E: Executor<'c, Database = Postgres>,
    {
        first_i64(postgres_query(sql, params).fetch_optional(executor).await?)
    }
}

mod sqlite {
    use super::*;
    use sqlx::{Executor, Sqlite};

    pub async fn execute<'c, E>(
        executor: E,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<ExecResult>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let result = if params.is_empty() {
            executor.execute(sql).await?
        } else {
            sqlite_query(sql, params).execute(executor).await?
        };
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: Some(result.last_insert_rowid()).filter(|id| *id > 0),
        })
    }

    pub async fn fetch_all<'c, E>(
        executor: E,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<JsonRow>>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let rows = sqlite_query(sql, params).fetch_all(executor).await?;
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    pub async fn fetch_i64<'c, E>(
        executor: E,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<i64>>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        first_i64(sqlite_query(sql, params).fetch_optional(executor).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelReason;

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let ctx = Context::background();
        let value = bounded(&ctx, Some(Duration::from_secs(1)), "exec", async { Ok(7) }).await;
        assert_eq!(value.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_bounded_limit_elapses() {
        let ctx = Context::background();
        let err = bounded(
            &ctx,
            Some(Duration::from_millis(10)),
            "fetch",
            std::future::pending::<DbResult<()>>(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DbError::Timeout { limit_ms: 10, .. }));
    }

    #[tokio::test]
    async fn test_bounded_rejects_done_context_without_polling() {
        let (ctx, guard) = Context::background().with_cancel();
        guard.cancel();
        let polled = std::cell::Cell::new(false);
        let err = bounded(&ctx, None, "exec", async {
            polled.set(true);
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(!polled.get());
        assert!(matches!(
            err,
            DbError::Cancelled {
                reason: CancelReason::Canceled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_bounded_observes_deadline_mid_flight() {
        let (ctx, _guard) = Context::background().with_timeout(Duration::from_millis(20));
        let err = bounded(&ctx, None, "exec", std::future::pending::<DbResult<()>>())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::Cancelled {
                reason: CancelReason::DeadlineExceeded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_pool_route_executes() {
        let pool = DbPool::SQLite(sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap());
        let ctx = Context::background();
        execute(&pool, &ctx, "CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (4)", &[])
            .await
            .unwrap();
        let v = fetch_i64(&pool, &ctx, "SELECT v FROM t WHERE v = ?", &[QueryParam::Int(4)])
            .await
            .unwrap();
        assert_eq!(v, Some(4));
        let none = fetch_i64(&pool, &ctx, "SELECT v FROM t WHERE v = 5", &[])
            .await
            .unwrap();
        assert_eq!(none, None);
    }
}

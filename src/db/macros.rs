//! Database dispatch macros for reducing code duplication.

/// Macro for generating database dispatch match arms.
///
/// Generates one match arm per `DbPool` variant so backend-specific calls
/// read linearly.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => do_mysql(p),
///     Postgres(p) => do_postgres(p),
///     SQLite(p) => do_sqlite(p),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

/// Same as [`impl_db_dispatch!`] for `DbTransaction` variants.
#[macro_export]
macro_rules! impl_tx_dispatch {
    ($tx:expr, { $($variant:ident($t:ident) => $body:expr),+ $(,)? }) => {
        match $tx {
            $(
                $crate::db::transaction::DbTransaction::$variant($t) => $body,
            )+
        }
    };
}

//! Deadline-scoped execution.
//!
//! Runs a unit of work under a context that expires after a timeout and is
//! always released when the work finishes, whatever way it finishes.

use crate::context::Context;
use std::future::Future;
use std::time::Duration;
use tracing::error;

/// Timeout applied by [`with_context_timeout`].
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeouts above this bound are reported but still honoured.
pub const TIMEOUT_UPPER_BOUND: Duration = Duration::from_secs(60 * 60);

pub fn exceeds_upper_bound(timeout: Duration) -> bool {
    timeout > TIMEOUT_UPPER_BOUND
}

/// Run `f` under a context bounded by [`DEFAULT_STATEMENT_TIMEOUT`].
pub async fn with_context_timeout<F, Fut, T>(ctx: &Context, f: F) -> T
where
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = T>,
{
    with_context_timeout_value(ctx, DEFAULT_STATEMENT_TIMEOUT, f).await
}

/// Run `f` under a context whose deadline is `timeout` from now, or the
/// parent's deadline if that is earlier.
///
/// The derived context is cancelled when `f` returns, when its future is
/// dropped, or while unwinding from a panic. A timeout longer than
/// [`TIMEOUT_UPPER_BOUND`] is logged as an error and used as given.
pub async fn with_context_timeout_value<F, Fut, T>(ctx: &Context, timeout: Duration, f: F) -> T
where
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = T>,
{
    if exceeds_upper_bound(timeout) {
        error!(
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            upper_bound_ms = u64::try_from(TIMEOUT_UPPER_BOUND.as_millis()).unwrap_or(u64::MAX),
            "context timeout exceeds upper bound"
        );
    }

    let (scoped, _guard) = ctx.with_timeout(timeout);
    f(scoped).await
}

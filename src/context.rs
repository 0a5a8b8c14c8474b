//! Request-scoped execution context.
//!
//! A [`Context`] is an immutable value threaded through a call chain. Every
//! derivation (attaching a value, a deadline, a cancellation scope or an
//! ambient transaction) returns a new `Context` and leaves the parent as it
//! was.
//!
//! The execution route is a typed field rather than an untyped lookup: a
//! context is either in the pool scope or in the scope of exactly one
//! [`AmbientTransaction`], and only `Database::run_in_transaction` can put it
//! there.

use crate::db::transaction::AmbientTransaction;
use futures_util::future::select_all;
use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a context stopped being usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The cancellation guard was released or an ancestor was cancelled.
    Canceled,
    /// The deadline elapsed.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled => write!(f, "context canceled"),
            Self::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

/// Where statements issued with a context are executed.
#[derive(Clone, Default)]
pub(crate) enum Scope {
    #[default]
    Pool,
    Transaction(Arc<AmbientTransaction>),
}

struct ValueNode {
    type_id: TypeId,
    value: Arc<dyn Any + Send + Sync>,
    parent: Option<Arc<ValueNode>>,
}

struct CancelNode {
    state: watch::Sender<Option<CancelReason>>,
    parent: Option<Arc<CancelNode>>,
}

impl CancelNode {
    fn new(parent: Option<Arc<CancelNode>>) -> Arc<Self> {
        let (state, _) = watch::channel(None);
        Arc::new(Self { state, parent })
    }

    /// Record `reason` unless the node was already cancelled.
    fn cancel(&self, reason: CancelReason) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason);
                true
            } else {
                false
            }
        })
    }

    fn reason(&self) -> Option<CancelReason> {
        *self.state.borrow()
    }
}

/// Immutable, cheaply cloneable request context.
#[derive(Clone, Default)]
pub struct Context {
    scope: Scope,
    deadline: Option<Instant>,
    cancel: Option<Arc<CancelNode>>,
    values: Option<Arc<ValueNode>>,
}

impl Context {
    /// An empty context: pool scope, no deadline, never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context carrying `value`. Lookups are keyed by type, so a
    /// later value of the same type shadows an earlier one.
    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Self {
        let node = ValueNode {
            type_id: TypeId::of::<T>(),
            value: Arc::new(value),
            parent: self.values.clone(),
        };
        Self {
            values: Some(Arc::new(node)),
            ..self.clone()
        }
    }

    /// Nearest value of type `T` attached to this context or its ancestors.
    pub fn value<T: Any + Send + Sync>(&self) -> Option<&T> {
        let mut node = self.values.as_deref();
        while let Some(current) = node {
            if current.type_id == TypeId::of::<T>() {
                return current.value.downcast_ref::<T>();
            }
            node = current.parent.as_deref();
        }
        None
    }

    /// Derive a cancellable context. Dropping the returned guard cancels it.
    pub fn with_cancel(&self) -> (Self, CancelGuard) {
        let node = CancelNode::new(self.cancel.clone());
        let ctx = Self {
            cancel: Some(Arc::clone(&node)),
            ..self.clone()
        };
        (
            ctx,
            CancelGuard {
                node,
                deadline: self.deadline,
            },
        )
    }

    /// Derive a context that expires at `deadline`, or at the parent's
    /// deadline if that is earlier.
    pub fn with_deadline(&self, deadline: Instant) -> (Self, CancelGuard) {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        let node = CancelNode::new(self.cancel.clone());
        let ctx = Self {
            deadline: Some(deadline),
            cancel: Some(Arc::clone(&node)),
            ..self.clone()
        };
        (
            ctx,
            CancelGuard {
                node,
                deadline: Some(deadline),
            },
        )
    }

    /// Derive a context that expires `timeout` from now. A timeout too large
    /// to represent as an instant adds no deadline of its own; the parent's
    /// deadline, if any, still applies.
    pub fn with_timeout(&self, timeout: Duration) -> (Self, CancelGuard) {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.with_cancel(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Why this context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<CancelReason> {
        let mut node = self.cancel.as_deref();
        while let Some(current) = node {
            if let Some(reason) = current.reason() {
                return Some(reason);
            }
            node = current.parent.as_deref();
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolve once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> CancelReason {
        let mut waiters: Vec<Pin<Box<dyn Future<Output = CancelReason> + Send>>> = Vec::new();
        let mut node = self.cancel.as_deref();
        while let Some(current) = node {
            let mut rx = current.state.subscribe();
            waiters.push(Box::pin(async move {
                let reason = rx.wait_for(Option::is_some).await.ok().and_then(|r| *r);
                match reason {
                    Some(reason) => reason,
                    None => std::future::pending().await,
                }
            }));
            node = current.parent.as_deref();
        }

        let cancelled = async move {
            if waiters.is_empty() {
                std::future::pending::<CancelReason>().await
            } else {
                select_all(waiters).await.0
            }
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
                reason = cancelled => reason,
            },
            None => cancelled.await,
        }
    }

    /// True when statements issued with this context join an ambient transaction.
    pub fn in_transaction(&self) -> bool {
        matches!(self.scope, Scope::Transaction(_))
    }

    /// Identifier of the ambient transaction, if any.
    pub fn transaction_id(&self) -> Option<&str> {
        match &self.scope {
            Scope::Pool => None,
            Scope::Transaction(tx) => Some(tx.id()),
        }
    }

    pub(crate) fn scope(&self) -> &Scope {
        &self.scope
    }

    pub(crate) fn with_transaction(&self, tx: Arc<AmbientTransaction>) -> Self {
        Self {
            scope: Scope::Transaction(tx),
            ..self.clone()
        }
    }

    /// Same scope and values, without deadline or cancellation. Used for
    /// cleanup statements that must run after the caller gave up.
    pub(crate) fn detached(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            deadline: None,
            cancel: None,
            values: self.values.clone(),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("transaction_id", &self.transaction_id())
            .field("deadline", &self.deadline)
            .field("err", &self.err())
            .finish_non_exhaustive()
    }
}

/// Releases a derived context.
///
/// The context is cancelled exactly once: on [`CancelGuard::cancel`] or when
/// the guard is dropped, whichever comes first. Dropping covers early
/// returns, `?` propagation and panic unwinding.
#[must_use = "dropping the guard cancels the derived context immediately"]
pub struct CancelGuard {
    node: Arc<CancelNode>,
    deadline: Option<Instant>,
}

impl CancelGuard {
    /// Cancel the derived context now.
    pub fn cancel(self) {}
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let reason = match self.deadline {
            Some(deadline) if Instant::now() >= deadline => CancelReason::DeadlineExceeded,
            _ => CancelReason::Canceled,
        };
        self.node.cancel(reason);
    }
}

impl fmt::Debug for CancelGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelGuard")
            .field("deadline", &self.deadline)
            .field("cancelled", &self.node.reason())
            .finish()
    }
}

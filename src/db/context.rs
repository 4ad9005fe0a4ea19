//! Execution contexts.
//!
//! An execution context is one unit of sequential logical work. At most one
//! transaction is bound to a context at a time. Contexts are explicit handles
//! threaded through calls; [`ExecutionContext::scope`] additionally makes one
//! ambient for a task so deeply nested code can find it with
//! [`ExecutionContext::current`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT: ExecutionContext;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionContext {
    id: u64,
}

impl ExecutionContext {
    /// Allocate a fresh context, distinct from every other in the process.
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The context installed by an enclosing [`scope`](Self::scope), if any.
    pub fn current() -> Option<Self> {
        CURRENT.try_with(|ctx| *ctx).ok()
    }

    /// The ambient context, or a fresh one when none is installed.
    pub fn current_or_new() -> Self {
        Self::current().unwrap_or_default()
    }

    /// Run `fut` with this context installed as the task's ambient context.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(self, fut).await
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_are_distinct() {
        let a = ExecutionContext::new();
        let b = ExecutionContext::new();
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_no_ambient_context_outside_scope() {
        assert!(ExecutionContext::current().is_none());
    }

    #[tokio::test]
    async fn test_scope_installs_ambient_context() {
        let ctx = ExecutionContext::new();
        let seen = ctx
            .scope(async { ExecutionContext::current() })
            .await;
        assert_eq!(seen, Some(ctx));
        assert!(ExecutionContext::current().is_none());
    }

    #[tokio::test]
    async fn test_scopes_do_not_leak_across_tasks() {
        let ctx = ExecutionContext::new();
        let seen = ctx
            .scope(async {
                tokio::spawn(async { ExecutionContext::current() })
                    .await
                    .unwrap()
            })
            .await;
        assert!(seen.is_none());
    }
}

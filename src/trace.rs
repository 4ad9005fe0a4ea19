//! Before/after trace hooks.
//!
//! Every transaction boundary and every statement execution is bracketed by a
//! before/after event pair. Hooks are optional and observe only: a hook that
//! panics is caught and logged, and never changes control flow or results.

use crate::models::{CurdKind, IsolationLevel, Param, TableInfo};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

/// Opened before a transaction boundary (begin, commit, rollback, auto-resolve).
#[derive(Debug, Clone)]
pub struct TraceBeforeEvent {
    pub id: Uuid,
    pub operation: String,
    pub context_id: Option<u64>,
    pub isolation: Option<IsolationLevel>,
    pub at: DateTime<Utc>,
    started: Instant,
}

impl TraceBeforeEvent {
    pub fn new(operation: impl Into<String>, isolation: Option<IsolationLevel>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.into(),
            context_id: None,
            isolation,
            at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn with_context(mut self, context_id: u64) -> Self {
        self.context_id = Some(context_id);
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Closes a [`TraceBeforeEvent`] with the outcome.
#[derive(Debug, Clone)]
pub struct TraceAfterEvent {
    pub before: TraceBeforeEvent,
    /// "commit", "rollback", "timeout auto-commit", ... or empty for begin
    pub remark: String,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl TraceAfterEvent {
    pub fn new(
        before: &TraceBeforeEvent,
        remark: impl Into<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            before: before.clone(),
            remark: remark.into(),
            error,
            elapsed: before.elapsed(),
        }
    }
}

/// Opened before one statement execution.
#[derive(Debug, Clone)]
pub struct CurdBeforeEvent {
    pub id: Uuid,
    pub table: Option<TableInfo>,
    pub kind: CurdKind,
    pub sql: String,
    pub params: Vec<Param>,
    pub at: DateTime<Utc>,
    started: Instant,
}

impl CurdBeforeEvent {
    pub fn new(
        table: Option<&TableInfo>,
        kind: CurdKind,
        sql: impl Into<String>,
        params: &[Param],
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            table: table.cloned(),
            kind,
            sql: sql.into(),
            params: params.to_vec(),
            at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Value produced by a traced execution.
#[derive(Debug, Clone, PartialEq)]
pub enum CurdValue {
    None,
    Affrows(u64),
    Identity(i64),
    Scalar(Option<JsonValue>),
}

/// Closes a [`CurdBeforeEvent`] with the outcome.
#[derive(Debug, Clone)]
pub struct CurdAfterEvent {
    pub before: CurdBeforeEvent,
    pub error: Option<String>,
    pub value: CurdValue,
    pub elapsed: Duration,
}

impl CurdAfterEvent {
    pub fn new(before: &CurdBeforeEvent, error: Option<String>, value: CurdValue) -> Self {
        Self {
            before: before.clone(),
            error,
            value,
            elapsed: before.elapsed(),
        }
    }
}

/// Observability collaborator. All methods default to no-ops.
pub trait TraceHook: Send + Sync {
    fn before(&self, _event: &TraceBeforeEvent) {}
    fn after(&self, _event: &TraceAfterEvent) {}
    fn curd_before(&self, _event: &CurdBeforeEvent) {}
    fn curd_after(&self, _event: &CurdAfterEvent) {}
}

/// Fan-out over the registered hooks.
#[derive(Clone, Default)]
pub struct Tracer {
    hooks: Vec<Arc<dyn TraceHook>>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(mut self, hook: Arc<dyn TraceHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn before(&self, event: &TraceBeforeEvent) {
        self.each("before", |h| h.before(event));
    }

    pub fn after(&self, event: &TraceAfterEvent) {
        self.each("after", |h| h.after(event));
    }

    pub fn curd_before(&self, event: &CurdBeforeEvent) {
        self.each("curd_before", |h| h.curd_before(event));
    }

    pub fn curd_after(&self, event: &CurdAfterEvent) {
        self.each("curd_after", |h| h.curd_after(event));
    }

    fn each(&self, phase: &'static str, f: impl Fn(&dyn TraceHook)) {
        for hook in &self.hooks {
            if catch_unwind(AssertUnwindSafe(|| f(hook.as_ref()))).is_err() {
                warn!(phase = phase, "Trace hook panicked; event dropped");
            }
        }
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        remarks: Mutex<Vec<String>>,
    }

    impl TraceHook for Recorder {
        fn after(&self, event: &TraceAfterEvent) {
            self.remarks.lock().unwrap().push(event.remark.clone());
        }
    }

    struct Panicky;

    impl TraceHook for Panicky {
        fn after(&self, _event: &TraceAfterEvent) {
            panic!("hook bug");
        }
    }

    #[test]
    fn test_empty_tracer_is_noop() {
        let tracer = Tracer::new();
        assert!(tracer.is_empty());
        let before = TraceBeforeEvent::new("ContextTransaction", None);
        tracer.before(&before);
        tracer.after(&TraceAfterEvent::new(&before, "commit", None));
    }

    #[test]
    fn test_panicking_hook_does_not_stop_others() {
        let recorder = Arc::new(Recorder::default());
        let tracer = Tracer::new()
            .with_hook(Arc::new(Panicky))
            .with_hook(recorder.clone());

        let before = TraceBeforeEvent::new("ContextTransaction", None).with_context(3);
        tracer.after(&TraceAfterEvent::new(&before, "rollback", None));

        assert_eq!(*recorder.remarks.lock().unwrap(), vec!["rollback"]);
    }

    #[test]
    fn test_after_event_links_before() {
        let before = CurdBeforeEvent::new(None, CurdKind::Insert, "INSERT", &[Param::Int(1)]);
        let after = CurdAfterEvent::new(&before, None, CurdValue::Affrows(1));
        assert_eq!(after.before.id, before.id);
        assert_eq!(after.before.params, vec![Param::Int(1)]);
    }
}

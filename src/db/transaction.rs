//! Context-bound transaction coordination.
//!
//! At most one transaction is bound to an [`ExecutionContext`](crate::db::ExecutionContext)
//! at a time. A transaction owns one master connection from begin until it is
//! resolved, and is resolved exactly once by whichever of these wins:
//! explicit commit, explicit rollback, the timeout sweep (which commits), or
//! coordinator close (which rolls back). Every resolution hands the connection
//! back to its pool, even when the commit or rollback itself fails.

use crate::db::driver::{Driver, PooledConnection};
use crate::db::pool::HealthState;
use crate::db::router::ConnectionRouter;
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, TransactionState};
use crate::trace::{TraceAfterEvent, TraceBeforeEvent, Tracer};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use crate::config::DEFAULT_TRANSACTION_TIMEOUT_SECS;

/// Operation name carried by transaction trace events.
const TRACE_OPERATION: &str = "ContextTransaction";

type ConnectionSlot<D> = Arc<AsyncMutex<Option<PooledConnection<D>>>>;

struct ActiveTransaction<D: Driver> {
    context_id: u64,
    /// `None` once resolved
    connection: ConnectionSlot<D>,
    driver: Arc<D>,
    isolation: Option<IsolationLevel>,
    created_at: Instant,
    started_at: DateTime<Utc>,
    timeout: Duration,
    trace: TraceBeforeEvent,
}

impl<D: Driver> ActiveTransaction<D> {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.timeout
    }

    fn metadata(&self) -> TransactionMetadata {
        TransactionMetadata {
            context_id: self.context_id,
            started_at: self.started_at,
            elapsed: self.created_at.elapsed(),
            timeout: self.timeout,
            isolation: self.isolation,
        }
    }
}

/// Metadata about an active transaction (for listing without consuming).
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionMetadata {
    pub context_id: u64,
    /// When the transaction started (absolute time)
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub timeout: Duration,
    pub isolation: Option<IsolationLevel>,
}

/// Exclusive access to a context's transaction connection.
///
/// Holding it serializes statements on the transaction; resolution waits for
/// it to be dropped.
pub struct TransactionConnection<D: Driver> {
    context_id: u64,
    driver: Arc<D>,
    guard: OwnedMutexGuard<Option<PooledConnection<D>>>,
}

impl<D: Driver> TransactionConnection<D> {
    pub fn context_id(&self) -> u64 {
        self.context_id
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// The connection, or an error if the transaction was resolved meanwhile
    /// or its connection broke.
    pub fn connection(&mut self) -> DbResult<&mut D::Connection> {
        let context_id = self.context_id;
        match self.guard.as_mut() {
            None => Err(DbError::transaction("Transaction is no longer active", context_id)),
            Some(conn) if conn.health() == HealthState::Broken => Err(DbError::transaction(
                "Transaction connection broke; roll the transaction back",
                context_id,
            )),
            Some(conn) => Ok(&mut **conn),
        }
    }

    /// Poison the transaction: later statements fail and resolution destroys
    /// the connection instead of committing on it.
    pub fn mark_broken(&mut self) {
        if let Some(conn) = self.guard.as_mut() {
            conn.mark_broken();
        }
    }
}

pub struct TransactionCoordinator<D: Driver> {
    router: Arc<ConnectionRouter<D>>,
    tracer: Tracer,
    transactions: DashMap<u64, Arc<ActiveTransaction<D>>>,
    /// Entry count kept outside the map for a lock-free "any active?" check
    active: AtomicUsize,
    default_timeout: Duration,
    closed: AtomicBool,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Driver> TransactionCoordinator<D> {
    pub fn new(router: Arc<ConnectionRouter<D>>, tracer: Tracer) -> Self {
        Self {
            router,
            tracer,
            transactions: DashMap::new(),
            active: AtomicUsize::new(0),
            default_timeout: Duration::from_secs(DEFAULT_TRANSACTION_TIMEOUT_SECS),
            closed: AtomicBool::new(false),
            sweep_handle: Mutex::new(None),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn router(&self) -> &Arc<ConnectionRouter<D>> {
        &self.router
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether `context_id` has an active transaction.
    pub fn has_transaction(&self, context_id: u64) -> bool {
        self.active.load(Ordering::Acquire) > 0 && self.transactions.contains_key(&context_id)
    }

    /// The transaction bound to `context_id`, if any.
    pub fn current_transaction(&self, context_id: u64) -> Option<TransactionMetadata> {
        if self.active.load(Ordering::Acquire) == 0 {
            return None;
        }
        self.transactions
            .get(&context_id)
            .map(|entry| entry.value().metadata())
    }

    /// List all active transactions with their metadata.
    pub fn list_transactions(&self) -> Vec<TransactionMetadata> {
        self.transactions
            .iter()
            .map(|entry| entry.value().metadata())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Bind a transaction on a master connection to `context_id`.
    ///
    /// A context that already has a transaction keeps it; the nested begin is a
    /// no-op. Expired transactions are swept first.
    pub async fn begin_transaction(
        &self,
        context_id: u64,
        timeout: Option<Duration>,
        isolation: Option<IsolationLevel>,
    ) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::transaction("Transaction coordinator is closed", context_id));
        }
        if self.has_transaction(context_id) {
            debug!(context_id, "Nested begin joins the active transaction");
            return Ok(());
        }
        self.sweep_expired().await;

        let timeout = timeout.unwrap_or(self.default_timeout);
        let trace = TraceBeforeEvent::new(TRACE_OPERATION, isolation).with_context(context_id);
        self.tracer.before(&trace);

        let master = self.router.get_for_write();
        let mut conn = match master.acquire_for(context_id).await {
            Ok(conn) => conn,
            Err(e) => {
                self.tracer
                    .after(&TraceAfterEvent::new(&trace, "", Some(e.to_string())));
                return Err(e);
            }
        };
        let driver = Arc::clone(conn.manager().driver());
        if let Err(e) = driver.begin(&mut *conn, isolation).await {
            conn.release(Some(&e)).await;
            self.tracer
                .after(&TraceAfterEvent::new(&trace, "", Some(e.to_string())));
            return Err(e);
        }
        // Dropped without resolution means the connection state is unknown.
        conn.set_health(HealthState::Unknown);

        let entry = Arc::new(ActiveTransaction {
            context_id,
            connection: Arc::new(AsyncMutex::new(Some(conn))),
            driver,
            isolation,
            created_at: Instant::now(),
            started_at: Utc::now(),
            timeout,
            trace,
        });

        let duplicate = match self.transactions.entry(context_id) {
            Entry::Occupied(_) => Some(entry),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&entry));
                self.active.fetch_add(1, Ordering::AcqRel);
                None
            }
        };
        if let Some(duplicate) = duplicate {
            // Lost a race with a concurrent begin on the same context.
            debug!(context_id, "Concurrent begin on the same context, discarding duplicate");
            let _ = resolve(&self.tracer, duplicate, TransactionState::RolledBack, None).await;
            return Ok(());
        }
        if self.is_closed() {
            // Registered after close drained the map.
            if let Some(entry) = self.take(context_id) {
                let state = TransactionState::DisposeRolledBack;
                if let Err(e) = resolve(&self.tracer, entry, state, None).await {
                    warn!(context_id, error = %e, "Dispose auto-rollback failed");
                }
            }
            return Err(DbError::transaction("Transaction coordinator is closed", context_id));
        }

        info!(
            context_id,
            timeout_secs = timeout.as_secs(),
            isolation = ?isolation,
            pool = %master.name(),
            "Transaction started"
        );
        Ok(())
    }

    /// Commit and unbind the context's transaction. No transaction is a no-op.
    pub async fn commit_transaction(&self, context_id: u64) -> DbResult<()> {
        self.resolve_context(context_id, TransactionState::Committed, None)
            .await
    }

    /// Roll back and unbind the context's transaction. No transaction is a no-op.
    ///
    /// `cause` is recorded on the trace event.
    pub async fn rollback_transaction(
        &self,
        context_id: u64,
        cause: Option<&DbError>,
    ) -> DbResult<()> {
        self.resolve_context(
            context_id,
            TransactionState::RolledBack,
            cause.map(|e| e.to_string()),
        )
        .await
    }

    async fn resolve_context(
        &self,
        context_id: u64,
        state: TransactionState,
        cause: Option<String>,
    ) -> DbResult<()> {
        let Some(entry) = self.take(context_id) else {
            debug!(context_id, remark = state.remark(), "No active transaction");
            return Ok(());
        };
        resolve(&self.tracer, entry, state, cause).await
    }

    fn take(&self, context_id: u64) -> Option<Arc<ActiveTransaction<D>>> {
        let (_, entry) = self.transactions.remove(&context_id)?;
        self.active.fetch_sub(1, Ordering::AcqRel);
        Some(entry)
    }

    /// Exclusive access to the context's transaction connection, if any.
    pub async fn transaction_connection(
        &self,
        context_id: u64,
    ) -> Option<TransactionConnection<D>> {
        if self.active.load(Ordering::Acquire) == 0 {
            return None;
        }
        let entry = self
            .transactions
            .get(&context_id)
            .map(|entry| Arc::clone(entry.value()))?;
        let guard = Arc::clone(&entry.connection).lock_owned().await;
        Some(TransactionConnection {
            context_id,
            driver: Arc::clone(&entry.driver),
            guard,
        })
    }

    /// Commit every transaction that outlived its timeout. Returns how many.
    pub async fn sweep_expired(&self) -> usize {
        if self.active.load(Ordering::Acquire) == 0 {
            return 0;
        }
        let expired: Vec<u64> = self
            .transactions
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| *entry.key())
            .collect();

        let mut swept = 0;
        for context_id in expired {
            let Some((_, entry)) = self
                .transactions
                .remove_if(&context_id, |_, entry| entry.is_expired())
            else {
                continue;
            };
            self.active.fetch_sub(1, Ordering::AcqRel);
            warn!(
                context_id,
                timeout_secs = entry.timeout.as_secs(),
                "Transaction timed out, committing"
            );
            let state = TransactionState::TimeoutCommitted;
            if let Err(e) = resolve(&self.tracer, entry, state, None).await {
                warn!(context_id, error = %e, "Timeout auto-commit failed");
            }
            swept += 1;
        }
        swept
    }

    /// Sweep expired transactions every `interval` until closed or dropped.
    ///
    /// Returns `false` when called outside a tokio runtime.
    pub fn start_sweep_task(self: &Arc<Self>, interval: Duration) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    return;
                };
                if coordinator.is_closed() {
                    return;
                }
                coordinator.sweep_expired().await;
            }
        });
        let mut slot = self.sweep_handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
        true
    }

    /// Run `work` inside a transaction bound to `context_id`.
    ///
    /// Commits on `Ok`, rolls back on `Err` or panic (the panic is resumed).
    /// When the context already has a transaction, `work` joins it and the
    /// outer owner resolves it.
    pub async fn transaction<F, Fut, T>(
        &self,
        context_id: u64,
        timeout: Option<Duration>,
        isolation: Option<IsolationLevel>,
        work: F,
    ) -> DbResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        if self.has_transaction(context_id) {
            return work().await;
        }
        self.begin_transaction(context_id, timeout, isolation).await?;

        match AssertUnwindSafe(work()).catch_unwind().await {
            Ok(Ok(value)) => {
                self.commit_transaction(context_id).await?;
                Ok(value)
            }
            Ok(Err(e)) => {
                if let Err(rollback_err) = self.rollback_transaction(context_id, Some(&e)).await {
                    warn!(context_id, error = %rollback_err, "Rollback after failure also failed");
                }
                Err(e)
            }
            Err(panic) => {
                let cause = DbError::internal("unit of work panicked");
                if let Err(rollback_err) = self.rollback_transaction(context_id, Some(&cause)).await
                {
                    warn!(context_id, error = %rollback_err, "Rollback after panic failed");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    fn drain(&self) -> Vec<Arc<ActiveTransaction<D>>> {
        let ids: Vec<u64> = self.transactions.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter_map(|id| self.take(id)).collect()
    }

    fn stop_sweep(&self) {
        let mut slot = self.sweep_handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    /// Roll back every active transaction and return its connection to its
    /// pool, leaving the pools open. Returns how many were rolled back.
    pub async fn dispose_transactions(&self) -> usize {
        let pending = self.drain();
        let count = pending.len();
        for entry in pending {
            let context_id = entry.context_id;
            let state = TransactionState::DisposeRolledBack;
            if let Err(e) = resolve(&self.tracer, entry, state, None).await {
                warn!(context_id, error = %e, "Dispose auto-rollback failed");
            }
        }
        count
    }

    /// Roll back every active transaction, then close all pools.
    ///
    /// Idempotent; only the first call does the work.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_sweep();
        let count = self.dispose_transactions().await;
        self.router.close().await;
        info!(rolled_back = count, "Transaction coordinator closed");
    }
}

/// Resolve one removed entry: commit or roll back, trace, release.
async fn resolve<D: Driver>(
    tracer: &Tracer,
    entry: Arc<ActiveTransaction<D>>,
    state: TransactionState,
    cause: Option<String>,
) -> DbResult<()> {
    let remark = state.remark();
    let context_id = entry.context_id;
    let Some(mut conn) = entry.connection.lock().await.take() else {
        return Ok(());
    };

    let broken = conn.health() == HealthState::Broken;
    let result = if broken {
        // Destroying the connection discards the server-side transaction.
        if state.commits() {
            Err(DbError::transaction(
                "Transaction connection broke; its changes were discarded",
                context_id,
            ))
        } else {
            Ok(())
        }
    } else if state.commits() {
        entry.driver.commit(&mut *conn).await
    } else {
        entry.driver.rollback(&mut *conn).await
    };

    if result.is_ok() && !broken {
        conn.set_health(HealthState::Healthy);
    }
    conn.release(result.as_ref().err()).await;

    let error = result.as_ref().err().map(|e| e.to_string()).or(cause);
    tracer.after(&TraceAfterEvent::new(&entry.trace, remark, error));

    match result {
        Ok(()) => {
            info!(
                context_id,
                remark,
                elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                "Transaction resolved"
            );
            Ok(())
        }
        Err(e) => Err(DbError::transaction_resolve(remark, context_id, e)),
    }
}

impl<D: Driver> Drop for TransactionCoordinator<D> {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_sweep();
        let pending = self.drain();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // Connections left in an unknown state are destroyed when dropped.
            return;
        };
        let tracer = self.tracer.clone();
        let router = Arc::clone(&self.router);
        runtime.spawn(async move {
            for entry in pending {
                let _ = resolve(&tracer, entry, TransactionState::DisposeRolledBack, None).await;
            }
            router.close().await;
        });
    }
}

impl<D: Driver> std::fmt::Debug for TransactionCoordinator<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("active", &self.count())
            .field("default_timeout", &self.default_timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

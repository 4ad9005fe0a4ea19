//! Unit of work.
//!
//! A [`UnitOfWork`] is a handle on one execution context that begins the
//! context's transaction lazily, the first time a write asks for it. The
//! handle only resolves a transaction it began itself; when the context
//! already had one, the unit joins it and leaves it to its owner. A unit
//! dropped with its own transaction still open rolls it back.

use crate::db::context::ExecutionContext;
use crate::db::driver::Driver;
use crate::db::transaction::TransactionCoordinator;
use crate::error::{DbError, DbResult};
use crate::models::IsolationLevel;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct UnitOfWork<D: Driver> {
    transactions: Arc<TransactionCoordinator<D>>,
    ctx: ExecutionContext,
    isolation: Option<IsolationLevel>,
    timeout: Option<Duration>,
    enabled: bool,
    /// This unit began the context's transaction and must resolve it
    owned: bool,
}

impl<D: Driver> UnitOfWork<D> {
    pub fn new(transactions: Arc<TransactionCoordinator<D>>, ctx: ExecutionContext) -> Self {
        Self {
            transactions,
            ctx,
            isolation: None,
            timeout: None,
            enabled: true,
            owned: false,
        }
    }

    /// Transaction timeout for the lazy begin; the coordinator default otherwise.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn context(&self) -> ExecutionContext {
        self.ctx
    }

    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    /// Takes effect at the next begin.
    pub fn set_isolation(&mut self, isolation: Option<IsolationLevel>) {
        self.isolation = isolation;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the context currently has a transaction this unit works in.
    pub fn is_active(&self) -> bool {
        self.enabled && self.transactions.has_transaction(self.ctx.id())
    }

    pub fn open(&mut self) {
        self.enabled = true;
    }

    /// Disable the unit. Fails once it has begun a transaction.
    pub fn close(&mut self) -> DbResult<()> {
        if self.owned {
            return Err(DbError::invalid_input(
                "Unit of work already began a transaction; commit or roll back before closing it",
            ));
        }
        self.enabled = false;
        Ok(())
    }

    /// Whether a transaction is in effect after the call.
    ///
    /// Joins the context's existing transaction, or begins one when `create` is
    /// set. A disabled unit never begins and reports `false`.
    pub async fn get_or_begin(&mut self, create: bool) -> DbResult<bool> {
        if !self.enabled {
            return Ok(false);
        }
        let context_id = self.ctx.id();
        if self.transactions.has_transaction(context_id) {
            return Ok(true);
        }
        if !create {
            return Ok(false);
        }
        self.transactions
            .begin_transaction(context_id, self.timeout, self.isolation)
            .await?;
        self.owned = true;
        debug!(context = %self.ctx, "Unit of work began a transaction");
        Ok(true)
    }

    /// Commit the transaction this unit began; a no-op otherwise.
    pub async fn commit(&mut self) -> DbResult<()> {
        if !std::mem::take(&mut self.owned) {
            return Ok(());
        }
        self.transactions.commit_transaction(self.ctx.id()).await
    }

    /// Roll back the transaction this unit began; a no-op otherwise.
    pub async fn rollback(&mut self) -> DbResult<()> {
        if !std::mem::take(&mut self.owned) {
            return Ok(());
        }
        self.transactions
            .rollback_transaction(self.ctx.id(), None)
            .await
    }
}

impl<D: Driver> Drop for UnitOfWork<D> {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        let context_id = self.ctx.id();
        if !self.transactions.has_transaction(context_id) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(context_id, "Unit of work dropped outside a runtime; the sweep will resolve it");
            return;
        };
        let transactions = Arc::clone(&self.transactions);
        runtime.spawn(async move {
            let cause = DbError::internal("unit of work dropped without commit");
            if let Err(e) = transactions.rollback_transaction(context_id, Some(&cause)).await {
                warn!(context_id, error = %e, "Unit of work rollback failed");
            }
        });
    }
}

impl<D: Driver> std::fmt::Debug for UnitOfWork<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("context", &self.ctx)
            .field("isolation", &self.isolation)
            .field("enabled", &self.enabled)
            .field("owned", &self.owned)
            .finish()
    }
}

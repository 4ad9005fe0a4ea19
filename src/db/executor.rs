//! Statement execution facade.
//!
//! [`DataAccess`] ties the router, the transaction coordinator and the trace
//! hooks together. Every statement runs on exactly one connection:
//! - the context's transaction connection when one is bound, otherwise
//! - a master connection for writes, or a router-chosen connection for reads.
//!
//! Each physical statement is bracketed by a `curd_before`/`curd_after` trace
//! pair and bounded by the command timeout.

use crate::config::{DataAccessConfig, DataSourceConfig};
use crate::db::batch::BatchLimits;
use crate::db::context::ExecutionContext;
use crate::db::driver::{Driver, PooledConnection};
use crate::db::insert::{BatchInsert, RowWriter};
use crate::db::router::ConnectionRouter;
use crate::db::transaction::{TransactionConnection, TransactionCoordinator};
use crate::db::types::identity_from_json;
use crate::db::unit_of_work::UnitOfWork;
use crate::error::{DbError, DbResult};
use crate::models::{CurdKind, DEFAULT_COMMAND_TIMEOUT_SECS, IsolationLevel, Statement, TableInfo};
use crate::trace::{CurdAfterEvent, CurdBeforeEvent, CurdValue, Tracer};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// The connection one operation runs on.
pub(crate) enum Lease<D: Driver> {
    Transaction(TransactionConnection<D>),
    Pooled(PooledConnection<D>),
}

impl<D: Driver> Lease<D> {
    fn driver(&self) -> Arc<D> {
        match self {
            Self::Transaction(tx) => Arc::clone(tx.driver()),
            Self::Pooled(conn) => Arc::clone(conn.manager().driver()),
        }
    }

    fn connection(&mut self) -> DbResult<&mut D::Connection> {
        match self {
            Self::Transaction(tx) => tx.connection(),
            Self::Pooled(conn) => Ok(&mut **conn),
        }
    }

    fn mark_broken(&mut self) {
        match self {
            Self::Transaction(tx) => tx.mark_broken(),
            Self::Pooled(conn) => conn.mark_broken(),
        }
    }

    /// Hand the connection back; transaction connections stay bound.
    pub(crate) async fn finish(self, error: Option<&DbError>) {
        match self {
            Self::Transaction(_) => {}
            Self::Pooled(conn) => conn.release(error).await,
        }
    }
}

enum Op<'s> {
    Affrows,
    Identity(Option<&'s str>),
    Scalar,
}

enum Outcome {
    Affrows(u64),
    Identity(Option<JsonValue>),
    Scalar(Option<JsonValue>),
}

impl Outcome {
    fn trace_value(&self) -> CurdValue {
        match self {
            Self::Affrows(n) => CurdValue::Affrows(*n),
            Self::Identity(v) => CurdValue::Identity(identity_from_json(v.as_ref())),
            Self::Scalar(v) => CurdValue::Scalar(v.clone()),
        }
    }

    fn affrows(self) -> u64 {
        match self {
            Self::Affrows(n) => n,
            _ => 0,
        }
    }

    fn identity(self) -> i64 {
        match self {
            Self::Identity(v) => identity_from_json(v.as_ref()),
            _ => 0,
        }
    }

    fn scalar(self) -> Option<JsonValue> {
        match self {
            Self::Scalar(v) => v,
            _ => None,
        }
    }
}

pub struct DataAccess<D: Driver> {
    router: Arc<ConnectionRouter<D>>,
    transactions: Arc<TransactionCoordinator<D>>,
    tracer: Tracer,
    command_timeout: Duration,
    batch_limits: BatchLimits,
}

impl<D: Driver> DataAccess<D> {
    pub fn new(router: ConnectionRouter<D>, tracer: Tracer) -> Self {
        let router = Arc::new(router);
        let db_type = router.master().manager().driver().database_type();
        let transactions = TransactionCoordinator::new(Arc::clone(&router), tracer.clone());
        Self {
            router,
            transactions: Arc::new(transactions),
            tracer,
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            batch_limits: BatchLimits::for_database(db_type),
        }
    }

    /// Build the full stack from configuration; `make_driver` opens nothing yet.
    ///
    /// Inside a tokio runtime the background timeout sweep starts at the
    /// configured interval.
    pub fn from_config(
        config: &DataAccessConfig,
        tracer: Tracer,
        make_driver: impl Fn(&DataSourceConfig) -> DbResult<D>,
    ) -> DbResult<Self> {
        let router = Arc::new(ConnectionRouter::from_config(config, make_driver)?);
        let db_type = router.master().manager().driver().database_type();
        let transactions = Arc::new(
            TransactionCoordinator::new(Arc::clone(&router), tracer.clone())
                .with_default_timeout(config.transaction_timeout_duration()),
        );
        if !transactions.start_sweep_task(config.sweep_interval_duration()) {
            debug!("No tokio runtime, timeout sweep runs only before each begin");
        }
        let limits = BatchLimits::new(config.batch_rows, config.batch_params)
            .or(BatchLimits::for_database(db_type));
        Ok(Self {
            router,
            transactions,
            tracer,
            command_timeout: config.command_timeout_duration(),
            batch_limits: limits,
        })
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Override batch limits; unset fields keep the provider defaults.
    pub fn with_batch_limits(mut self, limits: BatchLimits) -> Self {
        self.batch_limits = limits.or(self.batch_limits);
        self
    }

    /// Start (or restart) the periodic timeout sweep. Returns `false` outside
    /// a tokio runtime.
    pub fn start_sweep_task(&self, interval: Duration) -> bool {
        self.transactions.start_sweep_task(interval)
    }

    pub fn router(&self) -> &ConnectionRouter<D> {
        &self.router
    }

    pub fn transactions(&self) -> &TransactionCoordinator<D> {
        &self.transactions
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn batch_limits(&self) -> BatchLimits {
        self.batch_limits
    }

    pub async fn begin_transaction(
        &self,
        ctx: ExecutionContext,
        timeout: Option<Duration>,
        isolation: Option<IsolationLevel>,
    ) -> DbResult<()> {
        self.transactions
            .begin_transaction(ctx.id(), timeout, isolation)
            .await
    }

    pub async fn commit_transaction(&self, ctx: ExecutionContext) -> DbResult<()> {
        self.transactions.commit_transaction(ctx.id()).await
    }

    pub async fn rollback_transaction(
        &self,
        ctx: ExecutionContext,
        cause: Option<&DbError>,
    ) -> DbResult<()> {
        self.transactions.rollback_transaction(ctx.id(), cause).await
    }

    /// Run `work` in a transaction bound to `ctx`; see [`TransactionCoordinator::transaction`].
    pub async fn transaction<F, Fut, T>(
        &self,
        ctx: ExecutionContext,
        timeout: Option<Duration>,
        isolation: Option<IsolationLevel>,
        work: F,
    ) -> DbResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        self.transactions
            .transaction(ctx.id(), timeout, isolation, work)
            .await
    }

    /// Execute a raw write and return the affected row count.
    pub async fn execute(&self, ctx: ExecutionContext, stmt: &Statement) -> DbResult<u64> {
        self.execute_curd(ctx, None, CurdKind::Raw, stmt).await
    }

    /// Execute a write against `table` and return the affected row count.
    pub async fn execute_curd(
        &self,
        ctx: ExecutionContext,
        table: Option<&TableInfo>,
        kind: CurdKind,
        stmt: &Statement,
    ) -> DbResult<u64> {
        let mut lease = self.lease_for_write(ctx).await?;
        let result = self.run_affrows(&mut lease, table, kind, stmt).await;
        lease.finish(result.as_ref().err()).await;
        result
    }

    /// Execute an insert and return the generated identity (0 when none parses).
    pub async fn execute_identity(
        &self,
        ctx: ExecutionContext,
        table: &TableInfo,
        stmt: &Statement,
    ) -> DbResult<i64> {
        let mut lease = self.lease_for_write(ctx).await?;
        let result = self.run_identity(&mut lease, table, stmt).await;
        lease.finish(result.as_ref().err()).await;
        result
    }

    /// First column of the first row, read from a slave unless `ctx` is in a transaction.
    pub async fn query_scalar(
        &self,
        ctx: ExecutionContext,
        stmt: &Statement,
    ) -> DbResult<Option<JsonValue>> {
        let mut lease = self.lease_for_read(ctx).await?;
        let result = self
            .run(&mut lease, None, CurdKind::Select, stmt, Op::Scalar)
            .await
            .map(Outcome::scalar);
        lease.finish(result.as_ref().err()).await;
        result
    }

    /// Unit of work on the task's ambient context (see [`ExecutionContext::scope`]),
    /// or on a fresh context when none is installed.
    pub fn unit_of_work(&self) -> UnitOfWork<D> {
        self.unit_of_work_for(ExecutionContext::current_or_new())
    }

    pub fn unit_of_work_for(&self, ctx: ExecutionContext) -> UnitOfWork<D> {
        UnitOfWork::new(Arc::clone(&self.transactions), ctx)
    }

    /// Multi-row write over `rows`, split to respect the batch limits.
    pub fn insert<'a, W, R>(
        &'a self,
        ctx: ExecutionContext,
        writer: &'a W,
        rows: Vec<R>,
    ) -> BatchInsert<'a, D, W, R>
    where
        W: RowWriter<R>,
    {
        BatchInsert::new(self, ctx, writer, rows)
    }

    /// Roll back open transactions and close every pool. Idempotent.
    pub async fn close(&self) {
        self.transactions.close().await;
    }

    pub(crate) async fn lease_for_write(&self, ctx: ExecutionContext) -> DbResult<Lease<D>> {
        if let Some(tx) = self.transactions.transaction_connection(ctx.id()).await {
            return Ok(Lease::Transaction(tx));
        }
        let conn = self.router.get_for_write().acquire_for(ctx.id()).await?;
        Ok(Lease::Pooled(conn))
    }

    pub(crate) async fn lease_for_read(&self, ctx: ExecutionContext) -> DbResult<Lease<D>> {
        if let Some(tx) = self.transactions.transaction_connection(ctx.id()).await {
            return Ok(Lease::Transaction(tx));
        }
        let pool = self.router.get_for_read();
        debug!(context = %ctx, pool = %pool.name(), "Routing read");
        Ok(Lease::Pooled(pool.acquire_for(ctx.id()).await?))
    }

    pub(crate) async fn run_affrows(
        &self,
        lease: &mut Lease<D>,
        table: Option<&TableInfo>,
        kind: CurdKind,
        stmt: &Statement,
    ) -> DbResult<u64> {
        self.run(lease, table, kind, stmt, Op::Affrows)
            .await
            .map(Outcome::affrows)
    }

    pub(crate) async fn run_identity(
        &self,
        lease: &mut Lease<D>,
        table: &TableInfo,
        stmt: &Statement,
    ) -> DbResult<i64> {
        let column = table.identity_column.as_deref();
        self.run(lease, Some(table), CurdKind::Insert, stmt, Op::Identity(column))
            .await
            .map(Outcome::identity)
    }

    async fn run(
        &self,
        lease: &mut Lease<D>,
        table: Option<&TableInfo>,
        kind: CurdKind,
        stmt: &Statement,
        op: Op<'_>,
    ) -> DbResult<Outcome> {
        let before = CurdBeforeEvent::new(table, kind, &stmt.sql, &stmt.params);
        self.tracer.curd_before(&before);

        let driver = lease.driver();
        let result = match lease.connection() {
            Ok(conn) => {
                let call = async {
                    match op {
                        Op::Affrows => driver.execute(conn, stmt).await.map(Outcome::Affrows),
                        Op::Identity(column) => driver
                            .execute_identity(conn, stmt, column)
                            .await
                            .map(Outcome::Identity),
                        Op::Scalar => driver.query_scalar(conn, stmt).await.map(Outcome::Scalar),
                    }
                };
                match timeout(self.command_timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(DbError::timeout("command execution", self.command_timeout)),
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            if matches!(e, DbError::Timeout { .. }) {
                // The statement may still be running on the server.
                lease.mark_broken();
            }
            warn!(kind = %kind, error = %e, "Statement failed");
        }

        let (error, value) = match &result {
            Ok(outcome) => (None, outcome.trace_value()),
            Err(e) => (Some(e.to_string()), CurdValue::None),
        };
        self.tracer
            .curd_after(&CurdAfterEvent::new(&before, error, value));
        result
    }
}

impl<D: Driver> std::fmt::Debug for DataAccess<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataAccess")
            .field("router", &self.router)
            .field("transactions", &self.transactions)
            .field("command_timeout", &self.command_timeout)
            .field("batch_limits", &self.batch_limits)
            .finish()
    }
}

//! Multi-row inserts split into provider-safe statements.
//!
//! A [`BatchInsert`] plans its rows with [`BatchPlan`], renders one statement
//! per group through a [`RowWriter`] and runs the groups in order on a single
//! connection: the context's transaction connection when one is bound,
//! otherwise one master connection held for the whole batch. No implicit
//! transaction is opened; when a group fails the earlier groups stay applied
//! unless the caller wrapped the batch in a transaction.

use crate::db::batch::{BatchLimits, BatchPlan};
use crate::db::context::ExecutionContext;
use crate::db::driver::Driver;
use crate::db::executor::{DataAccess, Lease};
use crate::error::{DbError, DbResult};
use crate::models::{CurdKind, Statement, TableInfo};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Renders rows of `R` into insert statements.
pub trait RowWriter<R>: Send + Sync {
    fn table(&self) -> &TableInfo;

    /// Bind parameters one row contributes.
    fn parameter_count(&self, row: &R) -> usize;

    /// One multi-row statement for `rows`, which is never empty.
    fn to_statement(&self, rows: &[R]) -> DbResult<Statement>;
}

pub struct BatchInsert<'a, D: Driver, W, R> {
    db: &'a DataAccess<D>,
    ctx: ExecutionContext,
    writer: &'a W,
    rows: Vec<R>,
    limits: BatchLimits,
    reject_oversized: bool,
}

impl<'a, D, W, R> BatchInsert<'a, D, W, R>
where
    D: Driver,
    W: RowWriter<R>,
{
    pub fn new(db: &'a DataAccess<D>, ctx: ExecutionContext, writer: &'a W, rows: Vec<R>) -> Self {
        Self {
            db,
            ctx,
            writer,
            rows,
            limits: db.batch_limits(),
            reject_oversized: false,
        }
    }

    /// Override limits for this batch; unset fields keep the configured ones.
    pub fn with_limits(mut self, limits: BatchLimits) -> Self {
        self.limits = limits.or(self.limits);
        self
    }

    /// Fail before executing anything when a single row exceeds the parameter limit.
    pub fn reject_oversized(mut self, reject: bool) -> Self {
        self.reject_oversized = reject;
        self
    }

    pub fn rows(&self) -> &[R] {
        &self.rows
    }

    pub fn plan(&self) -> BatchPlan {
        BatchPlan::for_rows(&self.rows, |row| self.writer.parameter_count(row), self.limits)
    }

    /// Total affected rows over every group.
    pub async fn execute_affrows(self) -> DbResult<u64> {
        let plan = self.checked_plan()?;
        if plan.is_empty() {
            return Ok(0);
        }
        let lease = Mutex::new(self.db.lease_for_write(self.ctx).await?);
        let (db, writer, lease_ref) = (self.db, self.writer, &lease);
        let result = plan
            .execute_affrows_async(&self.rows, move |chunk| async move {
                let stmt = writer.to_statement(chunk)?;
                let mut lease = lease_ref.lock().await;
                db.run_affrows(&mut lease, Some(writer.table()), CurdKind::Insert, &stmt)
                    .await
            })
            .await;
        finish(lease, result).await
    }

    /// Identity produced by the last group; the earlier groups run as plain inserts.
    pub async fn execute_identity(self) -> DbResult<i64> {
        let plan = self.checked_plan()?;
        if plan.is_empty() {
            return Ok(0);
        }
        let lease = Mutex::new(self.db.lease_for_write(self.ctx).await?);
        let (db, writer, lease_ref) = (self.db, self.writer, &lease);
        let result = plan
            .execute_identity_async(
                &self.rows,
                move |chunk| async move {
                    let stmt = writer.to_statement(chunk)?;
                    let mut lease = lease_ref.lock().await;
                    db.run_affrows(&mut lease, Some(writer.table()), CurdKind::Insert, &stmt)
                        .await
                },
                move |chunk| async move {
                    let stmt = writer.to_statement(chunk)?;
                    let mut lease = lease_ref.lock().await;
                    db.run_identity(&mut lease, writer.table(), &stmt).await
                },
            )
            .await;
        finish(lease, result).await
    }

    /// Insert every group and hand the input rows back.
    pub async fn execute_inserted(self) -> DbResult<Vec<R>>
    where
        R: Clone,
    {
        let plan = self.checked_plan()?;
        if plan.is_empty() {
            return Ok(Vec::new());
        }
        let lease = Mutex::new(self.db.lease_for_write(self.ctx).await?);
        let (db, writer, lease_ref) = (self.db, self.writer, &lease);
        let result = plan
            .execute_inserted_async(&self.rows, move |chunk| async move {
                let stmt = writer.to_statement(chunk)?;
                let mut lease = lease_ref.lock().await;
                db.run_affrows(&mut lease, Some(writer.table()), CurdKind::Insert, &stmt)
                    .await
            })
            .await;
        finish(lease, result).await
    }

    fn checked_plan(&self) -> DbResult<BatchPlan> {
        let plan = self.plan();
        let table = &self.writer.table().table;
        let (_, max_params) = self.limits.resolve();
        for group in plan.oversized() {
            if self.reject_oversized {
                return Err(DbError::invalid_input(format!(
                    "row {} of {} binds {} parameters, over the limit of {}",
                    group.start, table, group.params, max_params
                )));
            }
            warn!(
                table = %table,
                row = group.start,
                params = group.params,
                max_params,
                "Row exceeds the parameter limit, executing it alone"
            );
        }
        debug!(
            table = %table,
            rows = plan.total_rows(),
            groups = plan.len(),
            "Planned batch insert"
        );
        Ok(plan)
    }
}

async fn finish<D: Driver, T>(lease: Mutex<Lease<D>>, result: DbResult<T>) -> DbResult<T> {
    lease.into_inner().finish(result.as_ref().err()).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::PoolConfig;
    use crate::db::router::ConnectionRouter;
    use crate::models::Param;
    use crate::testing::{Failure, RecordingHook, ScriptedDriver};
    use crate::trace::{CurdValue, Tracer};
    use std::sync::Arc;
    use std::time::Duration;

    /// Rows are integers; values above 100 pretend to bind 2000 parameters.
    struct Items {
        table: TableInfo,
    }

    impl Items {
        fn new() -> Self {
            Self {
                table: TableInfo::new("Item", "items").with_identity("id"),
            }
        }
    }

    impl RowWriter<i64> for Items {
        fn table(&self) -> &TableInfo {
            &self.table
        }

        fn parameter_count(&self, row: &i64) -> usize {
            if *row > 100 { 2000 } else { 1 }
        }

        fn to_statement(&self, rows: &[i64]) -> DbResult<Statement> {
            let values: Vec<_> = rows.iter().map(|r| format!("({r}, ?)")).collect();
            Ok(Statement::new(format!("INSERT INTO items VALUES {}", values.join(", ")))
                .with_params(rows.iter().map(|r| Param::Int(*r))))
        }
    }

    fn setup() -> (ScriptedDriver, Arc<RecordingHook>, DataAccess<ScriptedDriver>) {
        let driver = ScriptedDriver::new("master");
        let hook = Arc::new(RecordingHook::default());
        let router = ConnectionRouter::new(
            PoolConfig::new("master", 2)
                .with_acquire_timeout(Duration::from_millis(200))
                .with_recovery_interval(None),
            driver.clone(),
        );
        let db = DataAccess::new(router, Tracer::new().with_hook(hook.clone()))
            .with_batch_limits(BatchLimits::new(Some(3), None));
        (driver, hook, db)
    }

    fn rows(n: i64) -> Vec<i64> {
        (1..=n).collect()
    }

    #[tokio::test]
    async fn test_affrows_sums_groups_on_one_connection() {
        let (driver, hook, db) = setup();
        let items = Items::new();

        let affected = db
            .insert(ExecutionContext::new(), &items, rows(10))
            .execute_affrows()
            .await
            .unwrap();

        assert_eq!(affected, 10);
        assert_eq!(driver.connects(), 1);
        let executions = driver.executions();
        assert_eq!(executions.len(), 4);
        assert!(executions.iter().all(|(id, _)| *id == executions[0].0));
        assert_eq!(
            hook.curd_values(),
            vec![
                CurdValue::Affrows(3),
                CurdValue::Affrows(3),
                CurdValue::Affrows(3),
                CurdValue::Affrows(1)
            ]
        );
        assert_eq!(db.router().master().idle_count(), 1);
    }

    #[tokio::test]
    async fn test_identity_comes_from_last_group() {
        let (driver, hook, db) = setup();
        let items = Items::new();

        let id = db
            .insert(ExecutionContext::new(), &items, rows(5))
            .execute_identity()
            .await
            .unwrap();

        assert_eq!(id, 2);
        assert_eq!(driver.statements().len(), 2);
        assert_eq!(
            hook.curd_values(),
            vec![CurdValue::Affrows(3), CurdValue::Identity(2)]
        );
    }

    #[tokio::test]
    async fn test_inserted_returns_input_rows() {
        let (_driver, _hook, db) = setup();
        let items = Items::new();

        let inserted = db
            .insert(ExecutionContext::new(), &items, rows(4))
            .execute_inserted()
            .await
            .unwrap();
        assert_eq!(inserted, rows(4));
    }

    #[tokio::test]
    async fn test_empty_batch_touches_nothing() {
        let (driver, hook, db) = setup();
        let items = Items::new();
        let ctx = ExecutionContext::new();

        assert_eq!(db.insert(ctx, &items, vec![]).execute_affrows().await.unwrap(), 0);
        assert_eq!(db.insert(ctx, &items, vec![]).execute_identity().await.unwrap(), 0);
        assert!(db.insert(ctx, &items, vec![]).execute_inserted().await.unwrap().is_empty());
        assert_eq!(driver.connects(), 0);
        assert!(hook.curd_values().is_empty());
    }

    #[tokio::test]
    async fn test_failed_group_stops_the_batch() {
        let (driver, _hook, db) = setup();
        let items = Items::new();
        driver.fail_statement("(7,", Failure::Statement);

        let err = db
            .insert(ExecutionContext::new(), &items, rows(10))
            .execute_affrows()
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Database { .. }));
        assert_eq!(driver.statements().len(), 3);
    }

    #[tokio::test]
    async fn test_batch_joins_context_transaction() {
        let (driver, _hook, db) = setup();
        let items = Items::new();
        let ctx = ExecutionContext::new();

        db.begin_transaction(ctx, None, None).await.unwrap();
        db.insert(ctx, &items, rows(7)).execute_affrows().await.unwrap();
        db.rollback_transaction(ctx, None).await.unwrap();

        let executions = driver.executions();
        assert_eq!(executions.first().map(|e| e.1.as_str()), Some("BEGIN"));
        assert_eq!(executions.last().map(|e| e.1.as_str()), Some("ROLLBACK"));
        assert!(executions.iter().all(|(id, _)| *id == executions[0].0));
    }

    #[tokio::test]
    async fn test_oversized_row_runs_alone_or_is_rejected() {
        let (driver, _hook, db) = setup();
        let items = Items::new();
        let input = vec![1, 2, 500, 3];

        let plan = db.insert(ExecutionContext::new(), &items, input.clone()).plan();
        assert_eq!(plan.oversized().count(), 1);

        let err = db
            .insert(ExecutionContext::new(), &items, input.clone())
            .reject_oversized(true)
            .execute_affrows()
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
        assert!(driver.statements().is_empty());

        let affected = db
            .insert(ExecutionContext::new(), &items, input)
            .execute_affrows()
            .await
            .unwrap();
        assert_eq!(affected, 4);
        assert_eq!(driver.statements().len(), 3);
    }
}

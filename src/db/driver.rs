//! Driver seam between the runtime and a concrete database client.
//!
//! The pool, router and transaction coordinator only know [`Driver`]. The
//! sqlx-backed implementation lives in [`crate::db::sqlx_driver`]; tests plug
//! in scripted drivers.

use crate::db::pool::{ObjectPool, Pooled, ResourceManager};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, IsolationLevel, Statement};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// A database client for one data source.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn database_type(&self) -> DatabaseType;

    /// Open a new connection.
    async fn connect(&self) -> DbResult<Self::Connection>;

    /// Cheap liveness check.
    async fn ping(&self, conn: &mut Self::Connection) -> DbResult<()>;

    /// Start a transaction, optionally at an explicit isolation level.
    async fn begin(
        &self,
        conn: &mut Self::Connection,
        isolation: Option<IsolationLevel>,
    ) -> DbResult<()>;

    async fn commit(&self, conn: &mut Self::Connection) -> DbResult<()>;

    async fn rollback(&self, conn: &mut Self::Connection) -> DbResult<()>;

    /// Execute a statement and return the affected row count.
    async fn execute(&self, conn: &mut Self::Connection, stmt: &Statement) -> DbResult<u64>;

    /// Execute an insert and return the generated identity of its last row.
    ///
    /// `identity_column` names the auto-generated column for backends that
    /// need it spelled out (`RETURNING`).
    async fn execute_identity(
        &self,
        conn: &mut Self::Connection,
        stmt: &Statement,
        identity_column: Option<&str>,
    ) -> DbResult<Option<JsonValue>>;

    /// First column of the first row, if any.
    async fn query_scalar(
        &self,
        conn: &mut Self::Connection,
        stmt: &Statement,
    ) -> DbResult<Option<JsonValue>>;

    /// Close a connection. Failures are logged, not returned.
    async fn close(&self, conn: Self::Connection);

    /// Whether `error` leaves the connection unusable.
    fn is_fatal(&self, error: &DbError) -> bool {
        error.is_connection_fatal()
    }
}

/// Adapts a [`Driver`] to the pool's [`ResourceManager`].
pub struct DriverManager<D: Driver> {
    driver: Arc<D>,
}

impl<D: Driver> DriverManager<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }
}

#[async_trait]
impl<D: Driver> ResourceManager for DriverManager<D> {
    type Resource = D::Connection;

    async fn create(&self) -> DbResult<D::Connection> {
        self.driver.connect().await
    }

    async fn check(&self, resource: &mut D::Connection) -> DbResult<()> {
        self.driver.ping(resource).await
    }

    async fn destroy(&self, resource: D::Connection) {
        self.driver.close(resource).await;
    }

    fn is_fatal(&self, error: &DbError) -> bool {
        self.driver.is_fatal(error)
    }
}

/// Pool of driver connections.
pub type ConnectionPool<D> = ObjectPool<DriverManager<D>>;

/// A connection checked out of a [`ConnectionPool`].
pub type PooledConnection<D> = Pooled<DriverManager<D>>;

//! Data access layer.
//!
//! This module provides:
//! - A generic bounded object pool with health tracking
//! - The driver seam and its sqlx-backed implementation
//! - Master/slave routing
//! - Context-bound transactions and units of work
//! - Batch splitting and multi-row inserts
//! - The [`DataAccess`] execution facade

pub mod batch;
pub mod context;
pub mod driver;
pub mod executor;
pub mod insert;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod router;
pub mod sqlx_driver;
pub mod transaction;
pub mod types;
pub mod unit_of_work;

pub use batch::{BatchGroup, BatchLimits, BatchPlan};
pub use context::ExecutionContext;
pub use driver::{ConnectionPool, Driver, DriverManager, PooledConnection};
pub use executor::DataAccess;
pub use insert::{BatchInsert, RowWriter};
pub use pool::{HealthState, ObjectPool, PoolConfig, PoolStats, Pooled, ResourceManager};
pub use router::ConnectionRouter;
pub use sqlx_driver::{SqlxConnection, SqlxDriver};
pub use transaction::{TransactionConnection, TransactionCoordinator, TransactionMetadata};
pub use unit_of_work::UnitOfWork;

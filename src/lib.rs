//! Database access core.
//!
//! Pooled connections, master/slave routing, transactions bound to an
//! execution context, and batch splitting of large multi-row writes, for
//! SQLite, PostgreSQL and MySQL through sqlx.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod trace;

#[cfg(test)]
pub(crate) mod testing;

pub use config::DataAccessConfig;
pub use db::{DataAccess, ExecutionContext, UnitOfWork};
pub use error::{DbError, DbResult};
pub use trace::{TraceHook, Tracer};

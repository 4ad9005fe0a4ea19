//! Data models for the data-access runtime.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{DatabaseType, IsolationLevel, TransactionState, mask_connection_string};
pub use query::{CurdKind, DEFAULT_COMMAND_TIMEOUT_SECS, Param, Statement, TableInfo};

//! Connection-related data models.
//!
//! This module defines the database engine kinds, transaction isolation levels
//! and transaction states shared by the pool, router and coordinator.

use serde::{Deserialize, Serialize};

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Safe rows-per-statement limit used when the caller supplies none.
    pub fn default_batch_rows(&self) -> usize {
        5000
    }

    /// Safe bind-parameters-per-statement limit used when the caller supplies none.
    pub fn default_batch_params(&self) -> usize {
        match self {
            Self::SQLite => 999,
            Self::PostgreSQL | Self::MySQL => 3000,
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Transaction isolation level requested at begin time.
///
/// `None` at the call site means the provider default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling of the level, as used in `SET TRANSACTION ISOLATION LEVEL`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// How a context-bound transaction ended (or that it has not).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    /// Committed by the sweep because it outlived its timeout
    TimeoutCommitted,
    /// Rolled back because the coordinator was closed while it was active
    DisposeRolledBack,
}

impl TransactionState {
    /// Check if the transaction is still active.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if the transaction has ended.
    pub fn is_ended(&self) -> bool {
        !self.is_active()
    }

    /// Remark carried by trace events for this resolution.
    pub fn remark(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Committed => "commit",
            Self::RolledBack => "rollback",
            Self::TimeoutCommitted => "timeout auto-commit",
            Self::DisposeRolledBack => "dispose auto-rollback",
        }
    }

    /// Whether the resolution commits the underlying transaction.
    pub fn commits(&self) -> bool {
        matches!(self, Self::Committed | Self::TimeoutCommitted)
    }
}

/// Display-safe version of a connection string (credentials masked).
pub fn mask_connection_string(connection_string: &str) -> String {
    // Simple masking: replace password in URL
    if let Some(at_pos) = connection_string.find('@') {
        if let Some(colon_pos) = connection_string[..at_pos].rfind(':') {
            // "scheme://user@host" has no password
            if !connection_string[colon_pos + 1..].starts_with("//") {
                let prefix = &connection_string[..colon_pos + 1];
                let suffix = &connection_string[at_pos..];
                return format!("{}****{}", prefix, suffix);
            }
        }
    }
    connection_string.to_string()
}

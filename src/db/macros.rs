//! Backend dispatch macros.
//!
//! [`impl_conn_dispatch!`] expands to a `match` over the variants of
//! [`SqlxConnection`](crate::db::sqlx_driver::SqlxConnection), so each driver
//! operation reads as one arm per backend.

/// Generate match arms over `SqlxConnection` variants.
///
/// # Example
///
/// ```ignore
/// impl_conn_dispatch!(conn, {
///     MySql(c) => c.ping().await,
///     Postgres(c) => c.ping().await,
///     SQLite(c) => c.ping().await,
/// });
/// ```
#[macro_export]
macro_rules! impl_conn_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::sqlx_driver::SqlxConnection::$variant($c) => $body,
            )+
        }
    };
}

pub use impl_conn_dispatch;

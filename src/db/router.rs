//! Master/slave connection routing.
//!
//! Writes and everything inside a transaction go to the master. Reads rotate
//! round-robin over the slaves the router currently believes are available,
//! and fall back to the master when there are none.

use crate::config::DataAccessConfig;
use crate::db::driver::{ConnectionPool, Driver, DriverManager};
use crate::db::pool::{ObjectPool, PoolConfig, PoolStats};
use crate::error::{DbError, DbResult};
use crate::models::mask_connection_string;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

pub struct ConnectionRouter<D: Driver> {
    master: ConnectionPool<D>,
    slaves: Vec<ConnectionPool<D>>,
    /// Slaves flagged unavailable by their pools' callbacks
    unavailable_slaves: Arc<AtomicUsize>,
    next_slave: AtomicUsize,
}

impl<D: Driver> ConnectionRouter<D> {
    /// Router over a master only.
    pub fn new(master: PoolConfig, driver: D) -> Self {
        Self {
            master: ObjectPool::new(master, DriverManager::new(driver)),
            slaves: Vec::new(),
            unavailable_slaves: Arc::new(AtomicUsize::new(0)),
            next_slave: AtomicUsize::new(0),
        }
    }

    /// Add a read slave; its availability changes are tracked by the router.
    pub fn with_slave(mut self, config: PoolConfig, driver: D) -> Self {
        let down = Arc::clone(&self.unavailable_slaves);
        let up = Arc::clone(&self.unavailable_slaves);
        let pool = ObjectPool::builder(config, DriverManager::new(driver))
            .on_unavailable(move |name| {
                let now = down.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(slave = %name, unavailable = now, "Slave removed from read rotation");
            })
            .on_recovered(move |name| {
                let _ = up.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
                info!(slave = %name, "Slave returned to read rotation");
            })
            .build();
        self.slaves.push(pool);
        self
    }

    /// Build master and slave pools from configuration.
    pub fn from_config(
        config: &DataAccessConfig,
        make_driver: impl Fn(&crate::config::DataSourceConfig) -> DbResult<D>,
    ) -> DbResult<Self> {
        let master = config.master_source().map_err(DbError::invalid_input)?;
        let is_sqlite = master.db_type == crate::models::DatabaseType::SQLite;
        let mut router = Self::new(
            PoolConfig::from_options(&master.id, &master.pool_options, is_sqlite),
            make_driver(&master)?,
        );
        for slave in config.slave_sources().map_err(DbError::invalid_input)? {
            debug!(
                slave = %slave.id,
                url = %mask_connection_string(&slave.connection_string),
                "Adding read replica"
            );
            router = router.with_slave(
                PoolConfig::from_options(&slave.id, &slave.pool_options, is_sqlite),
                make_driver(&slave)?,
            );
        }
        info!(
            master = %master.id,
            url = %mask_connection_string(&master.connection_string),
            slaves = router.slaves.len(),
            db_type = %master.db_type,
            "Connection router configured"
        );
        Ok(router)
    }

    pub fn master(&self) -> &ConnectionPool<D> {
        &self.master
    }

    pub fn slaves(&self) -> &[ConnectionPool<D>] {
        &self.slaves
    }

    /// Pool for writes, and for reads inside a transaction.
    pub fn get_for_write(&self) -> &ConnectionPool<D> {
        &self.master
    }

    /// Pool for a read outside a transaction.
    pub fn get_for_read(&self) -> &ConnectionPool<D> {
        let count = self.slaves.len();
        if count == 0 || self.unavailable_slaves.load(Ordering::Acquire) >= count {
            return &self.master;
        }
        let start = self.next_slave.fetch_add(1, Ordering::Relaxed) % count;
        (0..count)
            .map(|i| &self.slaves[(start + i) % count])
            .find(|pool| pool.is_available() && !pool.is_closed())
            .unwrap_or(&self.master)
    }

    pub fn unavailable_slaves(&self) -> usize {
        self.unavailable_slaves.load(Ordering::Acquire)
    }

    /// Create `min_size` connections in every pool.
    pub async fn warm_up(&self) -> usize {
        let mut created = self.master.warm_up().await;
        for slave in &self.slaves {
            created += slave.warm_up().await;
        }
        created
    }

    pub fn stats(&self) -> Vec<(String, PoolStats)> {
        std::iter::once(&self.master)
            .chain(self.slaves.iter())
            .map(|pool| (pool.name().to_string(), pool.stats()))
            .collect()
    }

    /// Close every pool. Idempotent.
    pub async fn close(&self) {
        self.master.close().await;
        for slave in &self.slaves {
            slave.close().await;
        }
    }
}

impl<D: Driver> std::fmt::Debug for ConnectionRouter<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRouter")
            .field("master", &self.master)
            .field("slaves", &self.slaves)
            .field("unavailable_slaves", &self.unavailable_slaves())
            .finish()
    }
}

//! Shared setup for the SQLite-backed integration tests.

#![allow(dead_code)]

use db_access_core::db::SqlxDriver;
use db_access_core::trace::{CurdAfterEvent, CurdValue, TraceAfterEvent, TraceHook};
use db_access_core::{DataAccess, DataAccessConfig, Tracer};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Install a test-writer subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn sqlite_url(dir: &TempDir, name: &str) -> String {
    sqlite_url_at(&dir.path().join(name))
}

pub fn sqlite_url_at(path: &Path) -> String {
    format!("sqlite:{}?max_connections=4&acquire_timeout=5", path.display())
}

pub fn open(config: &DataAccessConfig, hook: Arc<Recorder>) -> DataAccess<SqlxDriver> {
    DataAccess::from_config(config, Tracer::new().with_hook(hook), |source| {
        Ok(SqlxDriver::from_source(source))
    })
    .unwrap()
}

#[derive(Default)]
pub struct Recorder {
    remarks: Mutex<Vec<String>>,
    curd: Mutex<Vec<CurdValue>>,
}

impl Recorder {
    pub fn remarks(&self) -> Vec<String> {
        self.remarks.lock().unwrap().clone()
    }

    pub fn curd_values(&self) -> Vec<CurdValue> {
        self.curd.lock().unwrap().clone()
    }
}

impl TraceHook for Recorder {
    fn after(&self, event: &TraceAfterEvent) {
        self.remarks.lock().unwrap().push(event.remark.clone());
    }

    fn curd_after(&self, event: &CurdAfterEvent) {
        self.curd.lock().unwrap().push(event.value.clone());
    }
}

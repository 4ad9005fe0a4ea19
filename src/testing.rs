//! In-memory test doubles: a counting pool manager, a scripted driver and a
//! recording trace hook.

use crate::db::driver::Driver;
use crate::db::pool::ResourceManager;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, IsolationLevel, Statement};
use crate::trace::{CurdAfterEvent, CurdValue, TraceAfterEvent, TraceHook};
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Default)]
struct Counts {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    fail_creates: AtomicUsize,
    fail_checks: AtomicUsize,
    create_delay: Mutex<Option<Duration>>,
    check_delay: Mutex<Option<Duration>>,
}

/// Manager over plain integer resources.
#[derive(Debug, Clone, Default)]
pub struct CountingManager {
    counts: Arc<Counts>,
}

impl CountingManager {
    pub fn created(&self) -> usize {
        self.counts.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.counts.destroyed.load(Ordering::SeqCst)
    }

    pub fn fail_next_creates(&self, n: usize) {
        self.counts.fail_creates.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_checks(&self, n: usize) {
        self.counts.fail_checks.store(n, Ordering::SeqCst);
    }

    pub fn set_create_delay(&self, delay: Option<Duration>) {
        *self.counts.create_delay.lock().unwrap() = delay;
    }

    pub fn set_check_delay(&self, delay: Option<Duration>) {
        *self.counts.check_delay.lock().unwrap() = delay;
    }
}

async fn pause(delay: &Mutex<Option<Duration>>) {
    let delay = *delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl ResourceManager for CountingManager {
    type Resource = usize;

    async fn create(&self) -> DbResult<usize> {
        pause(&self.counts.create_delay).await;
        if take_one(&self.counts.fail_creates) {
            return Err(DbError::connection("connection refused", "start the server"));
        }
        Ok(self.counts.created.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn check(&self, _resource: &mut usize) -> DbResult<()> {
        pause(&self.counts.check_delay).await;
        if take_one(&self.counts.fail_checks) {
            return Err(DbError::connection("stale", "reconnect"));
        }
        Ok(())
    }

    async fn destroy(&self, _resource: usize) {
        self.counts.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// How an injected statement failure presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Connection-fatal
    Fatal,
    /// Ordinary database error; the connection stays usable
    Statement,
}

impl Failure {
    fn error(self, sql: &str) -> DbError {
        match self {
            Self::Fatal => {
                DbError::connection(format!("lost connection during {sql}"), "reconnect")
            }
            Self::Statement => {
                DbError::database(format!("rejected {sql}"), None, "fix the statement")
            }
        }
    }
}

#[derive(Debug)]
pub struct ScriptedConnection {
    pub id: usize,
    pub in_transaction: bool,
}

#[derive(Debug, Default)]
struct Script {
    next_id: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
    fail_connects: AtomicUsize,
    identity: AtomicI64,
    statements: Mutex<Vec<String>>,
    /// (connection id, sql)
    executions: Mutex<Vec<(usize, String)>>,
    isolations: Mutex<Vec<Option<IsolationLevel>>>,
    failures: Mutex<Vec<(String, Failure)>>,
    delay: Mutex<Option<Duration>>,
}

/// Driver that records what it is asked to do.
///
/// `execute` reports one affected row per parenthesised tuple in the SQL (at
/// least one); `query_scalar` returns the driver's name.
#[derive(Debug, Clone)]
pub struct ScriptedDriver {
    name: String,
    script: Arc<Script>,
}

impl ScriptedDriver {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Arc::default(),
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.script.statements.lock().unwrap().clone()
    }

    pub fn executions(&self) -> Vec<(usize, String)> {
        self.script.executions.lock().unwrap().clone()
    }

    pub fn isolations(&self) -> Vec<Option<IsolationLevel>> {
        self.script.isolations.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.script.connects.load(Ordering::SeqCst)
    }

    pub fn closed_connections(&self) -> usize {
        self.script.closes.load(Ordering::SeqCst)
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.script.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Fail the next statement containing `pattern`, once.
    pub fn fail_statement(&self, pattern: &str, failure: Failure) {
        self.script
            .failures
            .lock()
            .unwrap()
            .push((pattern.to_string(), failure));
    }

    /// Delay every statement execution.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.script.delay.lock().unwrap() = delay;
    }

    async fn run(&self, conn: &mut ScriptedConnection, sql: &str) -> DbResult<()> {
        let delay = *self.script.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.script.statements.lock().unwrap().push(sql.to_string());
        self.script
            .executions
            .lock()
            .unwrap()
            .push((conn.id, sql.to_string()));

        let injected = {
            let mut failures = self.script.failures.lock().unwrap();
            failures
                .iter()
                .position(|(pattern, _)| sql.contains(pattern.as_str()))
                .map(|i| failures.remove(i).1)
        };
        match injected {
            Some(failure) => Err(failure.error(sql)),
            None => Ok(()),
        }
    }

    fn affected(sql: &str) -> u64 {
        sql.matches('(').count().max(1) as u64
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    type Connection = ScriptedConnection;

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    async fn connect(&self) -> DbResult<ScriptedConnection> {
        if take_one(&self.script.fail_connects) {
            return Err(DbError::connection(
                format!("{} refused the connection", self.name),
                "start the server",
            ));
        }
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedConnection {
            id: self.script.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            in_transaction: false,
        })
    }

    async fn ping(&self, _conn: &mut ScriptedConnection) -> DbResult<()> {
        Ok(())
    }

    async fn begin(
        &self,
        conn: &mut ScriptedConnection,
        isolation: Option<IsolationLevel>,
    ) -> DbResult<()> {
        self.script.isolations.lock().unwrap().push(isolation);
        self.run(conn, "BEGIN").await?;
        conn.in_transaction = true;
        Ok(())
    }

    async fn commit(&self, conn: &mut ScriptedConnection) -> DbResult<()> {
        conn.in_transaction = false;
        self.run(conn, "COMMIT").await
    }

    async fn rollback(&self, conn: &mut ScriptedConnection) -> DbResult<()> {
        conn.in_transaction = false;
        self.run(conn, "ROLLBACK").await
    }

    async fn execute(&self, conn: &mut ScriptedConnection, stmt: &Statement) -> DbResult<u64> {
        self.run(conn, &stmt.sql).await?;
        Ok(Self::affected(&stmt.sql))
    }

    async fn execute_identity(
        &self,
        conn: &mut ScriptedConnection,
        stmt: &Statement,
        _identity_column: Option<&str>,
    ) -> DbResult<Option<JsonValue>> {
        self.run(conn, &stmt.sql).await?;
        let rows = Self::affected(&stmt.sql) as i64;
        let last = self.script.identity.fetch_add(rows, Ordering::SeqCst) + rows;
        Ok(Some(json!(last)))
    }

    async fn query_scalar(
        &self,
        conn: &mut ScriptedConnection,
        stmt: &Statement,
    ) -> DbResult<Option<JsonValue>> {
        self.run(conn, &stmt.sql).await?;
        Ok(Some(json!(self.name)))
    }

    async fn close(&self, _conn: ScriptedConnection) {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Trace hook that keeps every after-event.
#[derive(Debug, Default)]
pub struct RecordingHook {
    after: Mutex<Vec<TraceAfterEvent>>,
    curd: Mutex<Vec<CurdAfterEvent>>,
}

impl RecordingHook {
    pub fn remarks(&self) -> Vec<String> {
        self.after
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.remark.clone())
            .collect()
    }

    pub fn errors(&self) -> Vec<Option<String>> {
        self.after
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.error.clone())
            .collect()
    }

    pub fn curd_sql(&self) -> Vec<String> {
        self.curd
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.before.sql.clone())
            .collect()
    }

    pub fn curd_values(&self) -> Vec<CurdValue> {
        self.curd
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.value.clone())
            .collect()
    }
}

impl TraceHook for RecordingHook {
    fn after(&self, event: &TraceAfterEvent) {
        self.after.lock().unwrap().push(event.clone());
    }

    fn curd_after(&self, event: &CurdAfterEvent) {
        self.curd.lock().unwrap().push(event.clone());
    }
}

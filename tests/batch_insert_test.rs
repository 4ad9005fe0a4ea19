//! Integration tests for split multi-row inserts on SQLite.

mod common;

use common::{Recorder, init_tracing, open, sqlite_url};
use db_access_core::db::{BatchLimits, RowWriter};
use db_access_core::models::{Param, Statement, TableInfo};
use db_access_core::trace::CurdValue;
use db_access_core::{DataAccessConfig, DbError, DbResult, ExecutionContext};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
struct Reading {
    sensor: String,
    value: f64,
    ok: bool,
    taken_at: i64,
}

fn readings(n: usize) -> Vec<Reading> {
    (0..n)
        .map(|i| Reading {
            sensor: format!("s{}", i % 7),
            value: i as f64 / 2.0,
            ok: i % 3 != 0,
            taken_at: 1_700_000_000 + i as i64,
        })
        .collect()
}

struct ReadingWriter {
    table: TableInfo,
}

impl ReadingWriter {
    fn new() -> Self {
        Self {
            table: TableInfo::new("Reading", "readings")
                .with_columns(["sensor", "value", "ok", "taken_at"])
                .with_identity("id"),
        }
    }
}

impl RowWriter<Reading> for ReadingWriter {
    fn table(&self) -> &TableInfo {
        &self.table
    }

    fn parameter_count(&self, _row: &Reading) -> usize {
        self.table.columns.len()
    }

    fn to_statement(&self, rows: &[Reading]) -> DbResult<Statement> {
        let tuples = vec!["(?, ?, ?, ?)"; rows.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.table.table,
            self.table.columns.join(", "),
            tuples
        );
        let params = rows.iter().flat_map(|r| {
            [
                Param::from(r.sensor.as_str()),
                Param::Float(r.value),
                Param::Bool(r.ok),
                Param::Int(r.taken_at),
            ]
        });
        Ok(Statement::new(sql).with_params(params))
    }
}

const CREATE: &str = "CREATE TABLE readings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sensor TEXT NOT NULL,
    value REAL NOT NULL,
    ok INTEGER NOT NULL,
    taken_at INTEGER NOT NULL
)";

type SqlxAccess = db_access_core::DataAccess<db_access_core::db::SqlxDriver>;

async fn count(db: &SqlxAccess) -> serde_json::Value {
    db.query_scalar(
        ExecutionContext::new(),
        &Statement::new("SELECT COUNT(*) FROM readings"),
    )
    .await
    .unwrap()
    .unwrap_or_default()
}

#[tokio::test]
async fn test_twelve_thousand_rows_split_by_sqlite_defaults() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let hook = Arc::new(Recorder::default());
    let db = open(&DataAccessConfig::new(sqlite_url(&dir, "batch.db")), hook.clone());
    let ctx = ExecutionContext::new();
    db.execute(ctx, &Statement::new(CREATE)).await.unwrap();
    let writer = ReadingWriter::new();

    let batch = db.insert(ctx, &writer, readings(12_000));
    let plan = batch.plan();
    assert_eq!(plan.len(), 49);
    assert_eq!(plan.groups()[0].len, 249);
    assert_eq!(plan.groups()[48].len, 48);

    let affected = batch.execute_affrows().await.unwrap();
    assert_eq!(affected, 12_000);

    let statements = hook.curd_values();
    // CREATE TABLE, then one per group
    assert_eq!(statements.len(), 50);
    assert_eq!(statements[1], CurdValue::Affrows(249));
    assert_eq!(statements[49], CurdValue::Affrows(48));
    assert_eq!(count(&db).await, json!(12_000));
    db.close().await;
}

#[tokio::test]
async fn test_identity_is_last_inserted_row() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let db = open(
        &DataAccessConfig::new(sqlite_url(&dir, "batch.db")),
        Arc::default(),
    )
    .with_batch_limits(BatchLimits::new(Some(100), None));
    let ctx = ExecutionContext::new();
    db.execute(ctx, &Statement::new(CREATE)).await.unwrap();
    let writer = ReadingWriter::new();

    let id = db
        .insert(ctx, &writer, readings(250))
        .execute_identity()
        .await
        .unwrap();
    assert_eq!(id, 250);

    let inserted = db
        .insert(ctx, &writer, readings(3))
        .execute_inserted()
        .await
        .unwrap();
    assert_eq!(inserted, readings(3));
    assert_eq!(count(&db).await, json!(253));
    db.close().await;
}

#[tokio::test]
async fn test_failed_batch_in_transaction_leaves_nothing() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let db = open(
        &DataAccessConfig::new(sqlite_url(&dir, "batch.db")),
        Arc::default(),
    )
    .with_batch_limits(BatchLimits::new(Some(10), None));
    let setup = ExecutionContext::new();
    db.execute(setup, &Statement::new(CREATE)).await.unwrap();
    db.execute(
        setup,
        &Statement::new(
            "CREATE TRIGGER reject_late BEFORE INSERT ON readings \
             WHEN NEW.taken_at >= 1700000025 BEGIN SELECT RAISE(ABORT, 'too late'); END",
        ),
    )
    .await
    .unwrap();
    let writer = ReadingWriter::new();

    let ctx = ExecutionContext::new();
    let err = db
        .transaction(ctx, None, None, || async {
            db.insert(ctx, &writer, readings(40)).execute_affrows().await
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));
    assert!(!db.transactions().has_transaction(ctx.id()));
    assert_eq!(count(&db).await, json!(0));

    // Without a transaction the groups before the failure stay applied.
    let err = db
        .insert(ExecutionContext::new(), &writer, readings(40))
        .execute_affrows()
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));
    assert_eq!(count(&db).await, json!(20));
    db.close().await;
}

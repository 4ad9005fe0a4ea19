//! Row decoding helpers.
//!
//! Scalar reads return the first column of a row as JSON. Each backend gets
//! the same decode cascade: integers first, then floats, text and booleans,
//! so SQLite's loosely typed integers are not read as booleans.

use serde_json::Value as JsonValue;
use sqlx::Row;
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;

/// First-column access as JSON.
pub trait ScalarColumn {
    fn scalar_json(&self) -> JsonValue;
}

macro_rules! impl_scalar_column {
    ($($row:ty),+ $(,)?) => {
        $(
            impl ScalarColumn for $row {
                fn scalar_json(&self) -> JsonValue {
                    if self.is_empty() {
                        return JsonValue::Null;
                    }
                    if let Ok(v) = self.try_get::<Option<i64>, _>(0) {
                        return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
                    }
                    if let Ok(v) = self.try_get::<Option<i32>, _>(0) {
                        return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
                    }
                    if let Ok(v) = self.try_get::<Option<f64>, _>(0) {
                        return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
                    }
                    if let Ok(v) = self.try_get::<Option<String>, _>(0) {
                        return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
                    }
                    if let Ok(v) = self.try_get::<Option<bool>, _>(0) {
                        return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
                    }
                    JsonValue::Null
                }
            }
        )+
    };
}

impl_scalar_column!(MySqlRow, PgRow, SqliteRow);

/// Parse a generated key into an integer identity; anything else is 0.
pub fn identity_from_json(value: Option<&JsonValue>) -> i64 {
    match value {
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|v| i64::try_from(v).ok()))
            .unwrap_or(0),
        Some(JsonValue::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

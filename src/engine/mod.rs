// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Embedded query engine.
//!
//! One in-memory SQLite database per engine, reached through a single
//! connection behind an async mutex. Every statement, including iteration of
//! its result set, runs while holding that mutex, so two flows never
//! interleave statements against the engine.
//!
//! # Result shape
//!
//! Row-returning statements yield their columns and rows. Writes that touch
//! at least one row yield the synthetic `ok` table with one
//! `__ok_result__` column holding the affected count:
//!
//! ```text
//! INSERT INTO Jobs VALUES ('a', '1')
//!   -> table "ok", columns ["__ok_result__"], rows [[1]]
//! DELETE FROM Jobs WHERE id = 'zz'
//!   -> table "Jobs", columns [], rows []
//! ```
//!
//! # Bindings
//!
//! Statements bind by name (`WHERE id = :id`). Names are rewritten to
//! numbered parameters before execution; see [`sql_text::rewrite_named`].

pub mod sql_text;

use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, Executor, Row, Sqlite, TypeInfo, ValueRef};
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::metrics::{self, LatencyTimer};
use crate::storage::traits::{RowMap, StorageError};
pub use sql_text::{quote_ident, StatementKind};

/// Table name reported for writes that affected rows.
pub const OK_TABLE: &str = "ok";
/// Sole column of the [`OK_TABLE`] result.
pub const OK_COLUMN: &str = "__ok_result__";

/// Outcome of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub table_name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    /// Whether this is the synthetic result of a write that changed rows.
    #[must_use]
    pub fn is_ok_result(&self) -> bool {
        self.table_name == OK_TABLE && self.columns.len() == 1 && self.columns[0] == OK_COLUMN
    }

    /// Rows changed by a write; 0 for reads and no-op writes.
    #[must_use]
    pub fn rows_affected(&self) -> u64 {
        if !self.is_ok_result() {
            return 0;
        }
        self.rows
            .first()
            .and_then(|r| r.first())
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Rows as column-keyed maps.
    #[must_use]
    pub fn to_maps(&self) -> Vec<RowMap> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<RowMap>()
            })
            .collect()
    }
}

pub struct QueryEngine {
    database_name: String,
    conn: Mutex<SqliteConnection>,
}

impl QueryEngine {
    /// Create a fresh in-memory database.
    ///
    /// This is the one construction failure that callers treat as fatal.
    pub async fn new(database_name: impl Into<String>) -> Result<Self, StorageError> {
        let database_name = database_name.into();
        let conn = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .connect()
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to open embedded database: {}", e)))?;

        info!(database = %database_name, "Embedded query engine ready");
        Ok(Self {
            database_name,
            conn: Mutex::new(conn),
        })
    }

    #[must_use]
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub async fn query(&self, sql: &str) -> Result<QueryResult, StorageError> {
        self.query_with_bindings(sql, &RowMap::new()).await
    }

    /// Execute `sql` with `:name` parameters taken from `bindings`.
    ///
    /// A parameter with no binding is an error rather than a silent NULL.
    pub async fn query_with_bindings(
        &self,
        sql: &str,
        bindings: &RowMap,
    ) -> Result<QueryResult, StorageError> {
        let (rewritten, names) = sql_text::rewrite_named(sql);
        let mut values = Vec::with_capacity(names.len());
        for name in &names {
            match bindings.get(name) {
                Some(v) => values.push(v.clone()),
                None => return Err(StorageError::Query(format!("missing binding :{}", name))),
            }
        }

        let (kind, returns_rows) = sql_text::classify(sql);
        let _timer = LatencyTimer::new(kind.as_str());

        let result = {
            let mut conn = self.conn.lock().await;
            if returns_rows {
                fetch(&mut conn, &rewritten, &values).await
            } else {
                execute(&mut conn, sql, &rewritten, &values).await
            }
        };

        match &result {
            Ok(r) => {
                metrics::record_query(kind.as_str(), "success");
                debug!(operation = %kind, table = %r.table_name, rows = r.rows.len(), "Statement executed");
            }
            Err(e) => {
                metrics::record_query(kind.as_str(), "error");
                debug!(operation = %kind, error = %e, "Statement failed");
            }
        }
        result
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        let mut bindings = RowMap::new();
        bindings.insert("name".into(), Value::String(table.to_string()));
        let result = self
            .query_with_bindings(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = :name",
                &bindings,
            )
            .await?;
        Ok(!result.rows.is_empty())
    }

    /// Names of the triggers defined on `table`.
    pub async fn trigger_names(&self, table: &str) -> Result<Vec<String>, StorageError> {
        let mut bindings = RowMap::new();
        bindings.insert("table".into(), Value::String(table.to_string()));
        let result = self
            .query_with_bindings(
                "SELECT name FROM sqlite_master WHERE type = 'trigger' AND tbl_name = :table ORDER BY name",
                &bindings,
            )
            .await?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|r| r.into_iter().next())
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }
}

fn build<'q>(sql: &'q str, values: &'q [Value]) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let mut query = sqlx::query(sql).persistent(false);
    for value in values {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

async fn fetch(
    conn: &mut SqliteConnection,
    sql: &str,
    values: &[Value],
) -> Result<QueryResult, StorageError> {
    let rows = build(sql, values)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

    let columns: Vec<String> = match rows.first() {
        Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
        None => (&mut *conn)
            .describe(sql)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect(),
    };

    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        decoded.push(decode_row(row).map_err(|e| StorageError::Query(e.to_string()))?);
    }

    Ok(QueryResult {
        table_name: sql_text::primary_table_name(sql),
        columns,
        rows: decoded,
    })
}

async fn execute(
    conn: &mut SqliteConnection,
    original: &str,
    sql: &str,
    values: &[Value],
) -> Result<QueryResult, StorageError> {
    let affected = build(sql, values)
        .execute(&mut *conn)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?
        .rows_affected();

    if affected > 0 {
        Ok(QueryResult {
            table_name: OK_TABLE.to_string(),
            columns: vec![OK_COLUMN.to_string()],
            rows: vec![vec![Value::from(affected)]],
        })
    } else {
        Ok(QueryResult {
            table_name: sql_text::primary_table_name(original),
            ..Default::default()
        })
    }
}

/// Decode by the storage class of each value, not the declared column type.
fn decode_row(row: &SqliteRow) -> Result<Vec<Value>, sqlx::Error> {
    let mut values = Vec::with_capacity(row.len());
    for i in 0..row.len() {
        let class = {
            let raw = row.try_get_raw(i)?;
            if raw.is_null() {
                None
            } else {
                Some(raw.type_info().name().to_string())
            }
        };

        let value = match class.as_deref() {
            None | Some("NULL") => Value::Null,
            Some("INTEGER") | Some("BOOLEAN") => Value::from(row.try_get_unchecked::<i64, _>(i)?),
            Some("REAL") => serde_json::Number::from_f64(row.try_get_unchecked::<f64, _>(i)?)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Some("BLOB") => {
                let bytes: Vec<u8> = row.try_get_unchecked(i)?;
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            }
            Some(_) => Value::String(row.try_get_unchecked::<String, _>(i)?),
        };
        values.push(value);
    }
    Ok(values)
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! External SQL data source for pull/push flows.
//!
//! A flow's remote side is described by two statements: a `SELECT` that
//! yields the authoritative row set, and an upsert that writes one row back.
//! The upsert names its parameters after columns:
//!
//! ```sql
//! INSERT INTO Jobs (id, val) VALUES (:id, :val)
//!   ON DUPLICATE KEY UPDATE val = :val
//! ```
//!
//! Placeholders are rewritten to plain `?` and bound in order of
//! appearance, so the same statement works against MySQL and SQLite.
//! A column missing from the row binds `NULL`.
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver reports MySQL TEXT columns as BLOB, so text is read as
//! `Vec<u8>` when the `String` decode fails.

use async_trait::async_trait;
use serde_json::{Number, Value};
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Column, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::debug;

use super::traits::{RemoteSource, RowMap, StorageError};
use crate::engine::sql_text::rewrite_positional;
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// A statement with `:name` placeholders, pre-split for positional binding.
#[derive(Debug, Clone)]
struct NamedStatement {
    sql: String,
    names: Vec<String>,
}

impl NamedStatement {
    fn new(sql: &str) -> Self {
        let (sql, names) = rewrite_positional(sql);
        Self { sql, names }
    }

    fn bind<'q>(&'q self, row: &RowMap) -> Query<'q, Any, AnyArguments<'q>> {
        let mut query = sqlx::query(&self.sql);
        for name in &self.names {
            query = bind_value(query, row.get(name).unwrap_or(&Value::Null));
        }
        query
    }
}

fn bind_value<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    value: &Value,
) -> Query<'q, Any, AnyArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

/// Decode one column, trying the narrowest type first.
fn decode_column(row: &AnyRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v
            .map(|bytes| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    Value::Null
}

fn to_row_map(row: &AnyRow) -> RowMap {
    row.columns()
        .iter()
        .map(|column| (column.name().to_string(), decode_column(row, column.ordinal())))
        .collect()
}

pub struct SqlRemoteSource {
    pool: AnyPool,
    select: String,
    upsert: NamedStatement,
    delete: Option<NamedStatement>,
}

impl SqlRemoteSource {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn connect(
        connection_string: &str,
        select_sql: &str,
        upsert_sql: &str,
    ) -> Result<Self, StorageError> {
        install_drivers();

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        Ok(Self::from_pool(pool, select_sql, upsert_sql))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: AnyPool, select_sql: &str, upsert_sql: &str) -> Self {
        install_drivers();
        Self {
            pool,
            select: select_sql.to_string(),
            upsert: NamedStatement::new(upsert_sql),
            delete: None,
        }
    }

    /// Statement run for deleted-row markers, usually keyed on `:changedId`.
    ///
    /// Without one, markers are ignored.
    #[must_use]
    pub fn with_delete(mut self, delete_sql: &str) -> Self {
        self.delete = Some(NamedStatement::new(delete_sql));
        self
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }
}

fn is_deleted_marker(row: &RowMap) -> bool {
    row.get("Deleted").and_then(Value::as_str) == Some("true")
}

#[async_trait]
impl RemoteSource for SqlRemoteSource {
    async fn pull_rows(&self) -> Result<Vec<RowMap>, StorageError> {
        retry("sql_pull", &RetryConfig::query(), || async {
            let rows = sqlx::query(&self.select)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Query(e.to_string()))?;
            Ok::<_, StorageError>(rows.iter().map(to_row_map).collect())
        })
        .await
    }

    async fn upsert(&self, row: &RowMap) -> Result<(), StorageError> {
        let statement = if is_deleted_marker(row) {
            match &self.delete {
                Some(delete) => delete,
                None => {
                    debug!("No delete statement, marker dropped");
                    return Ok(());
                }
            }
        } else {
            &self.upsert
        };

        statement
            .bind(row)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;
        Ok(())
    }
}

impl std::fmt::Debug for SqlRemoteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlRemoteSource")
            .field("select", &self.select)
            .field("upsert", &self.upsert.sql)
            .finish_non_exhaustive()
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-table strategy plugged into the generic flow machine.
//!
//! The machine knows nothing about any table's shape. Everything that is
//! table specific (schema, row encoding, statements, vault index path,
//! change triggers, row equality, remote access) comes through
//! [`FlowDefinition`]. Most methods have defaults derived from the
//! [`TableSchema`], so a definition only has to supply a schema and an
//! index path.
//!
//! # Example
//!
//! ```
//! use flow_sync::definition::{ColumnType, FlowColumn, GenericTableDefinition, TableSchema, FlowDefinition};
//!
//! let schema = TableSchema::new("Jobs", vec![
//!     FlowColumn::new("id", ColumnType::Text).primary_key(),
//!     FlowColumn::new("val", ColumnType::Text),
//! ]);
//! let jobs = GenericTableDefinition::new(schema, "id");
//! assert_eq!(jobs.identity_columns(), vec!["id".to_string()]);
//! ```

mod generic;
mod statistics;

pub use generic::GenericTableDefinition;
pub use statistics::{DataFlowStatisticsDefinition, STATISTICS_TABLE};

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::Value;
use std::time::Duration;

use crate::cdc::ChangeTable;
use crate::compare;
use crate::engine::{quote_ident, QueryEngine};
use crate::flow::FlowError;
use crate::storage::traits::{RemoteSource, RowMap, StorageError, VaultKv};

/// Declared type of a mirrored column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    /// Stored as RFC 3339 text
    Timestamp,
}

impl ColumnType {
    #[must_use]
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Timestamp => "TEXT",
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }

    /// Bring `value` into this column's canonical representation.
    /// Values that cannot be converted are kept as they are.
    #[must_use]
    pub fn coerce(&self, value: &Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,

            (ColumnType::Text, Value::String(_)) => value.clone(),
            (ColumnType::Text, other) => Value::String(other.to_string()),

            (ColumnType::Integer, Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => Value::from(i),
                (None, Some(f)) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Value::from(f as i64),
                _ => value.clone(),
            },
            (ColumnType::Integer, Value::String(s)) => match s.trim().parse::<i64>() {
                Ok(i) => Value::from(i),
                Err(_) => value.clone(),
            },
            (ColumnType::Integer | ColumnType::Boolean, Value::Bool(b)) => Value::from(i64::from(*b)),

            (ColumnType::Real, Value::Number(n)) => n
                .as_f64()
                .and_then(serde_json::Number::from_f64)
                .map_or_else(|| value.clone(), Value::Number),
            (ColumnType::Real, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map_or_else(|| value.clone(), Value::Number),

            (ColumnType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Value::from(1),
                "false" | "0" | "no" => Value::from(0),
                _ => value.clone(),
            },
            (ColumnType::Boolean, Value::Number(n)) => Value::from(i64::from(n.as_f64().unwrap_or(0.0) != 0.0)),

            (ColumnType::Timestamp, Value::String(s)) => compare::parse_timestamp(s)
                .map(|ts| Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
                .unwrap_or_else(|| value.clone()),

            _ => value.clone(),
        }
    }

    /// The "empty" value of this type, used to spot blank vault records.
    #[must_use]
    pub fn is_default(&self, value: &Value) -> bool {
        match value {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Number(n) => n.as_f64() == Some(0.0),
            Value::Bool(b) => !b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub primary_key: bool,
    pub nullable: bool,
}

impl FlowColumn {
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            primary_key: false,
            nullable: true,
        }
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Shape of one mirrored table. Registered once and never changed.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    table: String,
    columns: Vec<FlowColumn>,
}

impl TableSchema {
    #[must_use]
    pub fn new(table: impl Into<String>, columns: Vec<FlowColumn>) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn columns(&self) -> &[FlowColumn] {
        &self.columns
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&FlowColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    #[must_use]
    pub fn primary_keys(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    #[must_use]
    pub fn create_table_sql(&self) -> String {
        let mut defs: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut def = format!("{} {}", quote_ident(&c.name), c.column_type.sql_type());
                if !c.nullable {
                    def.push_str(" NOT NULL");
                }
                def
            })
            .collect();

        let keys = self.primary_keys();
        if !keys.is_empty() {
            let keys: Vec<String> = keys.iter().map(|k| quote_ident(k)).collect();
            defs.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }

        format!("CREATE TABLE IF NOT EXISTS {} ({})", quote_ident(&self.table), defs.join(", "))
    }
}

/// A statement and its `:name` bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub bindings: RowMap,
}

fn param(i: usize) -> String {
    format!("p{}", i)
}

#[async_trait]
pub trait FlowDefinition: Send + Sync {
    fn schema(&self) -> &TableSchema;

    /// Vault path of `row`, relative to `Index/<source>` unless it contains
    /// `/PublicIndex/`. An empty path means the row has no vault home.
    async fn index_path(&self, engine: &QueryEngine, row: &RowMap) -> Result<String, FlowError>;

    /// Columns identifying a row; one, two or three of them.
    fn identity_columns(&self) -> Vec<String> {
        self.schema().primary_keys()
    }

    /// Column whose values name the vault index directories.
    fn index_column(&self) -> String {
        self.identity_columns().into_iter().next().unwrap_or_default()
    }

    /// Change table and trigger SQL for this table.
    fn change_table(&self) -> ChangeTable {
        ChangeTable::new(self.schema().table(), self.identity_columns())
    }

    fn triggers(&self) -> Vec<(String, String)> {
        self.change_table().triggers()
    }

    /// Project `data` onto the schema in canonical form. Unknown keys are
    /// dropped, missing columns become `Null`.
    fn to_row(&self, data: &RowMap) -> RowMap {
        self.schema()
            .columns()
            .iter()
            .map(|c| {
                let value = data.get(&c.name).map_or(Value::Null, |v| c.column_type.coerce(v));
                (c.name.clone(), value)
            })
            .collect()
    }

    /// Row for a vault record, or `None` when every value is blank.
    fn from_vault(&self, data: &RowMap) -> Option<RowMap> {
        let row = self.to_row(data);
        let blank = self.schema().columns().iter().all(|c| {
            row.get(&c.name)
                .map_or(true, |v| c.column_type.is_default(v))
        });
        if blank {
            None
        } else {
            Some(row)
        }
    }

    fn insert_statement(&self, row: &RowMap) -> SqlStatement {
        let schema = self.schema();
        let mut bindings = RowMap::new();
        let mut columns = Vec::with_capacity(schema.columns().len());
        let mut values = Vec::with_capacity(schema.columns().len());

        for (i, column) in schema.columns().iter().enumerate() {
            columns.push(quote_ident(&column.name));
            values.push(format!(":{}", param(i)));
            bindings.insert(param(i), row.get(&column.name).cloned().unwrap_or(Value::Null));
        }

        SqlStatement {
            sql: format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(schema.table()),
                columns.join(", "),
                values.join(", ")
            ),
            bindings,
        }
    }

    fn update_statement(&self, row: &RowMap) -> SqlStatement {
        let schema = self.schema();
        let identity = self.identity_columns();
        let mut bindings = RowMap::new();
        let mut sets = Vec::new();
        let mut predicate = Vec::new();

        for (i, column) in schema.columns().iter().enumerate() {
            bindings.insert(param(i), row.get(&column.name).cloned().unwrap_or(Value::Null));
            let clause = format!("{} = :{}", quote_ident(&column.name), param(i));
            if identity.contains(&column.name) {
                predicate.push(clause);
            } else {
                sets.push(clause);
            }
        }
        if sets.is_empty() {
            sets = predicate.clone();
        }

        SqlStatement {
            sql: format!(
                "UPDATE {} SET {} WHERE {}",
                quote_ident(schema.table()),
                sets.join(", "),
                predicate.join(" AND ")
            ),
            bindings,
        }
    }

    fn select_by_identity(&self, row: &RowMap) -> SqlStatement {
        let mut bindings = RowMap::new();
        let predicate: Vec<String> = self
            .identity_columns()
            .iter()
            .enumerate()
            .map(|(i, c)| {
                bindings.insert(param(i), row.get(c).cloned().unwrap_or(Value::Null));
                format!("{} = :{}", quote_ident(c), param(i))
            })
            .collect();

        SqlStatement {
            sql: format!(
                "SELECT * FROM {} WHERE {}",
                quote_ident(self.schema().table()),
                predicate.join(" AND ")
            ),
            bindings,
        }
    }

    /// Whether a pulled row matches its mirrored copy.
    fn compare_rows(&self, pulled: &RowMap, local: &RowMap) -> bool {
        compare::compare_rows(pulled, local)
    }

    /// Identity values joined by `,`; what sync filters match against.
    fn row_id(&self, row: &RowMap) -> String {
        self.identity_columns()
            .iter()
            .map(|c| match row.get(c) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Rows to seed the table with instead of reading the regular vault
    /// index. `None` keeps the regular seeding.
    async fn seed_rows(&self, _vault: &dyn VaultKv, _timeout: Duration) -> Result<Option<Vec<RowMap>>, FlowError> {
        Ok(None)
    }

    async fn pull_remote(&self, remote: &dyn RemoteSource) -> Result<Vec<RowMap>, StorageError> {
        remote.pull_rows().await
    }

    async fn push_remote(&self, remote: &dyn RemoteSource, row: &RowMap) -> Result<(), StorageError> {
        remote.upsert(row).await
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change Data Capture (CDC) for mirrored tables.
//!
//! Every mirrored table `T` gets a shadow table `T_Changes` holding the
//! identity of each row touched since the last drain. Three triggers keep it
//! populated:
//!
//! ```text
//! CREATE TRIGGER "tcInsertTrigger_Jobs" AFTER INSERT ON "Jobs" FOR EACH ROW
//! BEGIN
//!   INSERT OR IGNORE INTO "Jobs_Changes" VALUES (new."id", CURRENT_TIMESTAMP);
//! END
//! ```
//!
//! `INSERT OR IGNORE` collapses repeated mutations of one key into one
//! change record. The drain re-reads the row's current state, so history is
//! not needed.
//!
//! # Identity arity
//!
//! A table may be identified by one column, a composite pair, or the three
//! columns of the statistics table. The change table's primary key is the
//! identity columns, followed by `updateTime`.

use serde_json::Value;

use crate::engine::quote_ident;
use crate::storage::traits::RowMap;

/// Suffix of every change table.
pub const CHANGES_SUFFIX: &str = "_Changes";

/// Timestamp column appended to the identity columns.
pub const UPDATE_TIME_COLUMN: &str = "updateTime";

/// Binding name prefix used by the change-table statements.
const KEY_BINDING: &str = "cdc";

/// CDC operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdcOp {
    Insert,
    Update,
    Delete,
}

impl CdcOp {
    pub const ALL: [CdcOp; 3] = [CdcOp::Insert, CdcOp::Update, CdcOp::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            CdcOp::Insert => "INSERT",
            CdcOp::Update => "UPDATE",
            CdcOp::Delete => "DELETE",
        }
    }

    /// Row alias visible inside the trigger body
    fn row_alias(&self) -> &'static str {
        match self {
            CdcOp::Insert | CdcOp::Update => "new",
            CdcOp::Delete => "old",
        }
    }

    fn trigger_prefix(&self) -> &'static str {
        match self {
            CdcOp::Insert => "tcInsertTrigger_",
            CdcOp::Update => "tcUpdateTrigger_",
            CdcOp::Delete => "tcDeleteTrigger_",
        }
    }

    #[must_use]
    pub fn trigger_name(&self, table: &str) -> String {
        format!("{}{}", self.trigger_prefix(), table)
    }
}

#[must_use]
pub fn change_table_name(table: &str) -> String {
    format!("{}{}", table, CHANGES_SUFFIX)
}

/// SQL generator for one table's change table and triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeTable {
    table: String,
    identity: Vec<String>,
}

impl ChangeTable {
    #[must_use]
    pub fn new(table: impl Into<String>, identity: Vec<String>) -> Self {
        Self {
            table: table.into(),
            identity,
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn name(&self) -> String {
        change_table_name(&self.table)
    }

    #[must_use]
    pub fn identity(&self) -> &[String] {
        &self.identity
    }

    /// Columns are untyped so identity values keep their storage class.
    #[must_use]
    pub fn create_sql(&self) -> String {
        let mut columns: Vec<String> = self.identity.iter().map(|c| quote_ident(c)).collect();
        let keys = columns.join(", ");
        columns.push(quote_ident(UPDATE_TIME_COLUMN));

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
            quote_ident(&self.name()),
            columns.join(", "),
            keys
        )
    }

    #[must_use]
    pub fn trigger_sql(&self, op: CdcOp) -> String {
        let values: Vec<String> = self
            .identity
            .iter()
            .map(|c| format!("{}.{}", op.row_alias(), quote_ident(c)))
            .collect();

        format!(
            "CREATE TRIGGER {} AFTER {} ON {} FOR EACH ROW BEGIN INSERT OR IGNORE INTO {} VALUES ({}, CURRENT_TIMESTAMP); END",
            quote_ident(&op.trigger_name(&self.table)),
            op.as_str(),
            quote_ident(&self.table),
            quote_ident(&self.name()),
            values.join(", ")
        )
    }

    /// `(name, sql)` for the insert, update and delete triggers.
    #[must_use]
    pub fn triggers(&self) -> Vec<(String, String)> {
        CdcOp::ALL
            .iter()
            .map(|op| (op.trigger_name(&self.table), self.trigger_sql(*op)))
            .collect()
    }

    #[must_use]
    pub fn select_sql(&self) -> String {
        let columns: Vec<String> = self.identity.iter().map(|c| quote_ident(c)).collect();
        format!(
            "SELECT {} FROM {} ORDER BY {}, {}",
            columns.join(", "),
            quote_ident(&self.name()),
            quote_ident(UPDATE_TIME_COLUMN),
            columns.join(", ")
        )
    }

    #[must_use]
    pub fn delete_sql(&self) -> String {
        format!("DELETE FROM {} WHERE {}", quote_ident(&self.name()), self.key_predicate())
    }

    /// Re-inject statement; binds like [`ChangeRecord::bindings`].
    #[must_use]
    pub fn insert_sql(&self) -> String {
        let values: Vec<String> = (0..self.identity.len())
            .map(|i| format!(":{}{}", KEY_BINDING, i))
            .collect();
        format!(
            "INSERT OR IGNORE INTO {} VALUES ({}, CURRENT_TIMESTAMP)",
            quote_ident(&self.name()),
            values.join(", ")
        )
    }

    #[must_use]
    pub fn truncate_sql(&self) -> String {
        format!("DELETE FROM {}", quote_ident(&self.name()))
    }

    /// `WHERE` body matching one identity on the base table.
    #[must_use]
    pub fn select_row_sql(&self) -> String {
        format!("SELECT * FROM {} WHERE {}", quote_ident(&self.table), self.key_predicate())
    }

    fn key_predicate(&self) -> String {
        self.identity
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = :{}{}", quote_ident(c), KEY_BINDING, i))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

/// Identity of one changed row, in identity-column order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    keys: Vec<(String, Value)>,
}

impl ChangeRecord {
    #[must_use]
    pub fn new(keys: Vec<(String, Value)>) -> Self {
        Self { keys }
    }

    /// Pick the identity columns out of a row. `None` if any is missing.
    #[must_use]
    pub fn from_row(identity: &[String], row: &RowMap) -> Option<Self> {
        let mut keys = Vec::with_capacity(identity.len());
        for column in identity {
            keys.push((column.clone(), row.get(column)?.clone()));
        }
        Some(Self { keys })
    }

    /// Build from a change-table result row.
    #[must_use]
    pub fn from_values(identity: &[String], values: &[Value]) -> Option<Self> {
        if values.len() < identity.len() {
            return None;
        }
        Some(Self {
            keys: identity.iter().cloned().zip(values.iter().cloned()).collect(),
        })
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.keys.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    /// The first identity value; the whole identity for single-key tables.
    #[must_use]
    pub fn primary(&self) -> Option<&Value> {
        self.keys.first().map(|(_, v)| v)
    }

    /// Bindings for the statements generated by [`ChangeTable`].
    #[must_use]
    pub fn bindings(&self) -> RowMap {
        self.keys
            .iter()
            .enumerate()
            .map(|(i, (_, v))| (format!("{}{}", KEY_BINDING, i), v.clone()))
            .collect()
    }

    /// Column-keyed identity map.
    #[must_use]
    pub fn to_map(&self) -> RowMap {
        self.keys.iter().cloned().collect()
    }
}

impl std::fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .keys
            .iter()
            .map(|(_, v)| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn jobs() -> ChangeTable {
        ChangeTable::new("Jobs", vec!["id".into()])
    }

    #[test]
    fn test_trigger_names() {
        assert_eq!(CdcOp::Insert.trigger_name("Jobs"), "tcInsertTrigger_Jobs");
        assert_eq!(CdcOp::Update.trigger_name("Jobs"), "tcUpdateTrigger_Jobs");
        assert_eq!(CdcOp::Delete.trigger_name("Jobs"), "tcDeleteTrigger_Jobs");
    }

    #[test]
    fn test_create_sql_keys_on_identity() {
        let table = ChangeTable::new("Stats", vec!["flowName".into(), "argosId".into(), "stateCode".into()]);
        assert_eq!(
            table.create_sql(),
            "CREATE TABLE IF NOT EXISTS \"Stats_Changes\" (\"flowName\", \"argosId\", \"stateCode\", \"updateTime\", PRIMARY KEY (\"flowName\", \"argosId\", \"stateCode\"))"
        );
    }

    #[test]
    fn test_delete_trigger_reads_old_row() {
        let sql = jobs().trigger_sql(CdcOp::Delete);
        assert!(sql.contains("AFTER DELETE ON \"Jobs\""));
        assert!(sql.contains("old.\"id\""));
        assert!(sql.contains("INSERT OR IGNORE INTO \"Jobs_Changes\""));

        let sql = jobs().trigger_sql(CdcOp::Update);
        assert!(sql.contains("new.\"id\""));
    }

    #[test]
    fn test_statement_bindings_line_up() {
        let table = ChangeTable::new("Pairs", vec!["a".into(), "b".into()]);
        assert_eq!(
            table.delete_sql(),
            "DELETE FROM \"Pairs_Changes\" WHERE \"a\" = :cdc0 AND \"b\" = :cdc1"
        );
        assert_eq!(
            table.insert_sql(),
            "INSERT OR IGNORE INTO \"Pairs_Changes\" VALUES (:cdc0, :cdc1, CURRENT_TIMESTAMP)"
        );

        let record = ChangeRecord::from_values(table.identity(), &[json!("x"), json!(2), json!("ts")]).unwrap();
        let bindings = record.bindings();
        assert_eq!(bindings["cdc0"], "x");
        assert_eq!(bindings["cdc1"], 2);
        assert_eq!(record.to_string(), "x,2");
    }

    #[test]
    fn test_record_from_row_requires_identity() {
        let row = json!({"id": "a", "val": "1"}).as_object().cloned().unwrap();
        let record = ChangeRecord::from_row(&["id".to_string()], &row).unwrap();
        assert_eq!(record.get("id"), Some(&json!("a")));
        assert_eq!(record.primary(), Some(&json!("a")));

        assert!(ChangeRecord::from_row(&["missing".to_string()], &row).is_none());
    }
}

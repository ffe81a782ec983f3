// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory vault and remote source.
//!
//! Used by tests and by embedders that want to run flows without a real
//! vault or external database. Both support failure injection so the
//! re-inject and error-mode paths can be exercised.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use super::traits::{RemoteSource, RowMap, StorageError, VaultKv};

fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

pub struct InMemoryVault {
    data: DashMap<String, RowMap>,
    deleted: DashSet<String>,
    fail_writes: AtomicUsize,
    writes: AtomicUsize,
}

impl InMemoryVault {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            deleted: DashSet::new(),
            fail_writes: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` writes fail with a backend error.
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Successful writes since creation
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Whether `path` has been soft-deleted
    #[must_use]
    pub fn is_deleted(&self, path: &str) -> bool {
        self.deleted.contains(normalize(path))
    }

    /// Stored secret paths, sorted
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.data.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for InMemoryVault {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VaultKv for InMemoryVault {
    async fn read(&self, path: &str) -> Result<Option<RowMap>, StorageError> {
        let key = normalize(path);
        if self.deleted.contains(key) {
            return Ok(None);
        }
        Ok(self.data.get(key).map(|r| r.value().clone()))
    }

    async fn write(&self, path: &str, data: &RowMap) -> Result<(), StorageError> {
        let injected = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Backend(format!("injected write failure for {}", path)));
        }

        let key = normalize(path).to_string();
        self.deleted.remove(&key);
        self.data.insert(key, data.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Option<Vec<String>>, StorageError> {
        let prefix = format!("{}/", normalize(path));
        let mut children = BTreeSet::new();

        for entry in self.data.iter() {
            let key = entry.key();
            if self.deleted.contains(key) {
                continue;
            }
            if let Some(rest) = key.strip_prefix(&prefix) {
                match rest.split_once('/') {
                    Some((dir, _)) => children.insert(format!("{}/", dir)),
                    None => children.insert(rest.to_string()),
                };
            }
        }

        if children.is_empty() {
            Ok(None)
        } else {
            Ok(Some(children.into_iter().collect()))
        }
    }

    async fn soft_delete(&self, path: &str) -> Result<(), StorageError> {
        self.deleted.insert(normalize(path).to_string());
        Ok(())
    }
}

/// Remote source keyed by one identity column.
pub struct InMemoryRemote {
    id_column: String,
    rows: DashMap<String, RowMap>,
    upserts: Mutex<Vec<RowMap>>,
    fail_pulls: AtomicBool,
    fail_upserts: AtomicUsize,
}

impl InMemoryRemote {
    #[must_use]
    pub fn new(id_column: impl Into<String>) -> Self {
        Self {
            id_column: id_column.into(),
            rows: DashMap::new(),
            upserts: Mutex::new(Vec::new()),
            fail_pulls: AtomicBool::new(false),
            fail_upserts: AtomicUsize::new(0),
        }
    }

    /// Replace (or add) a row in the authoritative set.
    pub fn set_row(&self, row: RowMap) {
        let id = row_id(&row, &self.id_column);
        self.rows.insert(id, row);
    }

    pub fn remove_row(&self, id: &str) {
        self.rows.remove(id);
    }

    pub fn set_fail_pulls(&self, fail: bool) {
        self.fail_pulls.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` upserts fail.
    pub fn fail_next_upserts(&self, count: usize) {
        self.fail_upserts.store(count, Ordering::SeqCst);
    }

    /// Every row handed to `upsert`, in call order.
    #[must_use]
    pub fn upserted(&self) -> Vec<RowMap> {
        self.upserts.lock().clone()
    }

    #[must_use]
    pub fn row(&self, id: &str) -> Option<RowMap> {
        self.rows.get(id).map(|r| r.value().clone())
    }
}

fn row_id(row: &RowMap, id_column: &str) -> String {
    match row.get(id_column) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[async_trait]
impl RemoteSource for InMemoryRemote {
    async fn pull_rows(&self) -> Result<Vec<RowMap>, StorageError> {
        if self.fail_pulls.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected pull failure".into()));
        }
        let mut rows: Vec<(String, RowMap)> = self
            .rows
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }

    async fn upsert(&self, row: &RowMap) -> Result<(), StorageError> {
        let injected = self
            .fail_upserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Backend("injected upsert failure".into()));
        }

        self.upserts.lock().push(row.clone());
        if row.get("Deleted").and_then(Value::as_str) == Some("true") {
            if let Some(id) = row.get("changedId") {
                let id = match id {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                self.rows.remove(&id);
            }
        } else {
            self.set_row(row.clone());
        }
        Ok(())
    }
}

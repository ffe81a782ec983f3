// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

/// One table row (or one vault secret) keyed by column name.
pub type RowMap = Map<String, Value>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Operation '{operation}' timed out after {after:?}")]
    Timeout {
        operation: String,
        after: Duration,
    },
}

/// Path-addressed key/value facade over the secrets vault.
///
/// Paths are slash delimited (`super-secrets/Index/...`). A missing path is
/// not an error: `read` and `list` return `Ok(None)`.
#[async_trait]
pub trait VaultKv: Send + Sync {
    async fn read(&self, path: &str) -> Result<Option<RowMap>, StorageError>;
    async fn write(&self, path: &str, data: &RowMap) -> Result<(), StorageError>;

    /// List the immediate children of `path`. Sub-directories carry a
    /// trailing `/`.
    async fn list(&self, path: &str) -> Result<Option<Vec<String>>, StorageError>;

    /// Mark the secret at `path` deleted without destroying its history.
    async fn soft_delete(&self, path: &str) -> Result<(), StorageError>;
}

/// An external SQL data source a flow pulls from or pushes to.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Pull the authoritative row set.
    async fn pull_rows(&self) -> Result<Vec<RowMap>, StorageError>;

    /// Insert or update one row.
    async fn upsert(&self, row: &RowMap) -> Result<(), StorageError>;
}

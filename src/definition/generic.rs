// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use serde_json::Value;

use super::{FlowDefinition, TableSchema};
use crate::engine::QueryEngine;
use crate::flow::FlowError;
use crate::storage::traits::RowMap;

/// Ready-made strategy for a table keyed by one id column.
///
/// Rows live in the vault at `/<idColumn>/<id>` under the flow's index.
#[derive(Debug, Clone)]
pub struct GenericTableDefinition {
    schema: TableSchema,
    id_column: String,
}

impl GenericTableDefinition {
    #[must_use]
    pub fn new(schema: TableSchema, id_column: impl Into<String>) -> Self {
        Self {
            schema,
            id_column: id_column.into(),
        }
    }

    #[must_use]
    pub fn id_column(&self) -> &str {
        &self.id_column
    }
}

#[async_trait]
impl FlowDefinition for GenericTableDefinition {
    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn identity_columns(&self) -> Vec<String> {
        vec![self.id_column.clone()]
    }

    async fn index_path(&self, _engine: &QueryEngine, row: &RowMap) -> Result<String, FlowError> {
        let id = match row.get(&self.id_column) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            other => {
                return Err(FlowError::IndexPath(format!(
                    "{} not found for table {}: {:?}",
                    self.id_column,
                    self.schema.table(),
                    other
                )))
            }
        };
        Ok(format!("/{}/{}", self.id_column, id))
    }
}

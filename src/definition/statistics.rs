// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use super::{ColumnType, FlowColumn, FlowDefinition, TableSchema};
use crate::compare;
use crate::engine::QueryEngine;
use crate::flow::FlowError;
use crate::resilience::retry::with_timeout;
use crate::statistics::{retrieve_statistic, statistic_vault_path, DataFlowTree};
use crate::storage::traits::{RowMap, VaultKv};

pub const STATISTICS_TABLE: &str = "DataFlowStatistics";

/// Mirror of the statistics table, keyed by `(flowName, argosId, stateCode)`.
///
/// Rows are stored in the vault under the tenant's public statistics
/// index, and are seeded from there rather than from the regular index.
#[derive(Debug, Clone)]
pub struct DataFlowStatisticsDefinition {
    schema: TableSchema,
    index_path: String,
    id_name: String,
}

impl DataFlowStatisticsDefinition {
    #[must_use]
    pub fn new(index_path: impl Into<String>, id_name: impl Into<String>) -> Self {
        Self::with_table(STATISTICS_TABLE, index_path, id_name)
    }

    #[must_use]
    pub fn with_table(table: &str, index_path: impl Into<String>, id_name: impl Into<String>) -> Self {
        let text = |name: &str| FlowColumn::new(name, ColumnType::Text);
        let schema = TableSchema::new(
            table,
            vec![
                text("flowName").primary_key(),
                text("argosId").primary_key(),
                text("flowGroup"),
                text("mode"),
                text("stateCode").primary_key(),
                text("stateName"),
                text("timeSplit"),
                text("lastTestedDate"),
            ],
        );
        Self {
            schema,
            index_path: index_path.into(),
            id_name: id_name.into(),
        }
    }

    fn field<'a>(row: &'a RowMap, column: &str) -> Option<&'a str> {
        row.get(column).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    fn last_tested_as_modified(row: &RowMap) -> RowMap {
        let mut out = RowMap::new();
        if let Some(date) = row.get("lastTestedDate") {
            out.insert(compare::LAST_MODIFIED.to_string(), date.clone());
        }
        out
    }
}

#[async_trait]
impl FlowDefinition for DataFlowStatisticsDefinition {
    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn identity_columns(&self) -> Vec<String> {
        vec!["flowName".into(), "argosId".into(), "stateCode".into()]
    }

    fn index_column(&self) -> String {
        "argosId".into()
    }

    async fn index_path(&self, _engine: &QueryEngine, row: &RowMap) -> Result<String, FlowError> {
        let parts = (
            Self::field(row, "argosId"),
            Self::field(row, "flowName"),
            Self::field(row, "stateCode"),
            Self::field(row, "flowGroup"),
        );
        match parts {
            (Some(id), Some(flow), Some(code), Some(group)) => Ok(statistic_vault_path(
                &self.index_path,
                &self.id_name,
                id,
                group,
                flow,
                code,
            )),
            _ => Err(FlowError::IndexPath("Could not find data flow statistic index".into())),
        }
    }

    fn compare_rows(&self, pulled: &RowMap, local: &RowMap) -> bool {
        compare::compare_last_modified(
            &Self::last_tested_as_modified(pulled),
            &Self::last_tested_as_modified(local),
        )
    }

    /// Every tenant's stored statistics, as table rows.
    async fn seed_rows(&self, vault: &dyn VaultKv, timeout: Duration) -> Result<Option<Vec<RowMap>>, FlowError> {
        let tenants_path = format!("super-secrets/PublicIndex/{}/{}", self.index_path, self.id_name);
        let Some(tenants) = with_timeout("statistic_seed", timeout, vault.list(&tenants_path)).await? else {
            return Ok(Some(Vec::new()));
        };

        let mut rows = Vec::new();
        for tenant in tenants {
            let tenant = tenant.trim_matches('/');
            let groups_path = format!("{}/{}/DataFlowStatistics/DataFlowGroup", tenants_path, tenant);
            let Some(groups) = with_timeout("statistic_seed", timeout, vault.list(&groups_path)).await? else {
                continue;
            };

            for group in groups {
                let group = group.trim_matches('/');
                let names_path = format!("{}/{}/dataFlowName", groups_path, group);
                let Some(names) = with_timeout("statistic_seed", timeout, vault.list(&names_path)).await? else {
                    continue;
                };

                for name in names {
                    let name = name.trim_matches('/');
                    let mut tree = DataFlowTree::group(group);
                    let root = tree.root();
                    if let Err(e) = retrieve_statistic(
                        vault,
                        timeout,
                        &mut tree,
                        root,
                        tenant,
                        &self.index_path,
                        &self.id_name,
                        group,
                        name,
                    )
                    .await
                    {
                        warn!(flow = %name, error = %e, "Failed to retrieve statistic");
                        continue;
                    }

                    for stat in tree.children_of(root).filter_map(|n| n.statistic()) {
                        let mut row = stat.to_map();
                        row.insert("argosId".into(), Value::String(tenant.to_string()));
                        rows.push(self.to_row(&row));
                    }
                }
            }
        }
        Ok(Some(rows))
    }
}

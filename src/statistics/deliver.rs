// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Statistics persistence: delivery to SQL or the vault, and reading a
//! fleet of stored statistics back into a tree.

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::node::{DataFlowTree, NodeId};
use super::StatisticError;
use crate::engine::{quote_ident, QueryEngine};
use crate::metrics;
use crate::resilience::retry::with_timeout;
use crate::storage::traits::{RowMap, VaultKv};

const STATISTIC_COLUMNS: [&str; 8] = [
    "flowName",
    "argosId",
    "flowGroup",
    "mode",
    "stateCode",
    "stateName",
    "timeSplit",
    "lastTestedDate",
];
const STATISTIC_KEYS: [&str; 3] = ["flowName", "argosId", "stateCode"];

/// Where finished statistics go. With an engine they are upserted into
/// `statistics_table`; a vault receives the ones SQL did not take (all of
/// them when there is no engine).
pub struct StatisticSink<'a> {
    pub vault: Option<&'a dyn VaultKv>,
    pub engine: Option<&'a QueryEngine>,
    pub statistics_table: &'a str,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySummary {
    pub sql: usize,
    pub vault: usize,
    /// Already stored with identical values
    pub unchanged: usize,
    pub failed: usize,
}

/// `super-secrets/PublicIndex/<indexPath>/<idName>/<id>/DataFlowStatistics/DataFlowGroup/<group>/dataFlowName/<flow>/<stateCode>`
#[must_use]
pub fn statistic_vault_path(
    index_path: &str,
    id_name: &str,
    id: &str,
    flow_group: &str,
    flow_name: &str,
    state_code: &str,
) -> String {
    format!(
        "{}/{}/{}",
        flow_names_path(index_path, id_name, id, flow_group),
        flow_name,
        state_code
    )
}

fn groups_path(index_path: &str, id_name: &str, id: &str) -> String {
    format!(
        "super-secrets/PublicIndex/{}/{}/{}/DataFlowStatistics/DataFlowGroup",
        index_path, id_name, id
    )
}

fn flow_names_path(index_path: &str, id_name: &str, id: &str, flow_group: &str) -> String {
    format!("{}/{}/dataFlowName", groups_path(index_path, id_name, id), flow_group)
}

fn trimmed(entry: &str) -> &str {
    entry.trim_matches('/')
}

/// Upsert that leaves an identical stored row untouched (0 rows affected).
fn upsert_sql(table: &str) -> String {
    let table = quote_ident(table);
    let columns: Vec<String> = STATISTIC_COLUMNS.iter().map(|c| quote_ident(c)).collect();
    let values: Vec<String> = STATISTIC_COLUMNS.iter().map(|c| format!(":{}", c)).collect();
    let keys: Vec<String> = STATISTIC_KEYS.iter().map(|c| quote_ident(c)).collect();
    let others: Vec<&str> = STATISTIC_COLUMNS
        .iter()
        .copied()
        .filter(|c| !STATISTIC_KEYS.contains(c))
        .collect();
    let sets: Vec<String> = others
        .iter()
        .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
        .collect();
    let changed: Vec<String> = others
        .iter()
        .map(|c| format!("{}.{1} IS NOT excluded.{1}", table, quote_ident(c)))
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {} WHERE {}",
        table,
        columns.join(", "),
        values.join(", "),
        keys.join(", "),
        sets.join(", "),
        changed.join(" OR ")
    )
}

fn sql_bindings(id: &str, stat: &RowMap) -> RowMap {
    let mut bindings = RowMap::new();
    for column in STATISTIC_COLUMNS {
        let value = match column {
            "argosId" => Value::String(id.to_string()),
            "mode" => match stat.get("mode") {
                Some(Value::String(s)) => Value::String(s.clone()),
                Some(Value::Null) | None => Value::String(String::new()),
                Some(other) => Value::String(other.to_string()),
            },
            other => stat.get(other).cloned().unwrap_or(Value::String(String::new())),
        };
        bindings.insert(column.to_string(), value);
    }
    bindings
}

impl DataFlowTree {
    /// Flatten and deliver every recorded statistic.
    ///
    /// Deferred logging runs first. Individual delivery failures are logged
    /// and counted, never returned.
    #[instrument(skip(self, sink), fields(flow = %self.name()))]
    pub async fn finish_statistic(
        &self,
        sink: &StatisticSink<'_>,
        id: &str,
        index_path: &str,
        id_name: &str,
    ) -> DeliverySummary {
        self.finish_statistic_log();

        let mut summary = DeliverySummary::default();
        let upsert = upsert_sql(sink.statistics_table);

        for stat in self.statistics() {
            let map = stat.to_map();

            if let Some(engine) = sink.engine {
                match engine.query_with_bindings(&upsert, &sql_bindings(id, &map)).await {
                    Ok(result) if result.rows_affected() > 0 => {
                        summary.sql += 1;
                        continue;
                    }
                    Ok(_) => {
                        if sink.vault.is_none() {
                            summary.unchanged += 1;
                            continue;
                        }
                        debug!(state = %stat.state_name, "Statistic unchanged in SQL, writing to vault");
                    }
                    Err(e) => {
                        warn!(state = %stat.state_name, error = %e, "Failed to upsert statistic");
                        if sink.vault.is_none() {
                            summary.failed += 1;
                            continue;
                        }
                    }
                }
            }

            let Some(vault) = sink.vault else {
                continue;
            };
            let path = statistic_vault_path(
                index_path,
                id_name,
                id,
                &stat.flow_group,
                &stat.flow_name,
                &stat.state_code,
            );
            match with_timeout("statistic_write", sink.timeout, vault.write(&path, &map)).await {
                Ok(()) => summary.vault += 1,
                Err(e) => {
                    summary.failed += 1;
                    if let Some(log) = self.log_fn() {
                        log(
                            "Error writing out DataFlowStatistics to vault",
                            Some(&StatisticError::Storage(e)),
                        );
                    } else {
                        warn!(path = %path, error = %e, "Error writing out DataFlowStatistics to vault");
                    }
                }
            }
        }

        if summary.sql > 0 {
            metrics::record_statistics_delivered("sql", summary.sql);
        }
        if summary.vault > 0 {
            metrics::record_statistics_delivered("vault", summary.vault);
        }
        summary
    }
}

/// Read every stored state of one flow into children of `parent`.
///
/// A blank `lastTestedDate` is filled from the flow group's own record when
/// it has one. Returns how many statistics were read.
#[allow(clippy::too_many_arguments)]
pub async fn retrieve_statistic(
    vault: &dyn VaultKv,
    timeout: Duration,
    tree: &mut DataFlowTree,
    parent: NodeId,
    id: &str,
    index_path: &str,
    id_name: &str,
    flow_group: &str,
    flow_name: &str,
) -> Result<usize, StatisticError> {
    let base = format!(
        "{}/{}",
        flow_names_path(index_path, id_name, id, trimmed(flow_group)),
        trimmed(flow_name)
    );
    let Some(state_codes) = with_timeout("statistic_list", timeout, vault.list(&base)).await? else {
        return Ok(0);
    };

    let mut read = 0;
    for state_code in state_codes {
        let path = format!("{}/{}", base, trimmed(&state_code));
        let Some(mut data) = with_timeout("statistic_read", timeout, vault.read(&path)).await? else {
            debug!(path = %path, "Statistic vanished before it was read");
            continue;
        };

        let blank_date = matches!(data.get("lastTestedDate"), Some(Value::String(s)) if s.is_empty());
        if blank_date {
            if let Some(group) = data.get("flowGroup").and_then(Value::as_str) {
                let group_path = format!("super-secrets/{}", group);
                if let Ok(Some(props)) = with_timeout("statistic_read", timeout, vault.read(&group_path)).await {
                    if let Some(date) = props.get("lastTestedDate").and_then(Value::as_str) {
                        data.insert("lastTestedDate".into(), Value::String(date.to_string()));
                    }
                }
            }
        }

        tree.map_statistic(parent, &data)?;
        read += 1;
    }
    Ok(read)
}

/// Build `project → tenant → group → [type →] flow → statistics` from
/// the vault. Flow names of the form `type-id` are gathered under a node
/// for their type.
#[instrument(skip(vault))]
pub async fn init_argosy_fleet(
    vault: &dyn VaultKv,
    timeout: Duration,
    project: &str,
) -> Result<DataFlowTree, StatisticError> {
    let mut fleet = DataFlowTree::group(project);
    let root = fleet.root();

    let project_path = format!("super-secrets/PublicIndex/{}", project);
    let Some(id_names) = with_timeout("fleet_list", timeout, vault.list(&project_path)).await? else {
        return Ok(fleet);
    };

    for id_name in id_names {
        let id_name = trimmed(&id_name);
        let ids_path = format!("super-secrets/Index/{}/{}", project, id_name);
        let Some(ids) = with_timeout("fleet_list", timeout, vault.list(&ids_path)).await? else {
            continue;
        };

        for id in ids {
            let id = trimmed(&id);
            let tenant = fleet.add_group(root, id);

            let groups_path = groups_path(project, id_name, id);
            let Some(groups) = with_timeout("fleet_list", timeout, vault.list(&groups_path)).await? else {
                continue;
            };

            for group in groups {
                let group = trimmed(&group);
                let names_path = flow_names_path(project, id_name, id, group);
                let Some(names) = with_timeout("fleet_list", timeout, vault.list(&names_path)).await? else {
                    continue;
                };

                let group_node = fleet.add_group(tenant, group);
                for name in names {
                    let name = trimmed(&name);
                    let parent = match name.split_once('-') {
                        Some((kind, _)) => fleet.find_or_add_group(group_node, kind),
                        None => group_node,
                    };
                    let flow = fleet.add_flow(parent, name);
                    retrieve_statistic(vault, timeout, &mut fleet, flow, id, project, id_name, group, name).await?;
                }
            }
        }
    }

    Ok(fleet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DataFlowStatisticsDefinition, FlowDefinition};
    use crate::storage::memory::InMemoryVault;
    use chrono::TimeDelta;

    fn tree() -> DataFlowTree {
        let mut tree = DataFlowTree::init_data_flow(None, "Jobs", false);
        tree.update_data_flow_statistic_with_time("Flows", "Jobs", "Loading", "1", 1, TimeDelta::milliseconds(10));
        tree.update_data_flow_statistic_with_time("Flows", "Jobs", "Load complete", "2", 1, TimeDelta::milliseconds(20));
        tree
    }

    #[test]
    fn test_statistic_vault_path() {
        assert_eq!(
            statistic_vault_path("TrcVault", "tenantId", "t1", "Flows", "Jobs", "2"),
            "super-secrets/PublicIndex/TrcVault/tenantId/t1/DataFlowStatistics/DataFlowGroup/Flows/dataFlowName/Jobs/2"
        );
    }

    #[tokio::test]
    async fn test_finish_to_vault() {
        let vault = InMemoryVault::new();
        let sink = StatisticSink {
            vault: Some(&vault),
            engine: None,
            statistics_table: "DataFlowStatistics",
            timeout: Duration::from_secs(1),
        };

        let summary = tree().finish_statistic(&sink, "t1", "TrcVault", "tenantId").await;
        assert_eq!(summary.vault, 2);
        assert_eq!(vault.write_count(), 2);

        let stored = vault
            .read(&statistic_vault_path("TrcVault", "tenantId", "t1", "Flows", "Jobs", "2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["stateName"], "Load complete");
        assert_eq!(stored["timeSplit"], "20ms");
    }

    #[tokio::test]
    async fn test_finish_to_sql_then_unchanged_falls_back_to_vault() {
        let engine = QueryEngine::new("TrcDb").await.unwrap();
        let definition = DataFlowStatisticsDefinition::new("TrcVault", "tenantId");
        engine.query(&definition.schema().create_table_sql()).await.unwrap();

        let sql_only = StatisticSink {
            vault: None,
            engine: Some(&engine),
            statistics_table: "DataFlowStatistics",
            timeout: Duration::from_secs(1),
        };
        let stats = tree();
        let first = stats.finish_statistic(&sql_only, "t1", "TrcVault", "tenantId").await;
        assert_eq!(first.sql, 2);

        let rows = engine.query("SELECT * FROM \"DataFlowStatistics\" ORDER BY \"stateCode\"").await.unwrap();
        let rows = rows.to_maps();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["argosId"], "t1");
        assert_eq!(rows[0]["mode"], "1");

        let vault = InMemoryVault::new();
        let both = StatisticSink {
            vault: Some(&vault),
            ..sql_only
        };
        let second = stats.finish_statistic(&both, "t1", "TrcVault", "tenantId").await;
        assert_eq!(second.sql, 0);
        assert_eq!(second.vault, 2);
    }

    #[tokio::test]
    async fn test_vault_failure_is_counted() {
        let vault = InMemoryVault::new();
        vault.fail_next_writes(1);
        let sink = StatisticSink {
            vault: Some(&vault),
            engine: None,
            statistics_table: "DataFlowStatistics",
            timeout: Duration::ZERO,
        };
        let summary = tree().finish_statistic(&sink, "t1", "TrcVault", "tenantId").await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.vault, 1);
    }

    #[tokio::test]
    async fn test_fleet_groups_typed_flow_names() {
        let vault = InMemoryVault::new();
        let sink = StatisticSink {
            vault: Some(&vault),
            engine: None,
            statistics_table: "DataFlowStatistics",
            timeout: Duration::ZERO,
        };
        tree().finish_statistic(&sink, "t1", "Proj", "tenantId").await;

        let mut login = DataFlowTree::init_data_flow(None, "login-42", false);
        login.update_data_flow_statistic("Auth", "login-42", "Login", "1", 0, None);
        login.finish_statistic(&sink, "t1", "Proj", "tenantId").await;

        let mut marker = RowMap::new();
        marker.insert("present".into(), Value::Bool(true));
        vault.write("super-secrets/Index/Proj/tenantId/t1/marker", &marker).await.unwrap();

        let fleet = init_argosy_fleet(&vault, Duration::ZERO, "Proj").await.unwrap();
        let tenant = fleet.find_child(fleet.root(), "t1").unwrap();
        let flows = fleet.find_child(tenant, "Flows").unwrap();
        let jobs = fleet.find_child(flows, "Jobs").unwrap();
        assert_eq!(fleet.children_of(jobs).count(), 2);

        let auth = fleet.find_child(tenant, "Auth").unwrap();
        let login_type = fleet.find_child(auth, "login").unwrap();
        let login_flow = fleet.find_child(login_type, "login-42").unwrap();
        let stat = fleet.children_of(login_flow).next().and_then(|n| n.statistic()).unwrap();
        assert_eq!(stat.state_name, "Login");
    }

    #[tokio::test]
    async fn test_fleet_of_unknown_project_is_empty() {
        let vault = InMemoryVault::new();
        let fleet = init_argosy_fleet(&vault, Duration::ZERO, "Nobody").await.unwrap();
        assert_eq!(fleet.len(), 1);
    }
}

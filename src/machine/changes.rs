// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change drain, vault persistence, remote push and vault seeding.
//!
//! A drained change is processed on its own: whatever fails for one row
//! (re-select, index path, vault write) re-injects that row's change record
//! and moves on to the next.

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{DbQuery, FlowMachineContext, PersistSummary};
use crate::cdc::ChangeRecord;
use crate::flow::{FlowContext, FlowError, FlowHeader, FlowState, SyncMode};
use crate::metrics;
use crate::resilience::retry::{retry, with_timeout, RetryConfig};
use crate::storage::traits::RowMap;

/// Vault secret path for a row's index path.
///
/// Public index paths are used as they are; everything else lives under
/// the flow's source index, with the table name as the leaf.
#[must_use]
pub fn vault_secret_path(header: &FlowHeader, index_path: &str) -> String {
    let trimmed = index_path.trim_matches('/');
    if index_path.contains("PublicIndex/") {
        if trimmed.starts_with("super-secrets/") {
            trimmed.to_string()
        } else {
            format!("super-secrets/{}", trimmed)
        }
    } else {
        format!("super-secrets/Index/{}/{}/{}", header.source, trimmed, header.name)
    }
}

impl FlowMachineContext {
    /// Take every record out of the flow's change table.
    ///
    /// Select and delete run under the changes lock, so two drains never
    /// see the same record.
    pub async fn remove_changed_table_entries(&self, flow: &FlowContext) -> Result<Vec<ChangeRecord>, FlowError> {
        let change_table = flow.definition().change_table();
        let _guard = self.changes_lock.lock().await;

        let pending = self.engine.query(&change_table.select_sql()).await?;
        let mut drained = Vec::with_capacity(pending.rows.len());
        for values in &pending.rows {
            let Some(record) = ChangeRecord::from_values(change_table.identity(), values) else {
                continue;
            };
            if let Err(e) = self
                .engine
                .query_with_bindings(&change_table.delete_sql(), &record.bindings())
                .await
            {
                // Undeleted records stay queued for the next drain
                warn!(flow = %flow.name(), change = %record, error = %e, "Could not remove change record");
                break;
            }
            drained.push(record);
        }

        metrics::record_changes_drained(flow.name(), drained.len());
        Ok(drained)
    }

    /// Queue `record` again so the next drain retries it.
    pub async fn reinject_change(&self, flow: &FlowContext, record: &ChangeRecord) {
        let change_table = flow.definition().change_table();
        match self
            .engine
            .query_with_bindings(&change_table.insert_sql(), &record.bindings())
            .await
        {
            Ok(_) => metrics::record_change_reinjected(flow.name()),
            Err(e) => warn!(flow = %flow.name(), change = %record, error = %e, "Could not re-inject change"),
        }
    }

    /// Persist every pending change of `flow` to the vault, and to the
    /// remote when the flow pushes.
    #[instrument(skip(self, flow), fields(flow = %flow.name()))]
    pub async fn vault_persist_push_remote_changes(&self, flow: &FlowContext) -> Result<PersistSummary, FlowError> {
        let drained = self.remove_changed_table_entries(flow).await?;
        let definition = flow.definition();
        let change_table = definition.change_table();
        let is_controller = flow.name() == self.config.controller_flow_name;
        let mut summary = PersistSummary {
            drained: drained.len(),
            ..Default::default()
        };

        for record in drained {
            let current = match self
                .engine
                .query_with_bindings(&change_table.select_row_sql(), &record.bindings())
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    warn!(change = %record, error = %e, "Could not read changed row");
                    self.reinject_change(flow, &record).await;
                    summary.reinjected += 1;
                    continue;
                }
            };

            let Some(row) = current.to_maps().into_iter().next() else {
                if self.propagate_delete(flow, &record).await {
                    summary.pushed += 1;
                }
                summary.deleted += 1;
                continue;
            };

            if is_controller {
                self.apply_controller_change(&row).await;
            }

            if flow.is_read_only() {
                summary.skipped += 1;
                continue;
            }

            let index_path = match definition.index_path(&self.engine, &row).await {
                Ok(path) if path.is_empty() => {
                    summary.skipped += 1;
                    continue;
                }
                Ok(path) => path,
                Err(e) => {
                    warn!(change = %record, error = %e, "Could not derive index path");
                    self.reinject_change(flow, &record).await;
                    summary.reinjected += 1;
                    continue;
                }
            };

            let path = vault_secret_path(flow.header(), &index_path);
            match with_timeout("vault_write", self.config.vault_timeout(), self.vault.write(&path, &row)).await {
                Ok(()) => {
                    metrics::record_vault_write(flow.name(), "success");
                    summary.written += 1;
                }
                Err(e) => {
                    metrics::record_vault_write(flow.name(), "error");
                    warn!(change = %record, path = %path, error = %e, "Vault write failed");
                    self.reinject_change(flow, &record).await;
                    summary.reinjected += 1;
                    continue;
                }
            }

            if self.push_row_remote(flow, &row, &definition.row_id(&row)).await {
                summary.pushed += 1;
            }
        }

        if summary.drained > 0 {
            debug!(
                drained = summary.drained,
                written = summary.written,
                deleted = summary.deleted,
                reinjected = summary.reinjected,
                "Changes persisted"
            );
        }
        Ok(summary)
    }

    /// Whether `flow` currently hands changed rows to its remote.
    fn pushes_to_remote(&self, flow: &FlowContext) -> bool {
        flow.remote().connection().is_some()
            && !flow.remote().ingest_interval().is_zero()
            && flow.state() != FlowState::Offline
            && flow.sync_mode().is_push()
    }

    /// Push one changed row, keyed by `key` for the sync filter. Returns
    /// whether the remote accepted it.
    async fn push_row_remote(&self, flow: &FlowContext, row: &RowMap, key: &str) -> bool {
        if !self.pushes_to_remote(flow) || !flow.passes_sync_filter(key) {
            return false;
        }
        let definition = flow.definition();
        let Some(connection) = flow.remote().connection() else {
            return false;
        };

        match with_timeout(
            "remote_upsert",
            self.config.remote_timeout(),
            definition.push_remote(connection.as_ref(), row),
        )
        .await
        {
            Ok(()) => {
                metrics::record_remote_push(flow.name(), "success");
                true
            }
            Err(e) => {
                metrics::record_remote_push(flow.name(), "error");
                warn!(flow = %flow.name(), error = %e, "Remote push failed");
                // Later rows of the same drain see pusherror and stay local
                if let Err(e) = self.request_state(flow, flow.state(), SyncMode::PushError).await {
                    warn!(flow = %flow.name(), error = %e, "Could not report push error");
                }
                false
            }
        }
    }

    /// A changed row is gone: tell the remote, soft-delete its vault copy.
    async fn propagate_delete(&self, flow: &FlowContext, record: &ChangeRecord) -> bool {
        let definition = flow.definition();
        let mut pushed = false;

        if self.config.propagates_deletes(flow.name()) {
            let mut marker = RowMap::new();
            marker.insert("Deleted".into(), Value::from("true"));
            marker.insert("changedId".into(), Value::String(record.to_string()));
            for column in definition.schema().column_names() {
                marker.entry(column).or_insert_with(|| Value::from(""));
            }
            pushed = self.push_row_remote(flow, &marker, &record.to_string()).await;
        }

        match definition.index_path(&self.engine, &record.to_map()).await {
            Ok(index_path) if !index_path.is_empty() => {
                let path = vault_secret_path(flow.header(), &index_path);
                if let Err(e) = with_timeout("vault_soft_delete", self.config.vault_timeout(), self.vault.soft_delete(&path)).await {
                    warn!(flow = %flow.name(), path = %path, error = %e, "Vault soft delete failed");
                }
            }
            Ok(_) => {}
            Err(e) => debug!(flow = %flow.name(), change = %record, error = %e, "No index path for deleted row"),
        }
        pushed
    }

    /// Load the flow's table from the vault with its triggers dropped, so
    /// seeded rows are not reported as changes.
    #[instrument(skip(self, flow), fields(flow = %flow.name()))]
    pub async fn seed_from_vault(&self, flow: &FlowContext) -> Result<usize, FlowError> {
        let definition = flow.definition();
        let rows = match definition
            .seed_rows(self.vault.as_ref(), self.config.vault_timeout())
            .await?
        {
            Some(rows) => rows,
            None => self.index_seed_rows(flow).await?,
        };

        let seeded = self.load_rows_untracked(flow, &rows).await?;
        metrics::record_seeded_rows(flow.name(), seeded);
        info!(seeded, "Table seeded from vault");
        Ok(seeded)
    }

    /// Load the base rows kept under the flow's template path back into its
    /// table. A flow without a template path has nothing to reload.
    #[instrument(skip(self, flow), fields(flow = %flow.name()))]
    pub async fn reload_base_template(&self, flow: &FlowContext) -> Result<usize, FlowError> {
        let template = flow.header().template_path.trim_matches('/');
        if template.is_empty() {
            return Ok(0);
        }

        let rows = self.vault_rows(flow, template, None).await?;
        let loaded = self.load_rows_untracked(flow, &rows).await?;
        info!(loaded, template = %template, "Base template reloaded");
        Ok(loaded)
    }

    /// Insert or update `rows` with the table's triggers dropped, so they
    /// are not reported as changes.
    async fn load_rows_untracked(&self, flow: &FlowContext, rows: &[RowMap]) -> Result<usize, FlowError> {
        let definition = flow.definition();
        self.drop_table_triggers(flow).await?;
        let mut loaded = 0;
        for row in rows {
            let existing = self
                .call_db_query(flow, definition.select_by_identity(row).into(), &[])
                .await;
            let statement = match existing {
                Ok(result) if result.rows.is_empty() => definition.insert_statement(row),
                Ok(_) => definition.update_statement(row),
                Err(e) => {
                    warn!(error = %e, "Could not look up loaded row");
                    continue;
                }
            };
            match self.call_db_query(flow, statement.into(), &[]).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!(error = %e, "Could not load row"),
            }
        }
        self.create_table_triggers(flow).await?;
        Ok(loaded)
    }

    /// Rows stored under `super-secrets/Index/<source>/<indexColumn>`.
    async fn index_seed_rows(&self, flow: &FlowContext) -> Result<Vec<RowMap>, FlowError> {
        let base = format!(
            "super-secrets/Index/{}/{}",
            flow.header().source,
            flow.definition().index_column()
        );
        self.vault_rows(flow, &base, Some(flow.name())).await
    }

    /// Read every child of `base` as a row; `leaf` is appended to each
    /// child's path when set. Blank records are skipped.
    async fn vault_rows(&self, flow: &FlowContext, base: &str, leaf: Option<&str>) -> Result<Vec<RowMap>, FlowError> {
        let definition = flow.definition();
        let timeout = self.config.vault_timeout();

        let values = retry("vault_list", &RetryConfig::vault(), || {
            with_timeout("vault_list", timeout, self.vault.list(base))
        })
        .await?
        .unwrap_or_default();

        let mut rows = Vec::new();
        for value in values {
            let path = match leaf {
                Some(leaf) => format!("{}/{}/{}", base, value.trim_matches('/'), leaf),
                None => format!("{}/{}", base, value.trim_matches('/')),
            };
            match with_timeout("vault_read", timeout, self.vault.read(&path)).await {
                Ok(Some(data)) => {
                    if let Some(row) = definition.from_vault(&data) {
                        rows.push(row);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(path = %path, error = %e, "Could not read vault row"),
            }
        }
        Ok(rows)
    }
}

/// Statement truncating the flow's table.
pub(super) fn truncate_query(flow: &FlowContext) -> DbQuery {
    DbQuery::new(format!(
        "DELETE FROM {}",
        crate::engine::quote_ident(flow.definition().schema().table())
    ))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::storage::memory::{InMemoryRemote, InMemoryVault};
    use crate::storage::traits::{RemoteSource, VaultKv};
    use serde_json::json;
    use std::sync::Arc;

    fn row(value: Value) -> RowMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_vault_secret_path() {
        let header = FlowHeader::new("Jobs", "Flows", "TrcDb");
        assert_eq!(vault_secret_path(&header, "/id/a"), "super-secrets/Index/Flows/id/a/Jobs");
        assert_eq!(
            vault_secret_path(&header, "super-secrets/PublicIndex/TrcVault/x"),
            "super-secrets/PublicIndex/TrcVault/x"
        );
        assert_eq!(
            vault_secret_path(&header, "/PublicIndex/TrcVault/x"),
            "super-secrets/PublicIndex/TrcVault/x"
        );
    }

    #[tokio::test]
    async fn test_drain_removes_what_it_returns() {
        let machine = machine(Arc::new(InMemoryVault::new())).await;
        let flow = jobs_flow(&machine, None, FlowState::Running, SyncMode::NoSync).await;
        machine.engine().query("INSERT INTO Jobs VALUES ('a', '1'), ('b', '2')").await.unwrap();
        machine.engine().query("UPDATE Jobs SET val = '3' WHERE id = 'a'").await.unwrap();

        let drained = machine.remove_changed_table_entries(&flow).await.unwrap();
        let ids: Vec<String> = drained.iter().map(ToString::to_string).collect();
        assert_eq!(drained.len(), 2);
        assert!(ids.contains(&"a".to_string()) && ids.contains(&"b".to_string()));
        assert!(machine.remove_changed_table_entries(&flow).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_writes_rows_to_vault() {
        let vault = Arc::new(InMemoryVault::new());
        let machine = machine(vault.clone()).await;
        let flow = jobs_flow(&machine, None, FlowState::Running, SyncMode::NoSync).await;
        machine.engine().query("INSERT INTO Jobs VALUES ('a', '1')").await.unwrap();

        let summary = machine.vault_persist_push_remote_changes(&flow).await.unwrap();
        assert_eq!(summary.written, 1);
        let stored = vault.read("super-secrets/Index/Flows/id/a/Jobs").await.unwrap().unwrap();
        assert_eq!(stored["val"], "1");
    }

    #[tokio::test]
    async fn test_failed_write_is_reinjected() {
        let vault = Arc::new(InMemoryVault::new());
        let machine = machine(vault.clone()).await;
        let flow = jobs_flow(&machine, None, FlowState::Running, SyncMode::NoSync).await;
        machine.engine().query("INSERT INTO Jobs VALUES ('a', '1')").await.unwrap();
        vault.fail_next_writes(1);

        let summary = machine.vault_persist_push_remote_changes(&flow).await.unwrap();
        assert_eq!(summary.reinjected, 1);
        let pending = machine.engine().query("SELECT id FROM Jobs_Changes").await.unwrap();
        assert_eq!(pending.rows, vec![vec![json!("a")]]);

        let summary = machine.vault_persist_push_remote_changes(&flow).await.unwrap();
        assert_eq!(summary.written, 1);
        assert_eq!(vault.write_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_pushes_marker_and_soft_deletes() {
        let vault = Arc::new(InMemoryVault::new());
        let remote = Arc::new(InMemoryRemote::new("id"));
        remote.set_row(row(json!({"id": "a", "val": "1"})));
        let machine = machine(vault.clone()).await;
        let connection: Arc<dyn RemoteSource> = remote.clone();
        let flow = jobs_flow(&machine, Some(connection), FlowState::Running, SyncMode::Push).await;

        machine.engine().query("INSERT INTO Jobs VALUES ('a', '1')").await.unwrap();
        machine.vault_persist_push_remote_changes(&flow).await.unwrap();
        machine.engine().query("DELETE FROM Jobs WHERE id = 'a'").await.unwrap();

        let summary = machine.vault_persist_push_remote_changes(&flow).await.unwrap();
        assert_eq!(summary.deleted, 1);
        assert!(vault.is_deleted("super-secrets/Index/Flows/id/a/Jobs"));
        assert!(remote.row("a").is_none());
        let marker = remote.upserted().last().cloned().unwrap();
        assert_eq!(marker["Deleted"], "true");
        assert_eq!(marker["changedId"], "a");
    }

    #[tokio::test]
    async fn test_read_only_flow_skips_vault() {
        let vault = Arc::new(InMemoryVault::new());
        let machine = machine(vault.clone()).await;
        let flow = jobs_flow(&machine, None, FlowState::Running, SyncMode::NoSync).await;
        flow.set_read_only(true);
        machine.engine().query("INSERT INTO Jobs VALUES ('a', '1')").await.unwrap();

        let summary = machine.vault_persist_push_remote_changes(&flow).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(vault.write_count(), 0);
    }

    #[tokio::test]
    async fn test_seed_skips_blank_records_and_records_no_changes() {
        let vault = Arc::new(InMemoryVault::new());
        vault
            .write("super-secrets/Index/Flows/id/a/Jobs", &row(json!({"id": "a", "val": "1"})))
            .await
            .unwrap();
        vault
            .write("super-secrets/Index/Flows/id/b/Jobs", &row(json!({"id": "", "val": ""})))
            .await
            .unwrap();
        let machine = machine(vault).await;
        let flow = jobs_flow(&machine, None, FlowState::Running, SyncMode::NoSync).await;

        assert_eq!(machine.seed_from_vault(&flow).await.unwrap(), 1);
        let rows = machine.engine().query("SELECT id, val FROM Jobs").await.unwrap();
        assert_eq!(rows.rows, vec![vec![json!("a"), json!("1")]]);

        let pending = machine.engine().query("SELECT id FROM Jobs_Changes").await.unwrap();
        assert!(pending.rows.is_empty());
        assert_eq!(machine.engine().trigger_names("Jobs").await.unwrap().len(), 3);
    }
}

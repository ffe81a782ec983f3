// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Vault sync cycle: seed on start, then persist changes until cancelled.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::FlowMachineContext;
use crate::flow::{FlowContext, FlowError, FlowState, SyncMode};
use crate::statistics::{DataFlowTree, DeliverySummary, StatisticSink};

impl FlowMachineContext {
    /// Start a sync cycle for `flow` and leave its change loop running in
    /// the background.
    pub async fn sync_table_cycle(self: &Arc<Self>, flow: &Arc<FlowContext>) -> Result<(), FlowError> {
        let token = self.begin_sync_cycle(flow).await?;
        let machine = Arc::clone(self);
        let flow = Arc::clone(flow);
        tokio::spawn(async move { machine.seed_vault_cycle(flow, token).await });
        Ok(())
    }

    /// Everything a sync cycle does before its change loop starts.
    ///
    /// ```text
    /// Loading(1) ─► reset pullsynccomplete ─► seed (unless restarting) ─► Load complete(2)
    /// ```
    #[instrument(skip(self, flow), fields(flow = %flow.name()))]
    async fn begin_sync_cycle(&self, flow: &FlowContext) -> Result<CancellationToken, FlowError> {
        let token = flow.begin_sync_cycle(&self.shutdown);

        let alias = {
            let state = flow.flow_state();
            if state.flow_alias.is_empty() {
                flow.name().to_string()
            } else {
                state.flow_alias
            }
        };
        let mut tree = DataFlowTree::init_data_flow(None, flow.name(), true);
        tree.update_data_flow_statistic("Flows", &alias, "Loading", "1", 1, None);

        if flow.sync_mode() == SyncMode::PullSyncComplete {
            flow.set_sync_mode(SyncMode::PullComplete);
            flow.push_state(flow.new_flow_state_update(FlowState::Running, SyncMode::PullComplete))
                .await?;
        }

        if flow.is_restart() {
            info!("Restarting cycle, table is not reseeded");
        } else if let Err(e) = self.seed_from_vault(flow).await {
            error!(error = %e, "Seeding from vault failed");
        }

        tree.update_data_flow_statistic("Flows", &alias, "Load complete", "2", 1, None);

        if flow.wants_init_notify() {
            let delivered = self.deliver_load_statistics(&tree).await;
            info!(sql = delivered.sql, vault = delivered.vault, failed = delivered.failed, "Load statistics delivered");
            flow.notify_changed();
        } else if flow.state() == FlowState::Running {
            info!("Flow ready for use");
        } else {
            warn!(state = %flow.state(), "Unexpected flow state");
        }
        Ok(token)
    }

    async fn deliver_load_statistics(&self, tree: &DataFlowTree) -> DeliverySummary {
        let has_table = self
            .engine
            .table_exists(&self.config.statistics_table)
            .await
            .unwrap_or(false);
        let sink = StatisticSink {
            vault: Some(self.vault.as_ref()),
            engine: has_table.then_some(self.engine.as_ref()),
            statistics_table: &self.config.statistics_table,
            timeout: self.config.vault_timeout(),
        };
        tree.finish_statistic(
            &sink,
            &self.config.stats_id,
            &self.config.stats_index_path,
            &self.config.stats_id_name,
        )
        .await
    }

    /// Persist changes on every change signal. On cancellation, flush once
    /// more; a restarting flow then begins a new cycle in place.
    async fn seed_vault_cycle(self: Arc<Self>, flow: Arc<FlowContext>, mut token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Err(e) = self.vault_persist_push_remote_changes(&flow).await {
                        warn!(flow = %flow.name(), error = %e, "Final flush failed");
                    }
                    if !flow.is_restart() || self.is_shutdown() {
                        info!(flow = %flow.name(), "Sync cycle finished");
                        return;
                    }
                    match self.begin_sync_cycle(&flow).await {
                        Ok(next) => token = next,
                        Err(e) => {
                            error!(flow = %flow.name(), error = %e, "Could not restart sync cycle");
                            return;
                        }
                    }
                    flow.set_restart(false);
                }
                _ = flow.changed() => {
                    if let Err(e) = self.vault_persist_push_remote_changes(&flow).await {
                        warn!(flow = %flow.name(), error = %e, "Persisting changes failed");
                    }
                }
            }
        }
    }
}

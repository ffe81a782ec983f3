// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-flow tick loop.
//!
//! | State      | Tick                                                        |
//! |------------|-------------------------------------------------------------|
//! | Stopping   | cancel the sync cycle (it flushes), reload the base         |
//! |            | template, request Offline                                   |
//! | Offline    | nothing                                                     |
//! | Restarting | truncate the table, request Running, re-arm the sync cycle  |
//! | Running    | start the sync cycle once, then pull or push per sync mode  |
//! | Failed     | nothing; the table could not be created                     |
//!
//! A tick sends at most one state update. A requested state is applied
//! locally at once, so the next tick does not request it again while the
//! controller's echo is in flight.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::changes::truncate_query;
use super::{DbQuery, FlowMachineContext, TickOutcome};
use crate::flow::{FlowContext, FlowError, FlowState, StateApply, SyncMode};
use crate::metrics;
use crate::resilience::retry::with_timeout;

/// Tick period of flows without an ingest interval.
const IDLE_TICK: Duration = Duration::from_secs(1);

fn sync_check(mode: &SyncMode) -> String {
    match mode {
        SyncMode::NoSync => String::new(),
        mode => format!(" with sync mode {}", mode),
    }
}

impl FlowMachineContext {
    /// Set up `flow` and run its tick loop until shutdown.
    pub async fn process_table_flow(self: Arc<Self>, flow: Arc<FlowContext>) -> Result<(), FlowError> {
        self.add_table_schema(&flow).await?;
        self.create_table_triggers(&flow).await?;

        let listener = self.spawn_state_listener(Arc::clone(&flow));

        let period = match flow.remote().ingest_interval() {
            d if d.is_zero() => IDLE_TICK,
            d => d,
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sync_init = true;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let outcome = self.tick(&flow, &mut sync_init).await;
                    metrics::record_tick(flow.name(), outcome.as_str());
                }
            }
        }

        flow.set_restart(false);
        flow.cancel_the_context();
        listener.abort();
        info!(flow = %flow.name(), "Flow stopped");
        Ok(())
    }

    /// Apply controller states to `flow` as they arrive.
    fn spawn_state_listener(&self, flow: Arc<FlowContext>) -> tokio::task::JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let state = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    state = flow.remote().recv_state() => match state {
                        Some(state) => state,
                        None => break,
                    },
                };
                match flow.apply_controller_state(state) {
                    StateApply::Rejected(echo) => {
                        if let Err(e) = flow.push_state(echo).await {
                            warn!(flow = %flow.name(), error = %e, "Could not echo rejected state");
                        }
                    }
                    StateApply::Applied => debug!(flow = %flow.name(), state = %flow.state(), "Controller state applied"),
                    StateApply::Unchanged => {}
                }
            }
        })
    }

    /// Request `state`, applying it locally once the request is sent.
    pub(super) async fn request_state(&self, flow: &FlowContext, state: FlowState, mode: SyncMode) -> Result<(), FlowError> {
        flow.push_state(flow.new_flow_state_update(state, mode.clone())).await?;
        flow.set_state(state);
        flow.set_sync_mode(mode);
        Ok(())
    }

    /// Cycle a running flow through Stopping and Offline back to Restarting.
    ///
    /// Fails when the flow does not reach Offline within `state_wait_secs`,
    /// e.g. because the controller rejected Stopping.
    pub async fn restart_flow(&self, flow: &FlowContext) -> Result<(), FlowError> {
        flow.notify_flow_component_needs_restart(self.config.state_wait()).await
    }

    /// One pass of the state machine for `flow`.
    ///
    /// `sync_init` is set while the flow's sync cycle still has to be
    /// started; the Running branch clears it.
    #[instrument(skip(self, flow, sync_init), fields(flow = %flow.name(), state = %flow.state()))]
    pub async fn tick(self: &Arc<Self>, flow: &Arc<FlowContext>, sync_init: &mut bool) -> TickOutcome {
        match flow.state() {
            FlowState::Stopping => {
                flow.set_restart(false);
                flow.cancel_the_context();
                info!("Table flow is being stopped");
                if let Err(e) = self.reload_base_template(flow).await {
                    warn!(error = %e, "Could not reload base template");
                }
                if let Err(e) = self.request_state(flow, FlowState::Offline, flow.sync_mode()).await {
                    error!(error = %e, "Could not request Offline");
                }
                TickOutcome::Stopped
            }
            FlowState::Offline => {
                debug!("Table flow is currently offline");
                TickOutcome::Offline
            }
            FlowState::Failed => TickOutcome::Failed,
            FlowState::Restarting => {
                info!("Table flow is restarting");
                *sync_init = true;
                self.truncate_table(flow).await;
                if let Err(e) = self.request_state(flow, FlowState::Running, flow.sync_mode()).await {
                    error!(error = %e, "Could not request Running");
                }
                TickOutcome::Restarted
            }
            FlowState::Running => {
                if *sync_init {
                    if let Err(e) = self.sync_table_cycle(flow).await {
                        error!(error = %e, "Could not start sync cycle");
                        return TickOutcome::Idle;
                    }
                    *sync_init = false;
                }
                self.run_sync_mode(flow).await
            }
        }
    }

    async fn run_sync_mode(&self, flow: &FlowContext) -> TickOutcome {
        let mode = flow.sync_mode();
        let syncs_remote = !flow.remote().ingest_interval().is_zero();
        if !syncs_remote || !(mode.is_pull() || mode.is_push()) {
            debug!("Table is setup{}", sync_check(&mode));
            return TickOutcome::Idle;
        }

        info!("Table is running and checking for changes{}", sync_check(&mode));
        match mode {
            SyncMode::PushOnce => self.push_table_once(flow).await,
            SyncMode::Push => TickOutcome::Watching,
            _ => self.pull_table(flow).await,
        }
    }

    /// Empty the mirrored table and its pending changes; the next cycle
    /// reseeds it.
    async fn truncate_table(&self, flow: &FlowContext) {
        if let Err(e) = self.call_db_query(flow, truncate_query(flow), &[]).await {
            warn!(flow = %flow.name(), error = %e, "Could not truncate table");
            return;
        }
        let _guard = self.changes_lock.lock().await;
        if let Err(e) = self.engine.query(&flow.definition().change_table().truncate_sql()).await {
            warn!(flow = %flow.name(), error = %e, "Could not clear change table");
        }
    }

    /// Merge the remote's rows into the table: insert what is missing,
    /// update what differs.
    async fn pull_table(&self, flow: &FlowContext) -> TickOutcome {
        let Some(connection) = flow.remote().connection() else {
            warn!(flow = %flow.name(), "Pull mode without a remote connection");
            return TickOutcome::Idle;
        };
        let definition = flow.definition();

        let pulled = match with_timeout(
            "remote_pull",
            self.config.remote_timeout(),
            definition.pull_remote(connection.as_ref()),
        )
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                metrics::record_pull_error(flow.name());
                error!(flow = %flow.name(), error = %e, "Pull from remote failed");
                if let Err(e) = self.request_state(flow, FlowState::Running, SyncMode::PullError).await {
                    warn!(error = %e, "Could not report pull error");
                }
                return TickOutcome::PullFailed;
            }
        };

        let (mut inserted, mut updated) = (0, 0);
        for raw in &pulled {
            let row = definition.to_row(raw);
            if !flow.passes_sync_filter(&definition.row_id(&row)) {
                continue;
            }

            let local = match self.call_db_query(flow, definition.select_by_identity(&row).into(), &[]).await {
                Ok(result) => result.to_maps(),
                Err(e) => {
                    warn!(flow = %flow.name(), error = %e, "Could not look up pulled row");
                    continue;
                }
            };

            let statement = match local.first() {
                None => {
                    debug!(flow = %flow.name(), "Inserting pulled row");
                    inserted += 1;
                    definition.insert_statement(&row)
                }
                Some(existing) if !definition.compare_rows(&row, existing) => {
                    debug!(flow = %flow.name(), "Updating pulled row");
                    updated += 1;
                    definition.update_statement(&row)
                }
                Some(_) => continue,
            };
            if let Err(e) = self
                .call_db_query(flow, DbQuery::from(statement), &[flow.name()])
                .await
            {
                warn!(flow = %flow.name(), error = %e, "Could not merge pulled row");
            }
        }
        metrics::record_pull_merge(flow.name(), inserted, updated);

        if flow.sync_mode() == SyncMode::PullOnce {
            info!(flow = %flow.name(), inserted, updated, "Pull complete");
            if let Err(e) = self.request_state(flow, FlowState::Running, SyncMode::PullComplete).await {
                warn!(error = %e, "Could not report pull complete");
            }
        }
        TickOutcome::Pulled { inserted, updated }
    }

    /// Push every row passing the sync filter, once. Any failure ends the
    /// pass in `pusherror`; otherwise it ends in `pushcomplete`.
    async fn push_table_once(&self, flow: &FlowContext) -> TickOutcome {
        let definition = flow.definition();
        let select = DbQuery::new(format!(
            "SELECT * FROM {}",
            crate::engine::quote_ident(definition.schema().table())
        ));
        let rows = match self.call_db_query(flow, select, &[]).await {
            Ok(result) => result.to_maps(),
            Err(e) => {
                warn!(flow = %flow.name(), error = %e, "Could not read table to push");
                return TickOutcome::PushFailed;
            }
        };
        if rows.is_empty() {
            info!(flow = %flow.name(), "Nothing in table to push out yet");
            return TickOutcome::NothingToPush;
        }

        let outcome = match flow.remote().connection() {
            None => {
                warn!(flow = %flow.name(), "Push mode without a remote connection");
                TickOutcome::PushFailed
            }
            Some(connection) => {
                let mut pushed = 0;
                let mut failed = false;
                for row in rows.iter().filter(|r| flow.passes_sync_filter(&definition.row_id(r))) {
                    match with_timeout(
                        "remote_upsert",
                        self.config.remote_timeout(),
                        definition.push_remote(connection.as_ref(), row),
                    )
                    .await
                    {
                        Ok(()) => {
                            metrics::record_remote_push(flow.name(), "success");
                            pushed += 1;
                        }
                        Err(e) => {
                            metrics::record_remote_push(flow.name(), "error");
                            error!(flow = %flow.name(), error = %e, "Error pushing out table");
                            failed = true;
                            break;
                        }
                    }
                }
                if failed {
                    TickOutcome::PushFailed
                } else {
                    TickOutcome::Pushed { pushed }
                }
            }
        };

        let mode = match outcome {
            TickOutcome::Pushed { .. } => SyncMode::PushComplete,
            _ => SyncMode::PushError,
        };
        if let Err(e) = self.request_state(flow, FlowState::Running, mode).await {
            warn!(error = %e, "Could not report push result");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::flow::{CurrentFlowState, FlowHeader, RemoteDataSource};
    use crate::storage::memory::{InMemoryRemote, InMemoryVault};
    use crate::storage::traits::{RemoteSource, RowMap, VaultKv};
    use serde_json::{json, Value};

    fn row(value: Value) -> RowMap {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn setup(
        state: FlowState,
        mode: SyncMode,
    ) -> (Arc<FlowMachineContext>, Arc<FlowContext>, Arc<InMemoryRemote>) {
        let remote = Arc::new(InMemoryRemote::new("id"));
        let machine = machine(Arc::new(InMemoryVault::new())).await;
        let connection: Arc<dyn RemoteSource> = remote.clone();
        let flow = jobs_flow(&machine, Some(connection), state, mode).await;
        (machine, flow, remote)
    }

    #[tokio::test]
    async fn test_stopping_requests_offline_once() {
        let (machine, flow, _remote) = setup(FlowState::Stopping, SyncMode::Push).await;
        let mut sync_init = false;

        assert_eq!(machine.tick(&flow, &mut sync_init).await, TickOutcome::Stopped);
        assert_eq!(flow.state(), FlowState::Offline);
        assert_eq!(machine.tick(&flow, &mut sync_init).await, TickOutcome::Offline);
    }

    #[tokio::test]
    async fn test_stopping_reloads_base_template() {
        let vault = Arc::new(InMemoryVault::new());
        vault
            .write("templates/Jobs/a", &row(json!({"id": "a", "val": "base"})))
            .await
            .unwrap();
        let machine = machine(vault).await;
        let (remote, handle) = RemoteDataSource::new(None, Duration::from_millis(20), 8);
        let header = FlowHeader::new("Jobs", "Flows", "TrcDb").with_template_path("templates/Jobs");
        let flow = machine.register_flow_context(Arc::new(FlowContext::new(header, jobs_definition(), remote)), handle);
        machine
            .controller()
            .set_state("Jobs", CurrentFlowState { state: FlowState::Stopping, ..Default::default() })
            .await
            .unwrap();
        machine.add_table_schema(&flow).await.unwrap();
        machine.create_table_triggers(&flow).await.unwrap();
        machine.engine().query("INSERT INTO Jobs VALUES ('a', 'edited')").await.unwrap();
        machine.remove_changed_table_entries(&flow).await.unwrap();

        let mut sync_init = false;
        assert_eq!(machine.tick(&flow, &mut sync_init).await, TickOutcome::Stopped);
        let rows = machine.engine().query("SELECT id, val FROM Jobs").await.unwrap();
        assert_eq!(rows.rows, vec![vec![json!("a"), json!("base")]]);
        // Reloaded rows are not changes, and the triggers are back
        let pending = machine.engine().query("SELECT id FROM Jobs_Changes").await.unwrap();
        assert!(pending.rows.is_empty());
        assert_eq!(machine.engine().trigger_names("Jobs").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_restart_rejected_from_restarting_times_out() {
        let (machine, flow, _remote) = setup(FlowState::Restarting, SyncMode::NoSync).await;
        let listener = machine.spawn_state_listener(Arc::clone(&flow));

        let err = machine.restart_flow(&flow).await.unwrap_err();
        assert!(matches!(err, FlowError::StateWait { state: FlowState::Offline, .. }));
        assert_eq!(flow.state(), FlowState::Restarting);
        listener.abort();
    }

    #[tokio::test]
    async fn test_restarting_truncates_and_requests_running() {
        let (machine, flow, _remote) = setup(FlowState::Restarting, SyncMode::NoSync).await;
        machine.engine().query("INSERT INTO Jobs VALUES ('a', '1')").await.unwrap();
        let mut sync_init = false;

        assert_eq!(machine.tick(&flow, &mut sync_init).await, TickOutcome::Restarted);
        assert!(sync_init);
        assert_eq!(flow.state(), FlowState::Running);
        let rows = machine.engine().query("SELECT * FROM Jobs").await.unwrap();
        assert!(rows.rows.is_empty());
        let pending = machine.engine().query("SELECT * FROM Jobs_Changes").await.unwrap();
        assert!(pending.rows.is_empty());
    }

    #[tokio::test]
    async fn test_pull_failure_sets_pull_error() {
        let (machine, flow, remote) = setup(FlowState::Running, SyncMode::Pull).await;
        remote.set_fail_pulls(true);
        let mut sync_init = false;

        assert_eq!(machine.tick(&flow, &mut sync_init).await, TickOutcome::PullFailed);
        assert_eq!(flow.sync_mode(), SyncMode::PullError);
    }

    #[tokio::test]
    async fn test_pull_skips_equal_rows() {
        let (machine, flow, remote) = setup(FlowState::Running, SyncMode::Pull).await;
        machine.engine().query("INSERT INTO Jobs VALUES ('a', '1')").await.unwrap();
        remote.set_row(row(json!({"id": "a", "val": "1"})));
        let mut sync_init = false;

        assert_eq!(
            machine.tick(&flow, &mut sync_init).await,
            TickOutcome::Pulled { inserted: 0, updated: 0 }
        );
        assert_eq!(flow.sync_mode(), SyncMode::Pull);
    }

    #[tokio::test]
    async fn test_pushonce_failure_ends_in_push_error() {
        let (machine, flow, remote) = setup(FlowState::Running, SyncMode::PushOnce).await;
        machine.engine().query("INSERT INTO Jobs VALUES ('a', '1')").await.unwrap();
        remote.fail_next_upserts(1);
        let mut sync_init = false;

        assert_eq!(machine.tick(&flow, &mut sync_init).await, TickOutcome::PushFailed);
        assert_eq!(flow.sync_mode(), SyncMode::PushError);
        // No longer pushonce: the next tick idles
        assert_eq!(machine.tick(&flow, &mut sync_init).await, TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_pushonce_on_empty_table_waits() {
        let (machine, flow, _remote) = setup(FlowState::Running, SyncMode::PushOnce).await;
        let mut sync_init = false;
        assert_eq!(machine.tick(&flow, &mut sync_init).await, TickOutcome::NothingToPush);
        assert_eq!(flow.sync_mode(), SyncMode::PushOnce);
    }

    #[tokio::test]
    async fn test_unreadable_table_skips_pull_and_push() {
        let (machine, flow, remote) = setup(FlowState::Running, SyncMode::Pull).await;
        remote.set_row(row(json!({"id": "a", "val": "1"})));
        machine.engine().query("DROP TABLE Jobs").await.unwrap();
        let mut sync_init = false;

        assert_eq!(
            machine.tick(&flow, &mut sync_init).await,
            TickOutcome::Pulled { inserted: 0, updated: 0 }
        );

        flow.set_sync_mode(SyncMode::PushOnce);
        assert_eq!(machine.tick(&flow, &mut sync_init).await, TickOutcome::PushFailed);
        // Left in pushonce, so the next tick tries again
        assert_eq!(flow.sync_mode(), SyncMode::PushOnce);
        assert!(remote.upserted().is_empty());
    }

    #[tokio::test]
    async fn test_push_mode_watches() {
        let (machine, flow, _remote) = setup(FlowState::Running, SyncMode::Push).await;
        let mut sync_init = false;
        assert_eq!(machine.tick(&flow, &mut sync_init).await, TickOutcome::Watching);
    }
}

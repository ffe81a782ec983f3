// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Table, change table and trigger setup.

use tracing::{error, info, warn};

use super::FlowMachineContext;
use crate::engine::quote_ident;
use crate::flow::{CurrentFlowState, FlowContext, FlowError, FlowState, SyncMode};

impl FlowMachineContext {
    /// Create the flow's table and change table if absent, then settle its
    /// initial state.
    ///
    /// The controller flow starts Running with no sync. Every other flow
    /// waits up to `state_wait_secs` for its first controller state and goes
    /// Offline (`nosync`) if none arrives. A table that cannot be created
    /// leaves the flow Failed.
    #[tracing::instrument(skip(self, flow), fields(flow = %flow.name()))]
    pub async fn add_table_schema(&self, flow: &FlowContext) -> Result<(), FlowError> {
        let definition = flow.definition();
        let table = definition.schema().table().to_string();

        {
            let _guard = self.table_modifier_lock.lock().await;
            let exists = match self.engine.table_exists(&table).await {
                Ok(exists) => exists,
                Err(e) => return Err(self.fail_flow(flow, e.into())),
            };

            if exists {
                info!("Recognized table");
            } else {
                if let Err(e) = self.engine.query(&definition.schema().create_table_sql()).await {
                    return Err(self.fail_flow(flow, e.into()));
                }
                if let Err(e) = self.engine.query(&definition.change_table().create_sql()).await {
                    return Err(self.fail_flow(flow, e.into()));
                }
                info!("Table created");
            }
        }

        if table == self.config.controller_flow_name {
            flow.apply_initial_state(CurrentFlowState {
                state: FlowState::Running,
                sync_mode: SyncMode::NoSync,
                ..Default::default()
            });
            info!("Table is setup");
            return Ok(());
        }

        match tokio::time::timeout(self.config.state_wait(), flow.remote().recv_state()).await {
            Ok(Some(state)) => {
                flow.apply_initial_state(state);
                info!(state = %flow.state(), mode = %flow.sync_mode(), "Table is setup");
            }
            Ok(None) | Err(_) => {
                flow.apply_initial_state(CurrentFlowState {
                    state: FlowState::Offline,
                    sync_mode: SyncMode::NoSync,
                    ..Default::default()
                });
                warn!("Flow ready for use (but inactive due to invalid setup)");
            }
        }
        Ok(())
    }

    fn fail_flow(&self, flow: &FlowContext, e: FlowError) -> FlowError {
        error!(flow = %flow.name(), error = %e, "Could not create table");
        flow.apply_initial_state(CurrentFlowState {
            state: FlowState::Failed,
            sync_mode: SyncMode::NoSync,
            ..Default::default()
        });
        FlowError::Schema(format!("Could not create table {}: {}", flow.name(), e))
    }

    /// Create whichever of the flow's change triggers do not exist yet.
    pub async fn create_table_triggers(&self, flow: &FlowContext) -> Result<usize, FlowError> {
        let table = flow.definition().schema().table().to_string();
        let _guard = self.table_modifier_lock.lock().await;

        let existing = self.engine.trigger_names(&table).await?;
        let mut created = 0;
        for (name, sql) in flow.definition().triggers() {
            if existing.contains(&name) {
                continue;
            }
            self.engine.query(&sql).await?;
            created += 1;
        }
        if created > 0 {
            info!(flow = %flow.name(), created, "Change triggers created");
        }
        Ok(created)
    }

    /// Drop the flow's change triggers, e.g. while seeding.
    pub(super) async fn drop_table_triggers(&self, flow: &FlowContext) -> Result<(), FlowError> {
        let _guard = self.table_modifier_lock.lock().await;
        for (name, _) in flow.definition().triggers() {
            self.engine
                .query(&format!("DROP TRIGGER IF EXISTS {}", quote_ident(&name)))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::flow::{FlowHeader, RemoteDataSource};
    use crate::storage::memory::InMemoryVault;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_schema_and_triggers_are_created_once() {
        let machine = machine(Arc::new(InMemoryVault::new())).await;
        let flow = jobs_flow(&machine, None, FlowState::Offline, SyncMode::Push).await;

        assert!(machine.engine().table_exists("Jobs").await.unwrap());
        assert!(machine.engine().table_exists("Jobs_Changes").await.unwrap());
        assert_eq!(machine.engine().trigger_names("Jobs").await.unwrap().len(), 3);
        assert_eq!(flow.sync_mode(), SyncMode::Push);

        assert_eq!(machine.create_table_triggers(&flow).await.unwrap(), 0);
        assert_eq!(machine.engine().trigger_names("Jobs").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_initial_state_goes_offline() {
        let machine = machine(Arc::new(InMemoryVault::new())).await;
        let (remote, handle) = RemoteDataSource::new(None, Duration::from_millis(20), 4);
        let flow = Arc::new(FlowContext::new(
            FlowHeader::new("Jobs", "Flows", "TrcDb"),
            jobs_definition(),
            remote,
        ));
        let flow = machine.register_flow_context(flow, handle);

        machine.add_table_schema(&flow).await.unwrap();
        assert_eq!(flow.state(), FlowState::Offline);
        assert_eq!(flow.sync_mode(), SyncMode::NoSync);
    }

    #[tokio::test]
    async fn test_controller_flow_starts_running() {
        let machine = machine(Arc::new(InMemoryVault::new())).await;
        let definition = Arc::new(crate::definition::GenericTableDefinition::new(
            super::super::controller_flow_schema("TierceronFlow"),
            "flowName",
        ));
        let flow = machine.register_flow(FlowHeader::new("TierceronFlow", "FlumeDatabase", "TrcDb"), definition, None);

        machine.add_table_schema(&flow).await.unwrap();
        assert_eq!(flow.state(), FlowState::Running);
    }

    #[tokio::test]
    async fn test_drop_triggers_then_restore() {
        let machine = machine(Arc::new(InMemoryVault::new())).await;
        let flow = jobs_flow(&machine, None, FlowState::Offline, SyncMode::Push).await;

        machine.drop_table_triggers(&flow).await.unwrap();
        assert!(machine.engine().trigger_names("Jobs").await.unwrap().is_empty());
        assert_eq!(machine.create_table_triggers(&flow).await.unwrap(), 3);
    }
}

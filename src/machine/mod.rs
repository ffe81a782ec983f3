// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Flow machine.
//!
//! The [`FlowMachineContext`] ties the shared pieces together:
//! - the embedded [`QueryEngine`] every flow mirrors its table into
//! - the vault the mirrored rows are persisted to
//! - the registry of [`FlowContext`]s, one per table
//! - the [`FlowStateController`] on the other end of the flows' state channels
//!
//! # Per-flow lifecycle
//!
//! ```text
//! add_table_schema ─► create_table_triggers ─► tick loop
//!                                                │ Running (first tick)
//!                                                ▼
//!                                   sync_table_cycle (seed from vault)
//!                                                │ spawn
//!                                                ▼
//!                              seed_vault_cycle: drain changes ─► vault / remote
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flow_sync::{FlowEngineConfig, FlowMachineContext, FlowHeader, InMemoryVault};
//! use flow_sync::definition::{ColumnType, FlowColumn, GenericTableDefinition, TableSchema};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), flow_sync::FlowError> {
//! let machine = Arc::new(
//!     FlowMachineContext::new(FlowEngineConfig::default(), Arc::new(InMemoryVault::new())).await?,
//! );
//!
//! let schema = TableSchema::new("Jobs", vec![
//!     FlowColumn::new("id", ColumnType::Text).primary_key(),
//!     FlowColumn::new("val", ColumnType::Text),
//! ]);
//! let jobs = machine.register_flow(
//!     FlowHeader::new("Jobs", "Flows", "TrcDb"),
//!     Arc::new(GenericTableDefinition::new(schema, "id")),
//!     None,
//! );
//! let _task = machine.start_flow(jobs);
//! # Ok(())
//! # }
//! ```

mod changes;
mod controller;
mod cycle;
mod process;
mod query;
mod schema;
mod types;

pub use changes::vault_secret_path;
pub use controller::{
    controller_flow_schema, controller_row_state, FlowStateController, CONTROLLER_ID_COLUMN, HISTORY_LIMIT,
};
pub use types::{DbQuery, PersistSummary, TickOutcome};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::FlowEngineConfig;
use crate::definition::FlowDefinition;
use crate::engine::QueryEngine;
use crate::flow::{FlowContext, FlowError, FlowHeader, FlowStateHandle, RemoteDataSource};
use crate::storage::traits::{RemoteSource, VaultKv};

/// Shared state of all flows in one engine.
///
/// # Thread Safety
///
/// Held in an `Arc` and shared by every flow task. Statement execution is
/// serialized by the engine; the change drain and table modifications have
/// their own locks.
pub struct FlowMachineContext {
    pub(super) config: FlowEngineConfig,

    /// Embedded database holding every mirrored table
    pub(super) engine: Arc<QueryEngine>,

    pub(super) vault: Arc<dyn VaultKv>,

    /// Registered flows by table name
    pub(super) flows: DashMap<String, Arc<FlowContext>>,

    pub(super) controller: FlowStateController,

    /// Serializes the select-then-delete drain of change tables
    pub(super) changes_lock: Mutex<()>,

    /// Serializes table, change table and trigger creation
    pub(super) table_modifier_lock: Mutex<()>,

    /// Parent of every flow's sync-cycle token
    pub(super) shutdown: CancellationToken,
}

impl FlowMachineContext {
    /// Create the machine and its embedded database.
    ///
    /// Failing to open the database is the one fatal error.
    #[tracing::instrument(skip(config, vault), fields(database = %config.database_name))]
    pub async fn new(config: FlowEngineConfig, vault: Arc<dyn VaultKv>) -> Result<Self, FlowError> {
        let engine = QueryEngine::new(config.database_name.clone())
            .await
            .map_err(|e| {
                error!(error = %e, "Could not create embedded database");
                FlowError::Bootstrap(e.to_string())
            })?;

        let shutdown = CancellationToken::new();
        info!("Flow machine ready");
        Ok(Self {
            config,
            engine: Arc::new(engine),
            vault,
            flows: DashMap::new(),
            controller: FlowStateController::new(shutdown.clone()),
            changes_lock: Mutex::new(()),
            table_modifier_lock: Mutex::new(()),
            shutdown,
        })
    }

    #[must_use]
    pub fn config(&self) -> &FlowEngineConfig {
        &self.config
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<QueryEngine> {
        &self.engine
    }

    #[must_use]
    pub fn vault(&self) -> &Arc<dyn VaultKv> {
        &self.vault
    }

    #[must_use]
    pub fn controller(&self) -> &FlowStateController {
        &self.controller
    }

    /// Build a flow with the configured ingest interval and register it.
    pub fn register_flow(
        &self,
        header: FlowHeader,
        definition: Arc<dyn FlowDefinition>,
        connection: Option<Arc<dyn RemoteSource>>,
    ) -> Arc<FlowContext> {
        let (remote, handle) = RemoteDataSource::with_config(connection, &self.config);
        self.register_flow_context(Arc::new(FlowContext::new(header, definition, remote)), handle)
    }

    /// Register an already built flow; its state handle goes to the controller.
    pub fn register_flow_context(&self, flow: Arc<FlowContext>, handle: FlowStateHandle) -> Arc<FlowContext> {
        let name = flow.name().to_string();
        self.controller.attach(&name, handle);
        self.flows.insert(name.clone(), Arc::clone(&flow));
        info!(flow = %name, "Flow registered");
        flow
    }

    #[must_use]
    pub fn get_flow_context(&self, name: &str) -> Option<Arc<FlowContext>> {
        self.flows.get(name).map(|f| Arc::clone(f.value()))
    }

    #[must_use]
    pub fn flow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.flows.iter().map(|f| f.key().clone()).collect();
        names.sort();
        names
    }

    /// Run `flow` until shutdown.
    pub fn start_flow(self: &Arc<Self>, flow: Arc<FlowContext>) -> JoinHandle<Result<(), FlowError>> {
        let machine = Arc::clone(self);
        tokio::spawn(async move { machine.process_table_flow(flow).await })
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop every flow. Sync cycles flush pending changes before exiting.
    pub fn shutdown(&self) {
        info!(flows = self.flows.len(), "Shutting down flow machine");
        self.shutdown.cancel();
        self.controller.stop();
    }
}

impl std::fmt::Debug for FlowMachineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowMachineContext")
            .field("database", &self.engine.database_name())
            .field("flows", &self.flow_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::definition::{ColumnType, FlowColumn, GenericTableDefinition, TableSchema};
    use crate::flow::{CurrentFlowState, FlowState, SyncMode};
    use crate::storage::memory::InMemoryVault;
    use std::time::Duration;

    pub fn jobs_definition() -> Arc<GenericTableDefinition> {
        Arc::new(GenericTableDefinition::new(
            TableSchema::new(
                "Jobs",
                vec![
                    FlowColumn::new("id", ColumnType::Text).primary_key(),
                    FlowColumn::new("val", ColumnType::Text),
                ],
            ),
            "id",
        ))
    }

    pub fn test_config() -> FlowEngineConfig {
        FlowEngineConfig {
            ingest_interval_ms: 20,
            state_wait_secs: 1,
            vault_timeout_ms: 1_000,
            remote_timeout_ms: 1_000,
            ..Default::default()
        }
    }

    pub async fn machine(vault: Arc<InMemoryVault>) -> Arc<FlowMachineContext> {
        Arc::new(FlowMachineContext::new(test_config(), vault).await.unwrap())
    }

    /// Register `Jobs`, create its schema and triggers, and set its state.
    pub async fn jobs_flow(
        machine: &FlowMachineContext,
        connection: Option<Arc<dyn RemoteSource>>,
        state: FlowState,
        mode: SyncMode,
    ) -> Arc<FlowContext> {
        let (remote, handle) = RemoteDataSource::new(connection, Duration::from_millis(20), 8);
        let flow = Arc::new(FlowContext::new(
            FlowHeader::new("Jobs", "Flows", "TrcDb"),
            jobs_definition(),
            remote,
        ));
        let flow = machine.register_flow_context(flow, handle);
        machine
            .controller()
            .set_state(
                "Jobs",
                CurrentFlowState {
                    state,
                    sync_mode: mode,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        machine.add_table_schema(&flow).await.unwrap();
        machine.create_table_triggers(&flow).await.unwrap();
        flow
    }
}

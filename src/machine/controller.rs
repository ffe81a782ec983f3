// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Controller side of the flows' state channels.
//!
//! Each attached flow gets one echo task. Whatever the flow pushes
//! (a requested transition, an acknowledgement, a rejected-transition echo)
//! is recorded and sent straight back as the flow's current state:
//!
//! ```text
//! flow ── FlowStateUpdate{Offline} ──► echo task ── CurrentFlowState{Offline} ──► flow
//! ```
//!
//! Operators drive flows through [`FlowStateController::set_state`], or by
//! writing rows of the controller flow table (see [`controller_flow_schema`]).

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::FlowMachineContext;
use crate::definition::{ColumnType, FlowColumn, TableSchema};
use crate::flow::{CurrentFlowState, FlowError, FlowState, FlowStateHandle, FlowStateUpdate, SyncMode};
use crate::storage::traits::RowMap;

/// Identity column of the controller flow table.
pub const CONTROLLER_ID_COLUMN: &str = "flowName";

/// Schema of the controller flow table: one row per managed flow.
#[must_use]
pub fn controller_flow_schema(table: &str) -> TableSchema {
    TableSchema::new(
        table,
        vec![
            FlowColumn::new(CONTROLLER_ID_COLUMN, ColumnType::Text).primary_key(),
            FlowColumn::new("state", ColumnType::Integer),
            FlowColumn::new("syncMode", ColumnType::Text),
            FlowColumn::new("syncFilter", ColumnType::Text),
            FlowColumn::new("flowAlias", ColumnType::Text),
            FlowColumn::new("lastModified", ColumnType::Timestamp),
        ],
    )
}

/// Read a controller flow row as `(target flow, state)`.
///
/// `None` when the row names no flow or carries no valid state.
#[must_use]
pub fn controller_row_state(row: &RowMap) -> Option<(String, CurrentFlowState)> {
    let text = |column: &str| match row.get(column) {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    };

    let target = text(CONTROLLER_ID_COLUMN);
    if target.is_empty() {
        return None;
    }
    let state = match row.get("state") {
        Some(Value::Number(n)) => n.as_i64().and_then(FlowState::from_code),
        Some(Value::String(s)) => FlowState::parse(s),
        _ => None,
    }?;

    Some((
        target,
        CurrentFlowState {
            state,
            sync_mode: SyncMode::from(text("syncMode")),
            sync_filter: text("syncFilter"),
            flow_alias: text("flowAlias"),
        },
    ))
}

/// Updates kept per flow; older ones are dropped.
pub const HISTORY_LIMIT: usize = 32;

/// Echoes flow state updates and delivers operator commands.
pub struct FlowStateController {
    senders: DashMap<String, mpsc::Sender<CurrentFlowState>>,
    history: Arc<DashMap<String, VecDeque<FlowStateUpdate>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl FlowStateController {
    #[must_use]
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            senders: DashMap::new(),
            history: Arc::new(DashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Take over the controller ends of `flow`'s state channels.
    pub fn attach(&self, flow: &str, handle: FlowStateHandle) {
        let FlowStateHandle {
            controller_tx,
            mut receiver_rx,
        } = handle;
        self.senders.insert(flow.to_string(), controller_tx.clone());

        let history = Arc::clone(&self.history);
        let shutdown = self.shutdown.clone();
        let name = flow.to_string();
        let task = tokio::spawn(async move {
            loop {
                let update = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    update = receiver_rx.recv() => match update {
                        Some(update) => update,
                        None => break,
                    },
                };

                debug!(flow = %name, state = %update.state, mode = %update.sync_mode, "Echoing state update");
                {
                    let mut recent = history.entry(name.clone()).or_default();
                    if recent.len() == HISTORY_LIMIT {
                        recent.pop_front();
                    }
                    recent.push_back(update.clone());
                }
                if controller_tx.send(update.into_current()).await.is_err() {
                    break;
                }
            }
            debug!(flow = %name, "State echo stopped");
        });
        self.tasks.lock().push(task);
    }

    /// Deliver `state` to `flow`.
    pub async fn set_state(&self, flow: &str, state: CurrentFlowState) -> Result<(), FlowError> {
        let sender = self
            .senders
            .get(flow)
            .map(|s| s.value().clone())
            .ok_or_else(|| FlowError::UnknownFlow(flow.to_string()))?;

        info!(flow = %flow, state = %state.state, mode = %state.sync_mode, "Setting flow state");
        sender
            .send(state)
            .await
            .map_err(|_| FlowError::ChannelClosed(flow.to_string()))
    }

    /// The last [`HISTORY_LIMIT`] updates `flow` has pushed, oldest first.
    #[must_use]
    pub fn updates(&self, flow: &str) -> Vec<FlowStateUpdate> {
        self.history
            .get(flow)
            .map(|h| h.value().iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn last_update(&self, flow: &str) -> Option<FlowStateUpdate> {
        self.history.get(flow).and_then(|h| h.value().back().cloned())
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl FlowMachineContext {
    /// Forward a drained controller flow row to the flow it names.
    pub(super) async fn apply_controller_change(&self, row: &RowMap) {
        let Some((target, state)) = controller_row_state(row) else {
            warn!(row = ?row, "Controller flow row without a flow name or state");
            return;
        };
        if let Err(e) = self.controller.set_state(&target, state).await {
            warn!(flow = %target, error = %e, "Controller flow could not reach flow");
        }
    }
}

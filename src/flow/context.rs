// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-table runtime state.
//!
//! A [`FlowContext`] owns everything one flow needs at run time: its
//! lifecycle state and sync mode (read and written only under the flow
//! lock), the cancel token of its current sync cycle, and the
//! [`RemoteDataSource`] with its two state channels:
//!
//! ```text
//!   controller ──CurrentFlowState──► flow     (commands in)
//!   flow ──────FlowStateUpdate─────► controller (requests / acks out)
//! ```

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::FlowError;
use super::state::{CurrentFlowState, FlowState, FlowStateUpdate, SyncMode};
use crate::cdc::change_table_name;
use crate::config::FlowEngineConfig;
use crate::definition::FlowDefinition;
use crate::storage::traits::RemoteSource;

/// Poll period while waiting for a state change.
const STATE_POLL: Duration = Duration::from_millis(20);

/// Static identity of a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowHeader {
    /// Table name
    pub name: String,
    /// Source project; also the vault index namespace
    pub source: String,
    /// Database the table lives in
    pub source_alias: String,
    pub template_path: String,
}

impl FlowHeader {
    #[must_use]
    pub fn new(name: impl Into<String>, source: impl Into<String>, source_alias: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            source_alias: source_alias.into(),
            template_path: String::new(),
        }
    }

    #[must_use]
    pub fn with_template_path(mut self, path: impl Into<String>) -> Self {
        self.template_path = path.into();
        self
    }

    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn change_table_name(&self) -> String {
        change_table_name(&self.name)
    }
}

/// The controller's ends of a flow's state channels.
pub struct FlowStateHandle {
    pub controller_tx: mpsc::Sender<CurrentFlowState>,
    pub receiver_rx: mpsc::Receiver<FlowStateUpdate>,
}

/// Remote connection settings plus the flow's state channels.
pub struct RemoteDataSource {
    connection: Option<Arc<dyn RemoteSource>>,
    ingest_interval: Duration,
    regions: Vec<String>,
    controller_rx: AsyncMutex<mpsc::Receiver<CurrentFlowState>>,
    receiver_tx: mpsc::Sender<FlowStateUpdate>,
}

impl RemoteDataSource {
    /// A zero `ingest_interval` disables pulling and pushing to the remote.
    #[must_use]
    pub fn new(
        connection: Option<Arc<dyn RemoteSource>>,
        ingest_interval: Duration,
        channel_capacity: usize,
    ) -> (Self, FlowStateHandle) {
        let capacity = channel_capacity.max(1);
        let (controller_tx, controller_rx) = mpsc::channel(capacity);
        let (receiver_tx, receiver_rx) = mpsc::channel(capacity);

        (
            Self {
                connection,
                ingest_interval,
                regions: Vec::new(),
                controller_rx: AsyncMutex::new(controller_rx),
                receiver_tx,
            },
            FlowStateHandle {
                controller_tx,
                receiver_rx,
            },
        )
    }

    #[must_use]
    pub fn with_config(
        connection: Option<Arc<dyn RemoteSource>>,
        config: &FlowEngineConfig,
    ) -> (Self, FlowStateHandle) {
        Self::new(connection, config.ingest_interval(), config.state_channel_capacity)
    }

    #[must_use]
    pub fn with_regions(mut self, regions: Vec<String>) -> Self {
        self.regions = regions;
        self
    }

    #[must_use]
    pub fn connection(&self) -> Option<&Arc<dyn RemoteSource>> {
        self.connection.as_ref()
    }

    #[must_use]
    pub fn ingest_interval(&self) -> Duration {
        self.ingest_interval
    }

    #[must_use]
    pub fn regions(&self) -> &[String] {
        &self.regions
    }

    /// Next state from the controller; `None` once the controller is gone.
    pub async fn recv_state(&self) -> Option<CurrentFlowState> {
        self.controller_rx.lock().await.recv().await
    }

    /// Hand an update to the controller.
    pub async fn send_update(&self, update: FlowStateUpdate) -> Result<(), FlowError> {
        let flow = update.flow_name.clone();
        self.receiver_tx
            .send(update)
            .await
            .map_err(|_| FlowError::ChannelClosed(flow))
    }
}

/// How a controller-delivered state was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateApply {
    /// Identical to the last applied state
    Unchanged,
    Applied,
    /// Not a legal transition; the update echoes the previous state back
    Rejected(FlowStateUpdate),
}

pub struct FlowContext {
    header: FlowHeader,
    definition: Arc<dyn FlowDefinition>,
    flow_lock: RwLock<CurrentFlowState>,
    previous: RwLock<CurrentFlowState>,
    remote: RemoteDataSource,
    cancel: Mutex<Option<CancellationToken>>,
    restart: AtomicBool,
    wants_init_notify: AtomicBool,
    read_only: AtomicBool,
    flow_changed: Notify,
}

impl FlowContext {
    #[must_use]
    pub fn new(header: FlowHeader, definition: Arc<dyn FlowDefinition>, remote: RemoteDataSource) -> Self {
        Self {
            header,
            definition,
            flow_lock: RwLock::new(CurrentFlowState::default()),
            previous: RwLock::new(CurrentFlowState::default()),
            remote,
            cancel: Mutex::new(None),
            restart: AtomicBool::new(false),
            wants_init_notify: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            flow_changed: Notify::new(),
        }
    }

    #[must_use]
    pub fn header(&self) -> &FlowHeader {
        &self.header
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.header.name
    }

    #[must_use]
    pub fn definition(&self) -> &Arc<dyn FlowDefinition> {
        &self.definition
    }

    #[must_use]
    pub fn remote(&self) -> &RemoteDataSource {
        &self.remote
    }

    // ═══════════════════════════════════════════════════════════════════════
    // State and mode, always under the flow lock
    // ═══════════════════════════════════════════════════════════════════════

    #[must_use]
    pub fn flow_state(&self) -> CurrentFlowState {
        self.flow_lock.read().clone()
    }

    pub fn set_flow_state(&self, state: CurrentFlowState) {
        crate::metrics::set_flow_state(self.name(), state.state.code());
        *self.flow_lock.write() = state;
    }

    #[must_use]
    pub fn state(&self) -> FlowState {
        self.flow_lock.read().state
    }

    pub fn set_state(&self, state: FlowState) {
        crate::metrics::set_flow_state(self.name(), state.code());
        self.flow_lock.write().state = state;
    }

    #[must_use]
    pub fn sync_mode(&self) -> SyncMode {
        self.flow_lock.read().sync_mode.clone()
    }

    pub fn set_sync_mode(&self, mode: SyncMode) {
        self.flow_lock.write().sync_mode = mode;
    }

    #[must_use]
    pub fn previous_flow_state(&self) -> CurrentFlowState {
        self.previous.read().clone()
    }

    pub fn set_previous_flow_state(&self, state: CurrentFlowState) {
        *self.previous.write() = state;
    }

    /// Match the current mode exactly, or by prefix when `starts_with`.
    /// An unset mode never matches.
    #[must_use]
    pub fn sync_mode_match(&self, mode: &str, starts_with: bool) -> bool {
        let guard = self.flow_lock.read();
        let current = guard.sync_mode.as_str();
        if current.is_empty() || mode.is_empty() {
            return false;
        }
        if starts_with {
            current.starts_with(mode)
        } else {
            current == mode
        }
    }

    #[must_use]
    pub fn sync_mode_match_any(&self, modes: &[&str]) -> bool {
        let guard = self.flow_lock.read();
        let current = guard.sync_mode.as_str();
        !current.is_empty() && modes.iter().any(|m| *m == current)
    }

    #[must_use]
    pub fn sync_filter_raw(&self) -> String {
        self.flow_lock.read().sync_filter.clone()
    }

    #[must_use]
    pub fn has_sync_filters(&self) -> bool {
        let guard = self.flow_lock.read();
        let filter = guard.sync_filter.trim();
        !(filter.is_empty() || filter == "n/a")
    }

    /// The allow-list with spaces stripped.
    #[must_use]
    pub fn sync_filters(&self) -> Vec<String> {
        let guard = self.flow_lock.read();
        if guard.sync_filter.is_empty() {
            return Vec::new();
        }
        guard
            .sync_filter
            .replace(' ', "")
            .split(',')
            .map(str::to_string)
            .collect()
    }

    /// Whether a row keyed by `key` passes the sync filter. No filter
    /// passes everything; otherwise a filter entry must equal or occur in
    /// the key.
    #[must_use]
    pub fn passes_sync_filter(&self, key: &str) -> bool {
        if !self.has_sync_filters() {
            return true;
        }
        self.sync_filters()
            .iter()
            .filter(|f| !f.is_empty())
            .any(|f| key == f || key.contains(f.as_str()))
    }

    /// Regions this flow syncs with. When `filtered`, a mode such as
    /// `pullus-east,eu` narrows the configured regions to those containing
    /// one of the listed suffixes.
    #[must_use]
    pub fn data_source_regions(&self, filtered: bool) -> Vec<String> {
        let regions = self.remote.regions();
        if !filtered {
            return regions.to_vec();
        }

        let mode = self.sync_mode();
        let mode = mode.as_str();
        let suffix = mode
            .strip_prefix("pull")
            .or_else(|| mode.strip_prefix("push"))
            .unwrap_or("");
        if suffix.is_empty() || suffix.starts_with("once") || suffix.starts_with("complete") || suffix.starts_with("error") {
            return regions.to_vec();
        }

        let wanted: Vec<&str> = suffix.split(',').filter(|s| !s.is_empty()).collect();
        regions
            .iter()
            .filter(|region| wanted.iter().any(|w| region.contains(w)))
            .cloned()
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // State channel plumbing
    // ═══════════════════════════════════════════════════════════════════════

    #[must_use]
    pub fn new_flow_state_update(&self, state: FlowState, sync_mode: SyncMode) -> FlowStateUpdate {
        let guard = self.flow_lock.read();
        FlowStateUpdate {
            flow_name: self.header.name.clone(),
            state,
            sync_mode,
            sync_filter: guard.sync_filter.clone(),
            flow_alias: guard.flow_alias.clone(),
        }
    }

    pub async fn push_state(&self, update: FlowStateUpdate) -> Result<(), FlowError> {
        debug!(flow = %self.name(), state = %update.state, mode = %update.sync_mode, "Pushing state update");
        self.remote.send_update(update).await
    }

    /// Validate and apply a state delivered by the controller.
    ///
    /// A state change must come from its expected predecessor
    /// (see [`FlowState::expected_previous`]). Mode, filter and alias may
    /// change freely within a state.
    pub fn apply_controller_state(&self, incoming: CurrentFlowState) -> StateApply {
        let previous = self.previous_flow_state();
        if previous == incoming {
            return StateApply::Unchanged;
        }

        if incoming.state != previous.state && incoming.state.expected_previous() != Some(previous.state) {
            warn!(
                flow = %self.name(),
                from = %previous.state,
                to = %incoming.state,
                "Rejected invalid state transition"
            );
            let mode = self.sync_mode();
            return StateApply::Rejected(self.new_flow_state_update(previous.state, mode));
        }

        self.set_previous_flow_state(incoming.clone());
        self.set_flow_state(incoming);
        StateApply::Applied
    }

    /// Apply the very first controller state without validation.
    pub fn apply_initial_state(&self, state: CurrentFlowState) {
        self.set_previous_flow_state(state.clone());
        self.set_flow_state(state);
    }

    /// Cycle the flow through Stopping and Offline back to Restarting.
    ///
    /// Waits at most `wait` for Offline; a flow the controller will not
    /// stop fails with [`FlowError::StateWait`].
    pub async fn notify_flow_component_needs_restart(&self, wait: Duration) -> Result<(), FlowError> {
        if self.state() == FlowState::Stopping {
            return Ok(());
        }
        self.push_state(self.new_flow_state_update(FlowState::Stopping, self.sync_mode()))
            .await?;

        let offline = async {
            while self.state() != FlowState::Offline {
                tokio::time::sleep(STATE_POLL).await;
            }
        };
        if tokio::time::timeout(wait, offline).await.is_err() {
            warn!(flow = %self.name(), state = %self.state(), "Flow did not stop for restart");
            return Err(FlowError::StateWait {
                flow: self.name().to_string(),
                state: FlowState::Offline,
            });
        }

        self.push_state(self.new_flow_state_update(FlowState::Restarting, self.sync_mode()))
            .await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync cycle lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Arm a fresh cancel token for a new sync cycle.
    pub fn begin_sync_cycle(&self, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        *self.cancel.lock() = Some(token.clone());
        token
    }

    /// Cancel the current sync cycle, if any. Returns whether one was running.
    pub fn cancel_the_context(&self) -> bool {
        match self.cancel.lock().take() {
            Some(token) => {
                info!(flow = %self.name(), "Cancelling sync cycle");
                token.cancel();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_restart(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }

    pub fn set_restart(&self, restart: bool) {
        self.restart.store(restart, Ordering::SeqCst);
    }

    #[must_use]
    pub fn wants_init_notify(&self) -> bool {
        self.wants_init_notify.load(Ordering::SeqCst)
    }

    pub fn set_wants_init_notify(&self, wants: bool) {
        self.wants_init_notify.store(wants, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Signal that the flow's change table has new entries.
    pub fn notify_changed(&self) {
        self.flow_changed.notify_one();
    }

    /// Resolves after the next [`Self::notify_changed`] (or a pending one).
    pub fn changed(&self) -> Notified<'_> {
        self.flow_changed.notified()
    }
}

impl std::fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowContext")
            .field("header", &self.header)
            .field("state", &self.flow_state())
            .finish_non_exhaustive()
    }
}

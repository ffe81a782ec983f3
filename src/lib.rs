// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Flow Sync
//!
//! Table flows between an embedded SQL engine, a secrets vault and external
//! SQL sources.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Flow State Controller                     │
//! │  • Owns each flow's state channel pair                     │
//! │  • Driven by rows of the controller table                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ (state / sync mode)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Flow Machine (per table)                   │
//! │  • Tick loop: Offline / Restarting / Running / Stopping    │
//! │  • Pull from and push to the external SQL source           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Embedded Query Engine (SQLite)              │
//! │  • One mirrored table per flow                             │
//! │  • <T>_Changes table filled by triggers (CDC)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ (drained change ids)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Vault                              │
//! │  • super-secrets/Index/<source>/<path>/<table>             │
//! │  • Data flow statistics under PublicIndex/                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`machine`]: The [`FlowMachineContext`] and the per-table state machine
//! - [`flow`]: Flow state, sync modes and the per-table [`FlowContext`]
//! - [`definition`]: The [`FlowDefinition`](definition::FlowDefinition) strategy
//! - [`engine`]: The embedded [`QueryEngine`]
//! - [`cdc`]: Change tables and triggers
//! - [`statistics`]: Data flow statistics trees
//! - [`storage`]: Vault and remote-source backends
//! - [`resilience`]: Retry and timeouts

pub mod cdc;
pub mod compare;
pub mod config;
pub mod definition;
pub mod engine;
pub mod flow;
pub mod machine;
pub mod metrics;
pub mod resilience;
pub mod statistics;
pub mod storage;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use cdc::{ChangeRecord, ChangeTable};
pub use config::FlowEngineConfig;
pub use definition::{FlowDefinition, GenericTableDefinition, TableSchema};
pub use engine::{QueryEngine, QueryResult};
pub use flow::{
    CurrentFlowState, FlowContext, FlowError, FlowHeader, FlowState, FlowStateUpdate,
    RemoteDataSource, SyncMode,
};
pub use machine::{
    vault_secret_path, DbQuery, FlowMachineContext, FlowStateController, PersistSummary,
    TickOutcome,
};
pub use metrics::LatencyTimer;
pub use resilience::retry::RetryConfig;
pub use statistics::{DataFlowTree, StatisticError, TTDINode};
pub use storage::memory::{InMemoryRemote, InMemoryVault};
pub use storage::sql::SqlRemoteSource;
pub use storage::traits::{RemoteSource, RowMap, StorageError, VaultKv};

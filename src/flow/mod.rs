// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Flow identity, lifecycle state and per-flow runtime context.

pub mod context;
pub mod error;
pub mod state;

pub use context::{FlowContext, FlowHeader, FlowStateHandle, RemoteDataSource, StateApply};
pub use error::FlowError;
pub use state::{CurrentFlowState, FlowState, FlowStateUpdate, SyncMode};

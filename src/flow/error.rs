// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use thiserror::Error;

use super::state::FlowState;
use crate::storage::traits::StorageError;

/// Errors raised while running a flow.
///
/// Only [`FlowError::Bootstrap`] from machine construction is fatal to the
/// process; everything else is logged and retried on a later tick, or is
/// fatal to a single flow's startup.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Index path derivation failed: {0}")]
    IndexPath(String),
    #[error("Schema error: {0}")]
    Schema(String),
    #[error("Unknown flow: {0}")]
    UnknownFlow(String),
    #[error("State channel closed for flow {0}")]
    ChannelClosed(String),
    #[error("Flow {flow} did not reach state {state} in time")]
    StateWait { flow: String, state: FlowState },
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dataflow statistics tree.
//!
//! Every synchronization cycle records its state transitions as children
//! of a root node. When the cycle is done the children are flattened to
//! statistic maps and delivered to a SQL statistics table, the vault, or
//! both.
//!
//! ```text
//! root "Jobs" (Root { time_start, log_immediately })
//!  ├── Statistic { flowGroup, flowName, stateName "Loading", stateCode "1", timeSplit }
//!  └── Statistic { ..., stateName "Load complete", stateCode "2", timeSplit }
//! ```
//!
//! Nodes live in an arena ([`DataFlowTree`]) and refer to their children by
//! index. Payloads are typed ([`NodeKind`]); they are only turned into
//! string maps at the persistence boundary.
//!
//! # Example
//!
//! ```
//! use flow_sync::statistics::DataFlowTree;
//!
//! let mut tree = DataFlowTree::init_data_flow(None, "Jobs", false);
//! tree.update_data_flow_statistic("Flows", "Jobs", "Loading", "1", 1, None);
//! tree.update_data_flow_statistic("Flows", "Jobs", "Load complete", "2", 1, None);
//! assert_eq!(tree.statistics().len(), 2);
//! ```

mod deliver;
mod duration;
mod node;

pub use deliver::{
    init_argosy_fleet, retrieve_statistic, statistic_vault_path, DeliverySummary, StatisticSink,
};
pub use duration::{format_duration, format_time_split, parse_duration, SPLIT_RESOLUTION};
pub use node::{
    DataFlowTree, ElementState, NodeId, NodeKind, RootPayload, StatisticPayload, TTDINode,
};

use std::sync::Arc;
use thiserror::Error;

use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum StatisticError {
    #[error("Malformed statistic: {0}")]
    Decode(String),
    #[error("{0}")]
    Failure(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Callback receiving `"<flowName>-<stateName>"` lines, with an error for
/// failure states.
pub type LogFn = Arc<dyn Fn(&str, Option<&StatisticError>) + Send + Sync>;

/// [`LogFn`] that forwards into `tracing`.
#[must_use]
pub fn tracing_log_fn() -> LogFn {
    Arc::new(|msg: &str, err: Option<&StatisticError>| match err {
        Some(e) => tracing::error!(statistic = %msg, error = %e, "Dataflow statistic"),
        None => tracing::info!(statistic = %msg, "Dataflow statistic"),
    })
}

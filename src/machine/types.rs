// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the flow machine.

use crate::cdc::ChangeRecord;
use crate::definition::SqlStatement;
use crate::storage::traits::RowMap;

/// A statement to run against the engine on behalf of a flow.
#[derive(Debug, Clone, PartialEq)]
pub struct DbQuery {
    pub sql: String,
    pub bindings: RowMap,
    /// Change record written explicitly when the statement changes rows
    pub change_id: Option<ChangeRecord>,
}

impl DbQuery {
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            bindings: RowMap::new(),
            change_id: None,
        }
    }

    #[must_use]
    pub fn with_bindings(mut self, bindings: RowMap) -> Self {
        self.bindings = bindings;
        self
    }

    #[must_use]
    pub fn with_change_id(mut self, change_id: ChangeRecord) -> Self {
        self.change_id = Some(change_id);
        self
    }
}

impl From<SqlStatement> for DbQuery {
    fn from(statement: SqlStatement) -> Self {
        Self::new(statement.sql).with_bindings(statement.bindings)
    }
}

/// What one tick of a flow's state machine did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Stopping: cycle cancelled, Offline requested
    Stopped,
    Offline,
    /// Schema setup failed; the flow never runs
    Failed,
    /// Restarting: table truncated, Running requested
    Restarted,
    /// Running without a sync mode
    Idle,
    /// Running in push mode; changes leave through the vault cycle
    Watching,
    Pulled { inserted: usize, updated: usize },
    PullFailed,
    Pushed { pushed: usize },
    PushFailed,
    /// `pushonce` over an empty table
    NothingToPush,
}

impl TickOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Offline => "offline",
            Self::Failed => "failed",
            Self::Restarted => "restarted",
            Self::Idle => "idle",
            Self::Watching => "watching",
            Self::Pulled { .. } => "pulled",
            Self::PullFailed => "pull_failed",
            Self::Pushed { .. } => "pushed",
            Self::PushFailed => "push_failed",
            Self::NothingToPush => "nothing_to_push",
        }
    }
}

impl std::fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one drain of a flow's change table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistSummary {
    pub drained: usize,
    pub written: usize,
    pub deleted: usize,
    pub pushed: usize,
    pub reinjected: usize,
    /// Rows with no vault home, or skipped because the flow is read-only
    pub skipped: usize,
}

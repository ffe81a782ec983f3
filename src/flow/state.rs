// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Flow lifecycle states, sync modes and the messages that carry them.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one flow.
///
/// ```text
///            ┌──────────── 3 Stopping ◄──────────┐
///            ▼                                   │
///        0 Offline ──► 1 Restarting ──► 2 Running
/// ```
///
/// `Failed` is terminal for the flow: its schema could not be set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowState {
    Failed,
    Offline,
    Restarting,
    Running,
    Stopping,
}

impl FlowState {
    pub const ALL: [FlowState; 5] = [
        FlowState::Failed,
        FlowState::Offline,
        FlowState::Restarting,
        FlowState::Running,
        FlowState::Stopping,
    ];

    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            FlowState::Failed => -1,
            FlowState::Offline => 0,
            FlowState::Restarting => 1,
            FlowState::Running => 2,
            FlowState::Stopping => 3,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(FlowState::Failed),
            0 => Some(FlowState::Offline),
            1 => Some(FlowState::Restarting),
            2 => Some(FlowState::Running),
            3 => Some(FlowState::Stopping),
            _ => None,
        }
    }

    /// Parse the string form carried on state channels (`"0"`..`"3"`).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        s.trim().parse::<i64>().ok().and_then(Self::from_code)
    }

    /// The only state a controller may move a flow into this one from.
    #[must_use]
    pub fn expected_previous(&self) -> Option<FlowState> {
        match self {
            FlowState::Offline => Some(FlowState::Stopping),
            FlowState::Restarting => Some(FlowState::Offline),
            FlowState::Running => Some(FlowState::Restarting),
            FlowState::Stopping => Some(FlowState::Running),
            FlowState::Failed => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Failed => "failed",
            FlowState::Offline => "offline",
            FlowState::Restarting => "restarting",
            FlowState::Running => "running",
            FlowState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Direction and cardinality of synchronization.
///
/// Unknown strings are kept verbatim in `Other`; region-qualified modes
/// such as `pullus-east` land there too and are handled by prefix matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum SyncMode {
    Pull,
    Push,
    PullOnce,
    PushOnce,
    PullComplete,
    PushComplete,
    PullError,
    PushError,
    PullSyncComplete,
    #[default]
    NoSync,
    Other(String),
}

impl SyncMode {
    pub const KNOWN: [SyncMode; 10] = [
        SyncMode::Pull,
        SyncMode::Push,
        SyncMode::PullOnce,
        SyncMode::PushOnce,
        SyncMode::PullComplete,
        SyncMode::PushComplete,
        SyncMode::PullError,
        SyncMode::PushError,
        SyncMode::PullSyncComplete,
        SyncMode::NoSync,
    ];

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            SyncMode::Pull => "pull",
            SyncMode::Push => "push",
            SyncMode::PullOnce => "pullonce",
            SyncMode::PushOnce => "pushonce",
            SyncMode::PullComplete => "pullcomplete",
            SyncMode::PushComplete => "pushcomplete",
            SyncMode::PullError => "pullerror",
            SyncMode::PushError => "pusherror",
            SyncMode::PullSyncComplete => "pullsynccomplete",
            SyncMode::NoSync => "nosync",
            SyncMode::Other(s) => s,
        }
    }

    /// Whether rows flow out to the remote on change.
    #[must_use]
    pub fn is_push(&self) -> bool {
        matches!(self, SyncMode::Push | SyncMode::PushOnce)
    }

    #[must_use]
    pub fn is_pull(&self) -> bool {
        matches!(self, SyncMode::Pull | SyncMode::PullOnce)
    }

    /// Numeric mode recorded in statistics (1 pull side, 2 push side, 0 other).
    #[must_use]
    pub fn statistic_code(&self) -> i64 {
        let s = self.as_str();
        if s.starts_with("pull") {
            1
        } else if s.starts_with("push") {
            2
        } else {
            0
        }
    }
}

impl From<&str> for SyncMode {
    fn from(s: &str) -> Self {
        match s {
            "pull" => SyncMode::Pull,
            "push" => SyncMode::Push,
            "pullonce" => SyncMode::PullOnce,
            "pushonce" => SyncMode::PushOnce,
            "pullcomplete" => SyncMode::PullComplete,
            "pushcomplete" => SyncMode::PushComplete,
            "pullerror" => SyncMode::PullError,
            "pusherror" => SyncMode::PushError,
            "pullsynccomplete" => SyncMode::PullSyncComplete,
            "nosync" | "" => SyncMode::NoSync,
            other => SyncMode::Other(other.to_string()),
        }
    }
}

impl From<String> for SyncMode {
    fn from(s: String) -> Self {
        SyncMode::from(s.as_str())
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State delivered into a flow by its controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentFlowState {
    pub state: FlowState,
    pub sync_mode: SyncMode,
    pub sync_filter: String,
    pub flow_alias: String,
}

impl Default for CurrentFlowState {
    fn default() -> Self {
        Self {
            state: FlowState::Offline,
            sync_mode: SyncMode::NoSync,
            sync_filter: String::new(),
            flow_alias: String::new(),
        }
    }
}

/// State change requested or acknowledged by a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowStateUpdate {
    pub flow_name: String,
    pub state: FlowState,
    pub sync_mode: SyncMode,
    pub sync_filter: String,
    pub flow_alias: String,
}

impl FlowStateUpdate {
    #[must_use]
    pub fn into_current(self) -> CurrentFlowState {
        CurrentFlowState {
            state: self.state,
            sync_mode: self.sync_mode,
            sync_filter: self.sync_filter,
            flow_alias: self.flow_alias,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_round_trip_strings() {
        for state in FlowState::ALL {
            assert_eq!(FlowState::parse(&state.to_string()), Some(state));
        }
        assert_eq!(FlowState::parse("7"), None);
        assert_eq!(FlowState::parse("x"), None);
    }

    #[test]
    fn test_expected_previous_forms_cycle() {
        assert_eq!(FlowState::Offline.expected_previous(), Some(FlowState::Stopping));
        assert_eq!(FlowState::Restarting.expected_previous(), Some(FlowState::Offline));
        assert_eq!(FlowState::Running.expected_previous(), Some(FlowState::Restarting));
        assert_eq!(FlowState::Stopping.expected_previous(), Some(FlowState::Running));
        assert_eq!(FlowState::Failed.expected_previous(), None);
    }

    #[test]
    fn test_sync_mode_strings() {
        for mode in SyncMode::KNOWN {
            assert_eq!(SyncMode::from(mode.as_str()), mode);
        }
        assert_eq!(SyncMode::from(""), SyncMode::NoSync);
        assert_eq!(SyncMode::from("pullus-east"), SyncMode::Other("pullus-east".into()));
    }

    #[test]
    fn test_sync_mode_classification() {
        assert!(SyncMode::PushOnce.is_push());
        assert!(!SyncMode::PushComplete.is_push());
        assert!(SyncMode::Pull.is_pull());
        assert_eq!(SyncMode::PullError.statistic_code(), 1);
        assert_eq!(SyncMode::PushComplete.statistic_code(), 2);
        assert_eq!(SyncMode::NoSync.statistic_code(), 0);
    }
}

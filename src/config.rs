//! Configuration for the flow machine.
//!
//! # Example
//!
//! ```
//! use flow_sync::FlowEngineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = FlowEngineConfig::default();
//! assert_eq!(config.state_wait_secs, 15);
//!
//! // Tighter vault bound, deletes only propagated for one table
//! let config = FlowEngineConfig {
//!     vault_timeout_ms: 5_000,
//!     synced_tables: vec!["Jobs".into()],
//!     ..Default::default()
//! };
//! assert!(config.propagates_deletes("Jobs"));
//! assert!(!config.propagates_deletes("Other"));
//! ```

use serde::Deserialize;
use std::time::Duration;

/// Configuration for a [`crate::FlowMachineContext`].
///
/// All fields have defaults. Zero timeouts disable the bound.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowEngineConfig {
    /// Name of the embedded database (flows' source alias)
    #[serde(default = "default_database_name")]
    pub database_name: String,

    /// Table that statistics are upserted into
    #[serde(default = "default_statistics_table")]
    pub statistics_table: String,

    /// Flow whose rows drive other flows' state
    #[serde(default = "default_controller_flow_name")]
    pub controller_flow_name: String,

    /// Default pull interval for remote data sources (0 = no pulling)
    #[serde(default = "default_ingest_interval_ms")]
    pub ingest_interval_ms: u64,

    /// How long a new table waits for its first controller state
    #[serde(default = "default_state_wait_secs")]
    pub state_wait_secs: u64,

    /// Per-call bound on vault reads, writes and lists
    #[serde(default = "default_vault_timeout_ms")]
    pub vault_timeout_ms: u64,

    /// Per-call bound on remote pulls and upserts
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,

    /// Capacity of each flow's state channels
    #[serde(default = "default_state_channel_capacity")]
    pub state_channel_capacity: usize,

    /// Tables whose deletes are pushed to the remote (empty = all)
    #[serde(default)]
    pub synced_tables: Vec<String>,

    /// Start-up load statistics: id, index path and id name
    #[serde(default = "default_stats_id")]
    pub stats_id: String,
    #[serde(default = "default_stats_index_path")]
    pub stats_index_path: String,
    #[serde(default = "default_stats_id_name")]
    pub stats_id_name: String,
}

fn default_database_name() -> String { "TrcDb".into() }
fn default_statistics_table() -> String { "DataFlowStatistics".into() }
fn default_controller_flow_name() -> String { "TierceronFlow".into() }
fn default_ingest_interval_ms() -> u64 { 60_000 }
fn default_state_wait_secs() -> u64 { 15 }
fn default_vault_timeout_ms() -> u64 { 30_000 }
fn default_remote_timeout_ms() -> u64 { 60_000 }
fn default_state_channel_capacity() -> usize { 32 }
fn default_stats_id() -> String { "flume".into() }
fn default_stats_index_path() -> String { "TrcVault".into() }
fn default_stats_id_name() -> String { "tenantId".into() }

impl Default for FlowEngineConfig {
    fn default() -> Self {
        Self {
            database_name: default_database_name(),
            statistics_table: default_statistics_table(),
            controller_flow_name: default_controller_flow_name(),
            ingest_interval_ms: default_ingest_interval_ms(),
            state_wait_secs: default_state_wait_secs(),
            vault_timeout_ms: default_vault_timeout_ms(),
            remote_timeout_ms: default_remote_timeout_ms(),
            state_channel_capacity: default_state_channel_capacity(),
            synced_tables: Vec::new(),
            stats_id: default_stats_id(),
            stats_index_path: default_stats_index_path(),
            stats_id_name: default_stats_id_name(),
        }
    }
}

impl FlowEngineConfig {
    #[must_use]
    pub fn vault_timeout(&self) -> Duration {
        Duration::from_millis(self.vault_timeout_ms)
    }

    #[must_use]
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    #[must_use]
    pub fn state_wait(&self) -> Duration {
        Duration::from_secs(self.state_wait_secs)
    }

    #[must_use]
    pub fn ingest_interval(&self) -> Duration {
        Duration::from_millis(self.ingest_interval_ms)
    }

    /// Whether deletes on `table` are pushed to its remote source
    #[must_use]
    pub fn propagates_deletes(&self, table: &str) -> bool {
        self.synced_tables.is_empty() || self.synced_tables.iter().any(|t| t == table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_partial_uses_defaults() {
        let config: FlowEngineConfig =
            serde_json::from_str(r#"{"database_name": "Flume", "vault_timeout_ms": 0}"#).unwrap();
        assert_eq!(config.database_name, "Flume");
        assert!(config.vault_timeout().is_zero());
        assert_eq!(config.remote_timeout(), Duration::from_secs(60));
        assert_eq!(config.statistics_table, "DataFlowStatistics");
        assert!(config.propagates_deletes("anything"));
    }
}

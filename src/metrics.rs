// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the flow machine.
//!
//! Uses the `metrics` crate for backend-agnostic collection. The host
//! process chooses the exporter.
//!
//! # Metric Naming Convention
//! - `flow_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `table`: the flow's table name
//! - `operation`: select, insert, update, delete, ddl
//! - `status`: success, error, timeout

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record an embedded-engine statement
pub fn record_query(operation: &str, status: &str) {
    counter!(
        "flow_sync_queries_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record embedded-engine statement latency (lock wait included)
pub fn record_query_latency(operation: &str, duration: Duration) {
    histogram!(
        "flow_sync_query_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record change records drained from a change table
pub fn record_changes_drained(table: &str, count: usize) {
    counter!(
        "flow_sync_changes_drained_total",
        "table" => table.to_string()
    )
    .increment(count as u64);
}

/// Record a change id put back for retry
pub fn record_change_reinjected(table: &str) {
    counter!(
        "flow_sync_changes_reinjected_total",
        "table" => table.to_string()
    )
    .increment(1);
}

pub fn record_vault_write(table: &str, status: &str) {
    counter!(
        "flow_sync_vault_writes_total",
        "table" => table.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_remote_push(table: &str, status: &str) {
    counter!(
        "flow_sync_remote_pushes_total",
        "table" => table.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record the outcome of one pull-and-merge pass
pub fn record_pull_merge(table: &str, inserted: usize, updated: usize) {
    counter!("flow_sync_pull_inserted_total", "table" => table.to_string()).increment(inserted as u64);
    counter!("flow_sync_pull_updated_total", "table" => table.to_string()).increment(updated as u64);
}

pub fn record_pull_error(table: &str) {
    counter!("flow_sync_pull_errors_total", "table" => table.to_string()).increment(1);
}

/// Record a call cut off by its timeout
pub fn record_timeout(operation: &str) {
    counter!(
        "flow_sync_timeouts_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Set a flow's state code (-1 failed, 0 offline .. 3 stopping)
pub fn set_flow_state(table: &str, code: i64) {
    gauge!("flow_sync_flow_state", "table" => table.to_string()).set(code as f64);
}

/// Record one tick of a flow's state machine
pub fn record_tick(table: &str, outcome: &str) {
    counter!(
        "flow_sync_ticks_total",
        "table" => table.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record statistics persisted, by target (vault or sql)
pub fn record_statistics_delivered(target: &str, count: usize) {
    counter!(
        "flow_sync_statistics_delivered_total",
        "target" => target.to_string()
    )
    .increment(count as u64);
}

/// Rows loaded into a table from the vault at cycle start
pub fn record_seeded_rows(table: &str, count: usize) {
    counter!("flow_sync_seeded_rows_total", "table" => table.to_string()).increment(count as u64);
}

/// Timer guard that records query latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    #[must_use]
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_query_latency(self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These only verify the calls are well-formed with no recorder installed.

    #[test]
    fn test_query_metrics() {
        record_query("select", "success");
        record_query("insert", "error");
        record_query_latency("select", Duration::from_micros(40));
    }

    #[test]
    fn test_flow_metrics() {
        record_changes_drained("Jobs", 3);
        record_change_reinjected("Jobs");
        record_vault_write("Jobs", "success");
        record_remote_push("Jobs", "error");
        record_pull_merge("Jobs", 1, 1);
        record_pull_error("Jobs");
        set_flow_state("Jobs", 2);
        record_tick("Jobs", "offline");
        record_seeded_rows("Jobs", 10);
        record_statistics_delivered("vault", 2);
        record_timeout("vault_write");
    }

    #[test]
    fn test_pull_merge_counts_are_recorded() {
        use metrics_util::debugging::{DebugValue, DebuggingRecorder};

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, || record_pull_merge("Jobs", 2, 1));

        let mut counters: Vec<(String, u64)> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter_map(|(key, _, _, value)| match value {
                DebugValue::Counter(v) => Some((key.key().name().to_string(), v)),
                _ => None,
            })
            .collect();
        counters.sort();
        assert_eq!(
            counters,
            vec![
                ("flow_sync_pull_inserted_total".to_string(), 2),
                ("flow_sync_pull_updated_total".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("select");
            std::thread::sleep(Duration::from_micros(10));
        }
    }
}

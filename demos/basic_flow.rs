// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic flow-sync usage example.
//!
//! Demonstrates:
//! 1. Building a flow machine over an in-memory vault
//! 2. Pulling a remote table once into the embedded engine
//! 3. Local writes reaching the vault through the change table
//! 4. Displaying metrics
//! 5. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_flow
//! ```

use std::sync::Arc;
use std::time::Duration;

use flow_sync::definition::{ColumnType, FlowColumn};
use flow_sync::{
    CurrentFlowState, DbQuery, FlowEngineConfig, FlowHeader, FlowMachineContext, FlowState,
    GenericTableDefinition, InMemoryRemote, InMemoryVault, RemoteSource, SyncMode, TableSchema,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install()?;

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Machine, remote and flow
    // ─────────────────────────────────────────────────────────────────────────
    let config = FlowEngineConfig {
        ingest_interval_ms: 200,
        ..Default::default()
    };
    let vault = Arc::new(InMemoryVault::new());
    let machine = Arc::new(FlowMachineContext::new(config, vault.clone()).await?);

    let remote = Arc::new(InMemoryRemote::new("id"));
    for (id, val) in [("alpha", "1"), ("beta", "2"), ("gamma", "3")] {
        remote.set_row(json!({"id": id, "val": val}).as_object().cloned().unwrap_or_default());
    }

    let schema = TableSchema::new(
        "Jobs",
        vec![
            FlowColumn::new("id", ColumnType::Text).primary_key(),
            FlowColumn::new("val", ColumnType::Text),
        ],
    );
    let connection: Arc<dyn RemoteSource> = remote.clone();
    let jobs = machine.register_flow(
        FlowHeader::new("Jobs", "Flows", "TrcDb"),
        Arc::new(GenericTableDefinition::new(schema, "id")),
        Some(connection),
    );
    machine
        .controller()
        .set_state(
            "Jobs",
            CurrentFlowState {
                state: FlowState::Running,
                sync_mode: SyncMode::PullOnce,
                ..Default::default()
            },
        )
        .await?;

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Pull once
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🚀 Starting flow Jobs (pullonce)...");
    let task = machine.start_flow(Arc::clone(&jobs));
    while jobs.sync_mode() != SyncMode::PullComplete {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let rows = machine.engine().query("SELECT id, val FROM Jobs ORDER BY id").await?;
    println!("   ✅ Pulled {} rows, mode now {}", rows.rows.len(), jobs.sync_mode());

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Local write
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Updating beta locally...");
    machine
        .call_db_query(
            &jobs,
            DbQuery::new("UPDATE Jobs SET val = '20' WHERE id = 'beta'"),
            &["Jobs"],
        )
        .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut paths = vault.paths();
    paths.sort();
    println!("   Vault now holds {} secrets:", paths.len());
    for path in &paths {
        println!("   └─ {}", path);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Metrics");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Shutdown
    // ─────────────────────────────────────────────────────────────────────────
    machine.shutdown();
    task.await??;
    println!("\n👋 Flow machine stopped");
    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let value = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
            };
            format!("{}{{{}}} = {}", key.name(), labels.join(","), value)
        })
        .collect();
    lines.sort();
    for line in lines {
        println!("   └─ {}", line);
    }
}

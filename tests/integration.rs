//! Integration tests for flow sync.
//!
//! Every test runs against the embedded SQLite engine with in-memory vault
//! and remote backends, so nothing external is required.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//!
//! # Only the state machine scenarios
//! cargo test --test integration machine
//! ```
//!
//! # Test Organization
//! - `cdc_*` - Change capture and the vault persist path
//! - `machine_*` - Tick behavior per state and sync mode
//! - `statistics_*` - Dataflow statistics delivery
//! - `controller_*` - Controller-driven flows end to end

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use flow_sync::definition::{ColumnType, FlowColumn};
use flow_sync::machine::controller_flow_schema;
use flow_sync::statistics::{retrieve_statistic, StatisticSink};
use flow_sync::{
    CurrentFlowState, DataFlowTree, DbQuery, FlowContext, FlowEngineConfig, FlowHeader,
    FlowMachineContext, FlowState, GenericTableDefinition, InMemoryRemote, InMemoryVault,
    RemoteDataSource, RemoteSource, RowMap, SyncMode, TableSchema, TickOutcome,
};

// =============================================================================
// Helpers
// =============================================================================

fn row(value: Value) -> RowMap {
    value.as_object().cloned().unwrap_or_default()
}

fn jobs_definition() -> Arc<GenericTableDefinition> {
    Arc::new(GenericTableDefinition::new(
        TableSchema::new(
            "Jobs",
            vec![
                FlowColumn::new("id", ColumnType::Text).primary_key(),
                FlowColumn::new("val", ColumnType::Text),
            ],
        ),
        "id",
    ))
}

fn test_config() -> FlowEngineConfig {
    FlowEngineConfig {
        ingest_interval_ms: 20,
        state_wait_secs: 1,
        vault_timeout_ms: 1_000,
        remote_timeout_ms: 1_000,
        ..Default::default()
    }
}

async fn machine(vault: Arc<InMemoryVault>) -> Arc<FlowMachineContext> {
    Arc::new(FlowMachineContext::new(test_config(), vault).await.unwrap())
}

/// Register `Jobs` with the given controller state, then build its table.
async fn jobs_flow(
    machine: &FlowMachineContext,
    connection: Option<Arc<dyn RemoteSource>>,
    state: CurrentFlowState,
) -> Arc<FlowContext> {
    let (remote, handle) = RemoteDataSource::new(connection, Duration::from_millis(20), 8);
    let flow = Arc::new(FlowContext::new(
        FlowHeader::new("Jobs", "Flows", "TrcDb"),
        jobs_definition(),
        remote,
    ));
    let flow = machine.register_flow_context(flow, handle);
    machine.controller().set_state("Jobs", state).await.unwrap();
    machine.add_table_schema(&flow).await.unwrap();
    machine.create_table_triggers(&flow).await.unwrap();
    flow
}

fn flow_state(state: FlowState, mode: SyncMode) -> CurrentFlowState {
    CurrentFlowState {
        state,
        sync_mode: mode,
        ..Default::default()
    }
}

async fn wait_for<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// =============================================================================
// Change Capture
// =============================================================================

#[tokio::test]
async fn cdc_every_write_leaves_one_change_per_key() {
    let vault = Arc::new(InMemoryVault::new());
    let machine = machine(vault).await;
    let flow = jobs_flow(&machine, None, flow_state(FlowState::Offline, SyncMode::NoSync)).await;

    for sql in [
        "INSERT INTO Jobs VALUES ('a', '1')",
        "UPDATE Jobs SET val = '2' WHERE id = 'a'",
        "INSERT INTO Jobs VALUES ('b', '1')",
        "DELETE FROM Jobs WHERE id = 'b'",
        "INSERT INTO Jobs VALUES ('c', '1')",
    ] {
        machine.engine().query(sql).await.unwrap();
    }

    let drained = machine.remove_changed_table_entries(&flow).await.unwrap();
    let keys: BTreeSet<String> = drained.iter().map(ToString::to_string).collect();
    assert_eq!(keys, ["a", "b", "c"].iter().map(ToString::to_string).collect());

    // Drained records are gone
    assert!(machine.remove_changed_table_entries(&flow).await.unwrap().is_empty());
}

#[tokio::test]
async fn cdc_failed_vault_write_is_retried_next_drain() {
    let vault = Arc::new(InMemoryVault::new());
    let machine = machine(vault.clone()).await;
    let flow = jobs_flow(&machine, None, flow_state(FlowState::Running, SyncMode::NoSync)).await;

    machine.engine().query("INSERT INTO Jobs VALUES ('a', '1')").await.unwrap();
    machine.engine().query("INSERT INTO Jobs VALUES ('b', '1')").await.unwrap();
    vault.fail_next_writes(1);

    let first = machine.vault_persist_push_remote_changes(&flow).await.unwrap();
    assert_eq!(first.drained, 2);
    assert_eq!(first.written, 1);
    assert_eq!(first.reinjected, 1);

    let second = machine.vault_persist_push_remote_changes(&flow).await.unwrap();
    assert_eq!(second.drained, 1);
    assert_eq!(second.written, 1);

    let stored: BTreeSet<String> = vault.paths().into_iter().collect();
    assert!(stored.contains("super-secrets/Index/Flows/id/a/Jobs"));
    assert!(stored.contains("super-secrets/Index/Flows/id/b/Jobs"));
}

#[tokio::test]
async fn cdc_delete_reaches_remote_as_marker() {
    let vault = Arc::new(InMemoryVault::new());
    let remote = Arc::new(InMemoryRemote::new("id"));
    let machine = machine(vault.clone()).await;
    let connection: Arc<dyn RemoteSource> = remote.clone();
    let flow = jobs_flow(&machine, Some(connection), flow_state(FlowState::Running, SyncMode::Push)).await;

    machine.engine().query("INSERT INTO Jobs VALUES ('a', '1')").await.unwrap();
    machine.vault_persist_push_remote_changes(&flow).await.unwrap();
    assert!(remote.row("a").is_some());

    machine.engine().query("DELETE FROM Jobs WHERE id = 'a'").await.unwrap();
    let summary = machine.vault_persist_push_remote_changes(&flow).await.unwrap();
    assert_eq!(summary.deleted, 1);
    assert!(remote.row("a").is_none());
    assert!(vault.is_deleted("super-secrets/Index/Flows/id/a/Jobs"));
}

#[tokio::test]
async fn cdc_push_failures_in_one_drain_report_once() {
    let remote = Arc::new(InMemoryRemote::new("id"));
    let machine = machine(Arc::new(InMemoryVault::new())).await;
    let connection: Arc<dyn RemoteSource> = remote.clone();
    let flow = jobs_flow(&machine, Some(connection), flow_state(FlowState::Running, SyncMode::Push)).await;
    for id in ["a", "b", "c"] {
        machine
            .engine()
            .query(&format!("INSERT INTO Jobs VALUES ('{}', '1')", id))
            .await
            .unwrap();
    }
    remote.fail_next_upserts(3);

    let summary = machine.vault_persist_push_remote_changes(&flow).await.unwrap();
    assert_eq!(summary.drained, 3);
    assert_eq!(summary.written, 3);
    assert_eq!(summary.pushed, 0);
    assert_eq!(flow.sync_mode(), SyncMode::PushError);

    let controller = machine.controller();
    wait_for(|| controller.last_update("Jobs").is_some()).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    let updates = controller.updates("Jobs");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].sync_mode, SyncMode::PushError);
}

// =============================================================================
// State Machine
// =============================================================================

#[tokio::test]
async fn machine_pullonce_inserts_and_updates_differing_rows() {
    let remote = Arc::new(InMemoryRemote::new("id"));
    remote.set_row(row(json!({"id": "a", "val": "new"})));
    remote.set_row(row(json!({"id": "b", "val": "x"})));
    let machine = machine(Arc::new(InMemoryVault::new())).await;
    let connection: Arc<dyn RemoteSource> = remote.clone();
    let flow = jobs_flow(&machine, Some(connection), flow_state(FlowState::Running, SyncMode::PullOnce)).await;
    machine.engine().query("INSERT INTO Jobs VALUES ('a', 'old')").await.unwrap();

    let mut sync_init = false;
    assert_eq!(
        machine.tick(&flow, &mut sync_init).await,
        TickOutcome::Pulled { inserted: 1, updated: 1 }
    );
    assert_eq!(flow.sync_mode(), SyncMode::PullComplete);

    let rows = machine.engine().query("SELECT id, val FROM Jobs ORDER BY id").await.unwrap();
    assert_eq!(
        rows.rows,
        vec![vec![json!("a"), json!("new")], vec![json!("b"), json!("x")]]
    );

    let controller = machine.controller();
    wait_for(|| controller.last_update("Jobs").is_some()).await;
    let update = controller.last_update("Jobs").unwrap();
    assert_eq!(update.sync_mode, SyncMode::PullComplete);

    // Nothing left to pull once complete
    assert_eq!(machine.tick(&flow, &mut sync_init).await, TickOutcome::Idle);
}

#[tokio::test]
async fn machine_pushonce_respects_sync_filter() {
    let remote = Arc::new(InMemoryRemote::new("id"));
    let machine = machine(Arc::new(InMemoryVault::new())).await;
    let connection: Arc<dyn RemoteSource> = remote.clone();
    let state = CurrentFlowState {
        sync_filter: "a".into(),
        ..flow_state(FlowState::Running, SyncMode::PushOnce)
    };
    let flow = jobs_flow(&machine, Some(connection), state).await;
    machine.engine().query("INSERT INTO Jobs VALUES ('a', '1')").await.unwrap();
    machine.engine().query("INSERT INTO Jobs VALUES ('b', '2')").await.unwrap();

    let mut sync_init = false;
    assert_eq!(machine.tick(&flow, &mut sync_init).await, TickOutcome::Pushed { pushed: 1 });
    assert_eq!(flow.sync_mode(), SyncMode::PushComplete);

    let pushed: Vec<Value> = remote
        .upserted()
        .iter()
        .filter_map(|r| r.get("id").cloned())
        .collect();
    assert_eq!(pushed, vec![json!("a")]);
}

#[tokio::test]
async fn machine_every_state_and_mode_sends_at_most_one_update() {
    let states = [
        FlowState::Offline,
        FlowState::Restarting,
        FlowState::Running,
        FlowState::Stopping,
        FlowState::Failed,
    ];
    let modes = [
        SyncMode::NoSync,
        SyncMode::Pull,
        SyncMode::PullOnce,
        SyncMode::PullComplete,
        SyncMode::PullError,
        SyncMode::Push,
        SyncMode::PushOnce,
        SyncMode::PushComplete,
        SyncMode::PushError,
    ];

    for state in states {
        for mode in modes.clone() {
            let remote = Arc::new(InMemoryRemote::new("id"));
            remote.set_row(row(json!({"id": "r", "val": "1"})));
            let machine = machine(Arc::new(InMemoryVault::new())).await;
            let connection: Arc<dyn RemoteSource> = remote.clone();
            let flow = jobs_flow(&machine, Some(connection), flow_state(state, mode.clone())).await;
            machine.engine().query("INSERT INTO Jobs VALUES ('a', '1')").await.unwrap();

            let mut sync_init = false;
            let outcome = machine.tick(&flow, &mut sync_init).await;
            let expected_branch = match state {
                FlowState::Offline => outcome == TickOutcome::Offline,
                FlowState::Restarting => outcome == TickOutcome::Restarted,
                FlowState::Stopping => outcome == TickOutcome::Stopped,
                FlowState::Failed => outcome == TickOutcome::Failed,
                FlowState::Running => !matches!(
                    outcome,
                    TickOutcome::Offline | TickOutcome::Restarted | TickOutcome::Stopped | TickOutcome::Failed
                ),
            };
            assert!(expected_branch, "{state:?}/{mode} ended in {outcome}");

            tokio::time::sleep(Duration::from_millis(30)).await;
            let sent = machine.controller().updates("Jobs").len();
            assert!(sent <= 1, "{state:?}/{mode} sent {sent} updates");
            machine.shutdown();
        }
    }
}

#[tokio::test]
async fn machine_pull_failure_reports_pull_error_once() {
    let remote = Arc::new(InMemoryRemote::new("id"));
    remote.set_fail_pulls(true);
    let machine = machine(Arc::new(InMemoryVault::new())).await;
    let connection: Arc<dyn RemoteSource> = remote.clone();
    let flow = jobs_flow(&machine, Some(connection), flow_state(FlowState::Running, SyncMode::Pull)).await;

    let mut sync_init = false;
    assert_eq!(machine.tick(&flow, &mut sync_init).await, TickOutcome::PullFailed);
    assert_eq!(flow.sync_mode(), SyncMode::PullError);
    // pullerror no longer pulls
    assert_eq!(machine.tick(&flow, &mut sync_init).await, TickOutcome::Idle);

    let controller = machine.controller();
    wait_for(|| controller.last_update("Jobs").is_some()).await;
    let updates = controller.updates("Jobs");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].sync_mode, SyncMode::PullError);
}

#[tokio::test]
async fn machine_pushonce_remote_failure_ends_in_push_error() {
    let remote = Arc::new(InMemoryRemote::new("id"));
    let machine = machine(Arc::new(InMemoryVault::new())).await;
    let connection: Arc<dyn RemoteSource> = remote.clone();
    let flow = jobs_flow(&machine, Some(connection), flow_state(FlowState::Running, SyncMode::PushOnce)).await;
    machine.engine().query("INSERT INTO Jobs VALUES ('a', '1')").await.unwrap();
    machine.engine().query("INSERT INTO Jobs VALUES ('b', '2')").await.unwrap();
    remote.fail_next_upserts(1);

    let mut sync_init = false;
    assert_eq!(machine.tick(&flow, &mut sync_init).await, TickOutcome::PushFailed);
    assert_eq!(flow.sync_mode(), SyncMode::PushError);
    // The pass stops at the first failure
    assert!(remote.upserted().is_empty());

    let controller = machine.controller();
    wait_for(|| controller.last_update("Jobs").is_some()).await;
    assert_eq!(controller.last_update("Jobs").unwrap().sync_mode, SyncMode::PushError);
}

#[tokio::test]
async fn machine_failed_flow_stays_failed() {
    let machine = machine(Arc::new(InMemoryVault::new())).await;
    let flow = jobs_flow(&machine, None, flow_state(FlowState::Failed, SyncMode::Push)).await;

    let mut sync_init = true;
    for _ in 0..3 {
        assert_eq!(machine.tick(&flow, &mut sync_init).await, TickOutcome::Failed);
    }
    assert!(sync_init);
    assert_eq!(flow.state(), FlowState::Failed);
}

// =============================================================================
// Statistics
// =============================================================================

#[tokio::test]
async fn statistics_vault_delivery_reads_back() {
    let vault = InMemoryVault::new();
    let mut tree = DataFlowTree::init_data_flow(None, "Jobs", false);
    tree.update_data_flow_statistic("Flows", "Jobs", "Loading", "1", 1, None);
    tree.update_data_flow_statistic("Flows", "Jobs", "Load complete", "2", 1, None);

    let sink = StatisticSink {
        vault: Some(&vault),
        engine: None,
        statistics_table: "DataFlowStatistics",
        timeout: Duration::from_secs(1),
    };
    let summary = tree.finish_statistic(&sink, "t1", "TrcVault/tenantId", "flume").await;
    assert_eq!(summary.vault, 2);
    assert_eq!(summary.failed, 0);

    let mut read_back = DataFlowTree::group("Jobs");
    let root = read_back.root();
    let read = retrieve_statistic(
        &vault,
        Duration::from_secs(1),
        &mut read_back,
        root,
        "t1",
        "TrcVault/tenantId",
        "flume",
        "Flows",
        "Jobs",
    )
    .await
    .unwrap();
    assert_eq!(read, 2);

    let names: BTreeSet<String> = read_back
        .statistics()
        .iter()
        .map(|s| s.state_name.clone())
        .collect();
    assert_eq!(names, ["Load complete", "Loading"].iter().map(ToString::to_string).collect());
}

// =============================================================================
// Controller End To End
// =============================================================================

#[tokio::test]
async fn controller_row_drives_flow_to_running() {
    let vault = Arc::new(InMemoryVault::new());
    let machine = machine(vault).await;

    let controller_flow = machine.register_flow(
        FlowHeader::new("TierceronFlow", "FlumeDatabase", "TrcDb"),
        Arc::new(GenericTableDefinition::new(controller_flow_schema("TierceronFlow"), "flowName")),
        None,
    );
    let jobs = machine.register_flow(FlowHeader::new("Jobs", "Flows", "TrcDb"), jobs_definition(), None);
    machine
        .controller()
        .set_state("Jobs", flow_state(FlowState::Offline, SyncMode::NoSync))
        .await
        .unwrap();

    let controller_task = machine.start_flow(Arc::clone(&controller_flow));
    let jobs_task = machine.start_flow(Arc::clone(&jobs));

    wait_for(|| controller_flow.state() == FlowState::Running).await;

    machine
        .call_db_query(
            &controller_flow,
            DbQuery::new(
                "INSERT INTO TierceronFlow (flowName, state, syncMode, syncFilter, flowAlias) \
                 VALUES ('Jobs', 1, 'nosync', '', '')",
            ),
            &["TierceronFlow"],
        )
        .await
        .unwrap();

    let j = Arc::clone(&jobs);
    wait_for(move || j.state() == FlowState::Running).await;
    let updates = machine.controller().updates("Jobs");
    assert!(updates.iter().any(|u| u.state == FlowState::Running));

    machine.shutdown();
    controller_task.await.unwrap().unwrap();
    jobs_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn controller_restart_cycles_running_flow() {
    let machine = machine(Arc::new(InMemoryVault::new())).await;
    let jobs = machine.register_flow(FlowHeader::new("Jobs", "Flows", "TrcDb"), jobs_definition(), None);
    machine
        .controller()
        .set_state("Jobs", flow_state(FlowState::Running, SyncMode::NoSync))
        .await
        .unwrap();
    let task = machine.start_flow(Arc::clone(&jobs));
    let j = Arc::clone(&jobs);
    wait_for(move || j.state() == FlowState::Running).await;

    machine.restart_flow(&jobs).await.unwrap();
    let j = Arc::clone(&jobs);
    wait_for(move || j.state() == FlowState::Running).await;

    let states: Vec<FlowState> = machine
        .controller()
        .updates("Jobs")
        .iter()
        .map(|u| u.state)
        .collect();
    assert_eq!(
        states,
        vec![
            FlowState::Stopping,
            FlowState::Offline,
            FlowState::Restarting,
            FlowState::Running
        ]
    );

    machine.shutdown();
    task.await.unwrap().unwrap();
}

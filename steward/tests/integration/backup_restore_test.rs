use std::time::Duration;

use steward::backup::Page;
use steward::cluster::MemoryCluster;
use steward::engine::TaskState;
use steward::error::ErrorKind;
use steward::latch::{Datastore, LatchState};
use steward::test_utils::datastore::{ExportGate, MemoryDatastore};
use steward::test_utils::node::{spawn_test_node, spawn_test_node_with};
use steward_telemetry::tracing::init_test_tracing;
use tokio::time::timeout;

fn seeded_datastore() -> MemoryDatastore {
    let datastore = MemoryDatastore::new();
    datastore.insert("users/alice", "admin");
    datastore.insert("users/bob", "viewer");
    datastore.insert("settings/theme", "dark");

    datastore
}

fn directory_entries(path: &std::path::Path) -> Vec<String> {
    let mut entries: Vec<String> = std::fs::read_dir(path)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();

    entries
}

#[tokio::test(flavor = "multi_thread")]
async fn backup_then_restore_brings_back_the_datastore() {
    init_test_tracing();

    let dir = tempfile::tempdir().unwrap();
    let cluster = MemoryCluster::new();
    let datastore = seeded_datastore();
    let test_node = spawn_test_node(&cluster, "node-1", dir.path(), datastore.clone());

    let monitor = test_node.node.start_backup().await.unwrap();
    let outcome = monitor.wait().await;
    assert_eq!(outcome.state, TaskState::Succeeded);
    assert_eq!(outcome.progress, 100);
    assert_eq!(test_node.datastore.latch().state(), LatchState::Open);
    assert!(test_node.node.running_task().await.unwrap().is_none());

    let latest = test_node.node.get_latest().await.unwrap().unwrap();
    assert_eq!(latest.identifier, "node-1");
    assert_eq!(directory_entries(dir.path()), vec![latest.name.clone()]);

    datastore.insert("users/alice", "guest");
    datastore.insert("users/carol", "editor");
    datastore.insert("audit/entry", "kept");

    let monitor = test_node.node.start_restore(&latest.name).await.unwrap();
    assert_eq!(monitor.wait().await.state, TaskState::Succeeded);
    assert_eq!(test_node.exporter.imports(), 1);
    assert_eq!(datastore.get("users/alice").as_deref(), Some("admin"));
    assert_eq!(datastore.get("users/carol"), None);
    assert_eq!(datastore.get("settings/theme").as_deref(), Some("dark"));
    assert_eq!(datastore.get("audit/entry").as_deref(), Some("kept"));
    assert_eq!(test_node.datastore.latch().state(), LatchState::Open);
}

#[tokio::test(flavor = "multi_thread")]
async fn callers_wait_while_the_datastore_is_latched() {
    init_test_tracing();

    let dir = tempfile::tempdir().unwrap();
    let cluster = MemoryCluster::new();
    let gate = ExportGate::default();
    let test_node = spawn_test_node_with(
        &cluster,
        "node-1",
        dir.path(),
        seeded_datastore(),
        |exporter| exporter.with_gate(gate.clone()),
    );

    let monitor = test_node.node.start_backup().await.unwrap();
    gate.started().await;
    assert_eq!(test_node.datastore.latch().state(), LatchState::Closed);

    let datastore = test_node.datastore.clone();
    let blocked = tokio::spawn(async move { datastore.connection().await.map(|_| ()) });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished());

    gate.release();
    assert_eq!(monitor.wait().await.state, TaskState::Succeeded);
    timeout(Duration::from_secs(5), blocked)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn open_transactions_keep_working_through_the_drain() {
    init_test_tracing();

    let dir = tempfile::tempdir().unwrap();
    let cluster = MemoryCluster::new();
    let test_node = spawn_test_node(&cluster, "node-1", dir.path(), seeded_datastore());

    let transaction = test_node.datastore.begin_transaction().await.unwrap();
    let monitor = test_node.node.start_backup().await.unwrap();

    let mut state = test_node.datastore.latch().subscribe();
    state
        .wait_for(|state| *state == LatchState::Closing)
        .await
        .unwrap();

    let connection = timeout(
        Duration::from_secs(1),
        test_node.datastore.connection_in(transaction.token()),
    )
    .await
    .unwrap()
    .unwrap();
    connection.insert("users/dave", "viewer");
    drop(connection);
    drop(transaction);

    assert_eq!(monitor.wait().await.state, TaskState::Succeeded);
    assert_eq!(
        test_node.datastore.bypass().get("users/dave").as_deref(),
        Some("viewer")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_export_reopens_the_datastore_and_keeps_no_archive() {
    init_test_tracing();

    let dir = tempfile::tempdir().unwrap();
    let cluster = MemoryCluster::new();
    let test_node = spawn_test_node_with(
        &cluster,
        "node-1",
        dir.path(),
        seeded_datastore(),
        |exporter| exporter.failing(),
    );

    let monitor = test_node.node.start_backup().await.unwrap();
    let outcome = monitor.wait().await;
    assert_eq!(outcome.state, TaskState::Failed);
    assert!(
        outcome
            .error
            .unwrap()
            .kinds()
            .contains(&ErrorKind::StepExecutionFailed)
    );

    assert_eq!(test_node.datastore.latch().state(), LatchState::Open);
    assert!(directory_entries(dir.path()).is_empty());
    assert!(test_node.node.running_task().await.unwrap().is_none());

    test_node.datastore.connection().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn canceled_backup_reopens_the_datastore_and_keeps_no_archive() {
    init_test_tracing();

    let dir = tempfile::tempdir().unwrap();
    let cluster = MemoryCluster::new();
    let gate = ExportGate::default();
    let test_node = spawn_test_node_with(
        &cluster,
        "node-1",
        dir.path(),
        seeded_datastore(),
        |exporter| exporter.with_gate(gate.clone()),
    );

    let monitor = test_node.node.start_backup().await.unwrap();
    gate.started().await;
    test_node.node.cancel(&monitor);

    let outcome = monitor.wait().await;
    assert_eq!(outcome.state, TaskState::Canceled);
    assert_eq!(test_node.exporter.exports(), 0);
    assert_eq!(test_node.datastore.latch().state(), LatchState::Open);
    assert!(directory_entries(dir.path()).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn restore_rejects_unknown_backups_before_admission() {
    init_test_tracing();

    let dir = tempfile::tempdir().unwrap();
    let cluster = MemoryCluster::new();
    let test_node = spawn_test_node(&cluster, "node-1", dir.path(), seeded_datastore());

    let err = test_node
        .node
        .start_restore("../../etc/passwd")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidBackupName);

    let err = test_node
        .node
        .start_restore("backup-node-1-20230101-000000-000Z.zip")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackupNotFound);

    std::fs::write(
        dir.path().join("backup-node-1-20230102-000000-000Z.zip"),
        b"not an archive",
    )
    .unwrap();
    let err = test_node
        .node
        .start_restore("backup-node-1-20230102-000000-000Z.zip")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArchive);

    assert!(test_node.node.running_task().await.unwrap().is_none());
    assert_eq!(test_node.datastore.latch().state(), LatchState::Open);
}

#[tokio::test(flavor = "multi_thread")]
async fn recover_removes_partial_archives() {
    init_test_tracing();

    let dir = tempfile::tempdir().unwrap();
    let cluster = MemoryCluster::new();
    let test_node = spawn_test_node(&cluster, "node-1", dir.path(), seeded_datastore());
    std::fs::write(
        dir.path().join("backup-node-1-20230101-000000-000Z.zip.partial"),
        b"half",
    )
    .unwrap();

    assert_eq!(test_node.node.recover().await.unwrap(), 1);
    assert!(directory_entries(dir.path()).is_empty());
    assert_eq!(
        test_node.node.find_all(Page::default()).await.unwrap().total,
        0
    );
}

use std::sync::{Arc, Mutex};

use steward::cluster::{MemoryCluster, NodeId};
use steward::engine::TaskState;
use steward::error::ErrorKind;
use steward::latch::LatchState;
use steward::maintenance::{MaintenanceType, MonitorSnapshot};
use steward::relay::ClientProgressListener;
use steward::test_utils::datastore::{ExportGate, MemoryDatastore};
use steward::test_utils::node::{TestNode, spawn_test_node, spawn_test_node_with};
use steward_telemetry::tracing::init_test_tracing;

#[derive(Clone, Default)]
struct SeenProgress(Arc<Mutex<Vec<(NodeId, Option<u8>)>>>);

impl ClientProgressListener for SeenProgress {
    fn on_client_progress(&self, snapshot: &MonitorSnapshot) {
        self.0
            .lock()
            .unwrap()
            .push((snapshot.owner.clone(), snapshot.client_progress));
    }
}

fn spawn_cluster(
    cluster: &MemoryCluster,
    directory: &std::path::Path,
    gate: &ExportGate,
) -> (TestNode, TestNode, TestNode) {
    let owner = spawn_test_node_with(
        cluster,
        "node-1",
        directory,
        MemoryDatastore::new(),
        |exporter| exporter.with_gate(gate.clone()),
    );
    let second = spawn_test_node(cluster, "node-2", directory, MemoryDatastore::new());
    let third = spawn_test_node(cluster, "node-3", directory, MemoryDatastore::new());

    (owner, second, third)
}

#[tokio::test(flavor = "multi_thread")]
async fn every_node_sees_the_running_maintenance() {
    init_test_tracing();

    let dir = tempfile::tempdir().unwrap();
    let cluster = MemoryCluster::new();
    let gate = ExportGate::default();
    let (owner, second, third) = spawn_cluster(&cluster, dir.path(), &gate);

    let monitor = owner.node.start_backup().await.unwrap();
    gate.started().await;

    for node in [&owner, &second, &third] {
        let slot = node.node.running_task().await.unwrap().unwrap();
        assert_eq!(slot.kind, MaintenanceType::Backup);
        assert_eq!(slot.owner, NodeId::from("node-1"));
        assert_eq!(slot.monitor_id, monitor.task_id());
    }

    let err = second.node.start_backup().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MaintenanceAlreadyRunning);
    let err = third
        .node
        .start_restore("backup-node-1-20230101-000000-000Z.zip")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackupNotFound);

    // Only the owner latched its datastore.
    assert_eq!(owner.datastore.latch().state(), LatchState::Closed);
    assert_eq!(second.datastore.latch().state(), LatchState::Open);

    gate.release();
    assert_eq!(monitor.wait().await.state, TaskState::Succeeded);

    let monitor = second.node.start_backup().await.unwrap();
    assert_eq!(monitor.wait().await.state, TaskState::Succeeded);
    assert_eq!(
        third
            .node
            .find_all(steward::backup::Page::default())
            .await
            .unwrap()
            .total,
        2
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn client_progress_is_relayed_to_the_owner() {
    init_test_tracing();

    let dir = tempfile::tempdir().unwrap();
    let cluster = MemoryCluster::new();
    let gate = ExportGate::default();
    let (owner, second, third) = spawn_cluster(&cluster, dir.path(), &gate);

    let owner_seen = SeenProgress::default();
    owner.node.add_listener(owner_seen.clone());
    let remote_seen = SeenProgress::default();
    second.node.add_listener(remote_seen.clone());

    let monitor = owner.node.start_backup().await.unwrap();
    gate.started().await;

    second.node.update_client_progress(25).await.unwrap();
    third.node.update_client_progress(60).await.unwrap();
    assert_eq!(monitor.client_progress(), Some(60));
    assert_eq!(
        *owner_seen.0.lock().unwrap(),
        vec![
            (NodeId::from("node-1"), Some(25)),
            (NodeId::from("node-1"), Some(60)),
        ]
    );
    assert!(remote_seen.0.lock().unwrap().is_empty());

    let snapshot = third.node.progress().await.unwrap();
    assert_eq!(snapshot.task_id, monitor.task_id());
    assert_eq!(snapshot.state, TaskState::Running);
    assert_eq!(snapshot.client_progress, Some(60));
    assert!(!snapshot.cancel_requested);

    gate.release();
    monitor.wait().await;

    let err = second.node.update_client_progress(80).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoActiveMaintenance);
    let err = third.node.progress().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoActiveMaintenance);
}

#[tokio::test(flavor = "multi_thread")]
async fn any_node_can_cancel_the_maintenance() {
    init_test_tracing();

    let dir = tempfile::tempdir().unwrap();
    let cluster = MemoryCluster::new();
    let gate = ExportGate::default();
    let (owner, second, _third) = spawn_cluster(&cluster, dir.path(), &gate);

    let monitor = owner.node.start_backup().await.unwrap();
    gate.started().await;

    second.node.cancel_running().await.unwrap();

    let outcome = monitor.wait().await;
    assert_eq!(outcome.state, TaskState::Canceled);
    assert!(monitor.cancel_requested());
    assert_eq!(owner.datastore.latch().state(), LatchState::Open);
    assert!(second.node.running_task().await.unwrap().is_none());

    let err = second.node.cancel_running().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoActiveMaintenance);
}

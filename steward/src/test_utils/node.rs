use std::path::Path;

use steward_config::shared::{BackupConfig, MaintenanceConfig};

use crate::backup::{BackupOrchestrator, FeatureRegistry};
use crate::cluster::{MemoryCluster, MemoryClusterNode};
use crate::latch::{LatchedDatastore, ResourceLatch};
use crate::node::MaintenanceNode;
use crate::test_utils::datastore::{
    MemoryDatastore, RECORDS_GROUP, RecordsExporter, records_features,
};

/// Features registered on every test node.
pub const TEST_FEATURES: &[&str] = &["users", "settings"];

/// A maintenance node joined to an in-memory cluster, with its latched datastore.
#[derive(Debug)]
pub struct TestNode {
    pub node: MaintenanceNode<MemoryClusterNode>,
    pub datastore: LatchedDatastore<MemoryDatastore>,
    pub exporter: RecordsExporter,
}

/// Returns maintenance timings short enough for tests.
pub fn test_maintenance_config() -> MaintenanceConfig {
    MaintenanceConfig {
        drain_timeout_ms: 2_000,
        operation_timeout_ms: 5_000,
        relay_timeout_ms: 2_000,
    }
}

/// Joins node `id` to `cluster`, storing backups in `directory`.
pub fn spawn_test_node(
    cluster: &MemoryCluster,
    id: &str,
    directory: &Path,
    datastore: MemoryDatastore,
) -> TestNode {
    spawn_test_node_with(cluster, id, directory, datastore, |exporter| exporter)
}

/// Same as [`spawn_test_node`], with `configure` adjusting the exporter first.
pub fn spawn_test_node_with<F>(
    cluster: &MemoryCluster,
    id: &str,
    directory: &Path,
    datastore: MemoryDatastore,
    configure: F,
) -> TestNode
where
    F: FnOnce(RecordsExporter) -> RecordsExporter,
{
    let maintenance = test_maintenance_config();
    let mut backup = BackupConfig::new(directory);
    backup.identifier = id.to_string();

    let latch = ResourceLatch::new(format!("{id}-datastore"), maintenance.operation_timeout());
    let datastore = LatchedDatastore::new(datastore, latch.clone());
    let exporter = configure(RecordsExporter::new(datastore.clone()));

    let registry = FeatureRegistry::build(records_features(TEST_FEATURES), &[])
        .expect("test features are valid");
    let orchestrator = BackupOrchestrator::new(&backup, &maintenance, latch, registry)
        .with_exporter(RECORDS_GROUP, exporter.clone());

    TestNode {
        node: MaintenanceNode::new(cluster.join(id), orchestrator, &maintenance),
        datastore,
        exporter,
    }
}

use std::path::Path;
use std::time::Duration;

use steward::backup::{BackupFeature, BackupOrchestrator, FeatureMode, FeatureRegistry};
use steward::cluster::{MemoryCluster, MemoryClusterNode};
use steward::engine::{TaskOutcome, TaskState};
use steward::latch::{LatchedDatastore, ResourceLatch};
use steward::maintenance::TaskMonitor;
use steward::node::MaintenanceNode;
use steward_config::shared::NodeConfig;
use tracing::info;

use crate::store::{ConfigurationExporter, DirectoryDatastore, DirectoryExporter};

/// Feature group holding the datastore records.
const DATASTORE_GROUP: &str = "datastore";

/// Feature group holding the node configuration.
const CONFIGURATION_GROUP: &str = "configuration";

/// Interval between two progress log lines while a maintenance runs.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Builds a standalone node whose datastore lives in `data_dir`.
pub fn build_node(
    config: &NodeConfig,
    data_dir: &Path,
) -> anyhow::Result<MaintenanceNode<MemoryClusterNode>> {
    let latch = ResourceLatch::new(DATASTORE_GROUP, config.maintenance.operation_timeout());
    let datastore = LatchedDatastore::new(DirectoryDatastore::new(data_dir), latch.clone());

    let features = vec![
        BackupFeature::new(DATASTORE_GROUP, "records", FeatureMode::Both),
        BackupFeature::new(CONFIGURATION_GROUP, "node", FeatureMode::Backup),
    ];
    let registry = FeatureRegistry::build(features, &[])?;

    let orchestrator = BackupOrchestrator::new(&config.backup, &config.maintenance, latch, registry)
        .with_exporter(DATASTORE_GROUP, DirectoryExporter::new(datastore))
        .with_exporter(CONFIGURATION_GROUP, ConfigurationExporter::new(config.clone()));

    let cluster = MemoryCluster::new();
    Ok(MaintenanceNode::new(
        cluster.join(config.node_id.as_str()),
        orchestrator,
        &config.maintenance,
    ))
}

/// Waits for the maintenance behind `monitor`, logging its progress.
pub async fn wait_for(monitor: &TaskMonitor) -> anyhow::Result<TaskOutcome> {
    let mut interval = tokio::time::interval(PROGRESS_LOG_INTERVAL);
    let wait = monitor.wait();
    tokio::pin!(wait);

    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome,
            _ = interval.tick() => {
                info!(
                    task_id = %monitor.task_id(),
                    kind = %monitor.kind(),
                    progress = monitor.progress(),
                    "maintenance running"
                );
            }
        }
    };

    if outcome.state == TaskState::Succeeded {
        return Ok(outcome);
    }

    let failure = format!("{} ended {}", monitor.kind(), outcome.state);
    match outcome.error {
        Some(err) => Err(anyhow::Error::new(err).context(failure)),
        None => Err(anyhow::anyhow!(failure)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use steward_config::shared::{BackupConfig, MaintenanceConfig};

    #[tokio::test(flavor = "multi_thread")]
    async fn data_directory_survives_backup_and_restore() {
        let data = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            node_id: "node-1".to_string(),
            maintenance: MaintenanceConfig::default(),
            backup: BackupConfig::new(backups.path()),
        };
        let node = build_node(&config, data.path()).unwrap();

        let records = data.path().join("records");
        std::fs::create_dir_all(&records).unwrap();
        std::fs::write(records.join("alice"), b"admin").unwrap();

        let monitor = node.start_backup().await.unwrap();
        wait_for(&monitor).await.unwrap();
        let latest = node.get_latest().await.unwrap().unwrap();
        assert_eq!(latest.identifier, BackupConfig::DEFAULT_IDENTIFIER);

        std::fs::write(records.join("alice"), b"guest").unwrap();
        std::fs::write(records.join("bob"), b"viewer").unwrap();

        let monitor = node.start_restore(&latest.name).await.unwrap();
        wait_for(&monitor).await.unwrap();
        assert_eq!(std::fs::read(records.join("alice")).unwrap(), b"admin");
        assert!(!records.join("bob").exists());
    }
}

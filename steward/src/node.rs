use std::fmt;
use std::sync::Arc;

use steward_config::shared::MaintenanceConfig;
use tracing::{info, warn};

use crate::backup::{BackupOrchestrator, BackupPage, BackupRecord, Page};
use crate::bail;
use crate::cluster::{Cluster, ClusterMessaging, NodeId};
use crate::error::{ErrorKind, StewardResult};
use crate::maintenance::{
    MaintenanceCoordinator, MaintenanceSlot, MaintenanceType, MonitorSnapshot, TaskMonitor,
};
use crate::relay::{ClientProgressListener, ProgressRelay};

/// Everything one cluster node exposes to maintenance clients.
///
/// Every node of the cluster can answer every call. Starting a maintenance admits it
/// cluster-wide, and progress or cancel requests reach the node running it.
pub struct MaintenanceNode<C> {
    coordinator: MaintenanceCoordinator<C>,
    relay: ProgressRelay<C>,
    orchestrator: Arc<BackupOrchestrator>,
}

impl<C> Clone for MaintenanceNode<C> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            relay: self.relay.clone(),
            orchestrator: self.orchestrator.clone(),
        }
    }
}

impl<C> fmt::Debug for MaintenanceNode<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaintenanceNode")
            .field("coordinator", &self.coordinator)
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl<C> MaintenanceNode<C>
where
    C: Cluster,
{
    /// Creates the node and registers its request handler with the cluster.
    pub fn new(cluster: C, orchestrator: BackupOrchestrator, config: &MaintenanceConfig) -> Self {
        let coordinator = MaintenanceCoordinator::new(cluster);
        let relay = ProgressRelay::new(coordinator.clone(), config.relay_timeout());
        coordinator
            .cluster()
            .register_handler(Arc::new(relay.handler()));

        info!(node = %coordinator.node_id(), "maintenance node ready");

        Self {
            coordinator,
            relay,
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        self.coordinator.node_id()
    }

    pub fn coordinator(&self) -> &MaintenanceCoordinator<C> {
        &self.coordinator
    }

    pub fn orchestrator(&self) -> &BackupOrchestrator {
        &self.orchestrator
    }

    /// Registers a listener for client progress of maintenance owned by this node.
    pub fn add_listener<L>(&self, listener: L)
    where
        L: ClientProgressListener,
    {
        self.relay.add_listener(listener);
    }

    /// Starts a backup.
    ///
    /// Fails with [`ErrorKind::MaintenanceAlreadyRunning`] when any maintenance runs anywhere
    /// in the cluster.
    pub async fn start_backup(&self) -> StewardResult<TaskMonitor> {
        let task = self.orchestrator.backup_task()?;
        self.coordinator.start(task, MaintenanceType::Backup).await
    }

    /// Starts restoring backup `name`.
    ///
    /// The backup is loaded and checked before admission.
    pub async fn start_restore(&self, name: &str) -> StewardResult<TaskMonitor> {
        let task = self.orchestrator.restore_task(name).await?;
        self.coordinator.start(task, MaintenanceType::Restore).await
    }

    pub fn cancel(&self, monitor: &TaskMonitor) {
        self.coordinator.cancel(monitor);
    }

    /// Returns the maintenance running anywhere in the cluster.
    pub async fn running_task(&self) -> StewardResult<Option<MaintenanceSlot>> {
        self.coordinator.running_task().await
    }

    pub async fn find_all(&self, page: Page) -> StewardResult<BackupPage> {
        self.orchestrator.repository().find_all(page).await
    }

    pub async fn find_by_name(&self, name: &str) -> StewardResult<Option<BackupRecord>> {
        self.orchestrator.repository().find_by_name(name).await
    }

    pub async fn get_latest(&self) -> StewardResult<Option<BackupRecord>> {
        self.orchestrator.repository().get_latest().await
    }

    pub async fn delete(&self, name: &str) -> StewardResult<()> {
        self.orchestrator.repository().delete(name).await
    }

    /// Records progress reported by the client driving the running maintenance.
    pub async fn update_client_progress(&self, percent: u8) -> StewardResult<()> {
        let kind = self.active_kind().await?;
        self.relay.update_client_progress(kind, percent).await
    }

    /// Returns the progress of the running maintenance.
    pub async fn progress(&self) -> StewardResult<MonitorSnapshot> {
        let kind = self.active_kind().await?;
        self.relay.progress(kind).await
    }

    /// Cancels the running maintenance, wherever it runs.
    pub async fn cancel_running(&self) -> StewardResult<()> {
        let kind = self.active_kind().await?;
        self.relay.cancel(kind).await
    }

    /// Removes archives an interrupted backup left behind.
    ///
    /// Does nothing while a maintenance runs, since its archive may still be in progress.
    pub async fn recover(&self) -> StewardResult<usize> {
        if let Some(slot) = self.running_task().await? {
            warn!(
                kind = %slot.kind,
                owner = %slot.owner,
                "maintenance running, skipping partial archive cleanup"
            );
            return Ok(0);
        }

        self.orchestrator.repository().remove_partials().await
    }

    async fn active_kind(&self) -> StewardResult<MaintenanceType> {
        match self.running_task().await? {
            Some(slot) => Ok(slot.kind),
            None => bail!(
                ErrorKind::NoActiveMaintenance,
                "No maintenance is running",
                format!("asked node `{}`", self.node_id())
            ),
        }
    }
}

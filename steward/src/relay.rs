//! Relays client progress, progress queries and cancellations to the node owning the running
//! maintenance.
//!
//! A client may talk to any node. When the maintenance runs locally the relay acts on the local
//! [`TaskMonitor`], otherwise it looks up the owner in the maintenance slot and forwards the
//! request over [`crate::cluster::ClusterMessaging`].

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::bail;
use crate::cluster::{Cluster, ClusterRequest, ClusterRequestHandler, ClusterResponse, NodeId};
use crate::error::{ErrorKind, StewardError, StewardResult};
use crate::maintenance::{
    MaintenanceCoordinator, MaintenanceType, MonitorSnapshot, TaskMonitor, WeakCoordinator,
};
use crate::steward_error;

/// Notified on the owner node whenever a client reports progress.
pub trait ClientProgressListener: Send + Sync + 'static {
    fn on_client_progress(&self, snapshot: &MonitorSnapshot);
}

type Listeners = Arc<RwLock<Vec<Arc<dyn ClientProgressListener>>>>;

/// Routes maintenance requests to the node running the maintenance.
pub struct ProgressRelay<C> {
    coordinator: MaintenanceCoordinator<C>,
    listeners: Listeners,
    timeout: Duration,
}

impl<C> Clone for ProgressRelay<C> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            listeners: self.listeners.clone(),
            timeout: self.timeout,
        }
    }
}

impl<C> ProgressRelay<C>
where
    C: Cluster,
{
    /// Creates a relay waiting at most `timeout` for forwarded requests.
    pub fn new(coordinator: MaintenanceCoordinator<C>, timeout: Duration) -> Self {
        Self {
            coordinator,
            listeners: Arc::new(RwLock::new(Vec::new())),
            timeout,
        }
    }

    /// Returns the handler answering requests forwarded by other nodes.
    ///
    /// The handler does not keep the coordinator alive. Once it is dropped, the handler
    /// answers that no maintenance runs.
    pub fn handler(&self) -> RelayHandler<C> {
        RelayHandler {
            coordinator: self.coordinator.downgrade(),
            listeners: self.listeners.clone(),
            timeout: self.timeout,
        }
    }

    /// Registers a listener notified of client progress of local maintenance.
    pub fn add_listener<L>(&self, listener: L)
    where
        L: ClientProgressListener,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Records progress reported by the client driving the maintenance of type `kind`.
    ///
    /// Fails with [`ErrorKind::NoActiveMaintenance`] when no maintenance of that type runs
    /// anywhere in the cluster.
    pub async fn update_client_progress(
        &self,
        kind: MaintenanceType,
        percent: u8,
    ) -> StewardResult<()> {
        if let Some(monitor) = self.coordinator.local_monitor(kind) {
            self.apply_client_progress(&monitor, percent);
            return Ok(());
        }

        let owner = self.owner_of(kind).await?;
        let request = ClusterRequest::UpdateClientProgress {
            kind,
            progress: percent,
        };
        match self.forward(&owner, request).await? {
            ClusterResponse::Ack => Ok(()),
            response => Err(response_error(kind, &owner, response)),
        }
    }

    /// Returns the progress of the maintenance of type `kind`, wherever it runs.
    pub async fn progress(&self, kind: MaintenanceType) -> StewardResult<MonitorSnapshot> {
        if let Some(monitor) = self.coordinator.local_monitor(kind) {
            return Ok(monitor.snapshot());
        }

        let owner = self.owner_of(kind).await?;
        match self.forward(&owner, ClusterRequest::Progress { kind }).await? {
            ClusterResponse::Progress { snapshot } => Ok(snapshot),
            response => Err(response_error(kind, &owner, response)),
        }
    }

    /// Cancels the maintenance of type `kind`, wherever it runs.
    pub async fn cancel(&self, kind: MaintenanceType) -> StewardResult<()> {
        if let Some(monitor) = self.coordinator.local_monitor(kind) {
            self.coordinator.cancel(&monitor);
            return Ok(());
        }

        let owner = self.owner_of(kind).await?;
        match self.forward(&owner, ClusterRequest::Cancel { kind }).await? {
            ClusterResponse::Ack => Ok(()),
            response => Err(response_error(kind, &owner, response)),
        }
    }

    fn apply_client_progress(&self, monitor: &TaskMonitor, percent: u8) {
        monitor.set_client_progress(percent);
        let snapshot = monitor.snapshot();

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_client_progress(&snapshot);
        }

        debug!(
            task_id = %snapshot.task_id,
            kind = %snapshot.kind,
            client_progress = percent,
            "client progress recorded"
        );
    }

    async fn owner_of(&self, kind: MaintenanceType) -> StewardResult<NodeId> {
        match self.coordinator.running_task().await? {
            Some(slot) if slot.kind == kind => Ok(slot.owner),
            Some(slot) => bail!(
                ErrorKind::NoActiveMaintenance,
                "No maintenance of the requested type is running",
                format!("requested {kind} but {} is running", slot.kind)
            ),
            None => bail!(
                ErrorKind::NoActiveMaintenance,
                "No maintenance of the requested type is running",
                format!("requested {kind}")
            ),
        }
    }

    async fn forward(
        &self,
        owner: &NodeId,
        request: ClusterRequest,
    ) -> StewardResult<ClusterResponse> {
        debug!(owner = %owner, ?request, "forwarding maintenance request to owner node");

        let cluster = self.coordinator.cluster();
        match tokio::time::timeout(self.timeout, cluster.execute_on_node(owner, request)).await {
            Ok(response) => response,
            Err(_) => bail!(
                ErrorKind::ClusterRequestTimeout,
                "The owner node did not answer in time",
                format!("node `{owner}` after {:?}", self.timeout)
            ),
        }
    }
}

impl<C> fmt::Debug for ProgressRelay<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressRelay")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn response_error(kind: MaintenanceType, owner: &NodeId, response: ClusterResponse) -> StewardError {
    match response {
        ClusterResponse::NoActiveMaintenance { .. } => steward_error!(
            ErrorKind::NoActiveMaintenance,
            "No maintenance of the requested type is running",
            format!("node `{owner}` no longer runs {kind}")
        ),
        ClusterResponse::Failed { description } => steward_error!(
            ErrorKind::Unknown,
            "The owner node failed to handle the request",
            format!("node `{owner}`: {description}")
        ),
        other => steward_error!(
            ErrorKind::InvalidState,
            "The owner node sent an unexpected response",
            format!("node `{owner}` answered {other:?}")
        ),
    }
}

/// Answers relayed requests on the node owning the maintenance.
pub struct RelayHandler<C> {
    coordinator: WeakCoordinator<C>,
    listeners: Listeners,
    timeout: Duration,
}

#[async_trait]
impl<C> ClusterRequestHandler for RelayHandler<C>
where
    C: Cluster,
{
    async fn handle(&self, request: ClusterRequest) -> ClusterResponse {
        let kind = match &request {
            ClusterRequest::UpdateClientProgress { kind, .. }
            | ClusterRequest::Progress { kind }
            | ClusterRequest::Cancel { kind } => *kind,
        };
        let Some(coordinator) = self.coordinator.upgrade() else {
            return ClusterResponse::NoActiveMaintenance { kind };
        };
        let Some(monitor) = coordinator.local_monitor(kind) else {
            return ClusterResponse::NoActiveMaintenance { kind };
        };
        let relay = ProgressRelay {
            coordinator,
            listeners: self.listeners.clone(),
            timeout: self.timeout,
        };

        match request {
            ClusterRequest::UpdateClientProgress { progress, .. } => {
                relay.apply_client_progress(&monitor, progress);
                ClusterResponse::Ack
            }
            ClusterRequest::Progress { .. } => ClusterResponse::Progress {
                snapshot: monitor.snapshot(),
            },
            ClusterRequest::Cancel { .. } => {
                info!(task_id = %monitor.task_id(), %kind, "relayed cancel request");
                relay.coordinator.cancel(&monitor);
                ClusterResponse::Ack
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::cluster::{ClusterMessaging, MemoryCluster, MemoryClusterNode};
    use crate::engine::TaskState;
    use crate::test_utils::steps::{ScriptedStep, single_phase_task};

    #[derive(Default)]
    struct RecordingListener {
        seen: Arc<Mutex<Vec<Option<u8>>>>,
    }

    impl ClientProgressListener for RecordingListener {
        fn on_client_progress(&self, snapshot: &MonitorSnapshot) {
            self.seen.lock().unwrap().push(snapshot.client_progress);
        }
    }

    fn relay(cluster: &MemoryCluster, node: &str) -> ProgressRelay<MemoryClusterNode> {
        let member = cluster.join(node);
        let relay = ProgressRelay::new(
            MaintenanceCoordinator::new(member.clone()),
            Duration::from_secs(5),
        );
        member.register_handler(Arc::new(relay.handler()));

        relay
    }

    #[tokio::test]
    async fn forwarded_progress_reaches_owner_monitor() {
        let cluster = MemoryCluster::new();
        let owner = relay(&cluster, "node-1");
        let other = relay(&cluster, "node-2");

        let seen = Arc::new(Mutex::new(Vec::new()));
        owner.add_listener(RecordingListener { seen: seen.clone() });

        let blocker = ScriptedStep::block("work");
        let probe = blocker.probe();
        let monitor = owner
            .coordinator
            .start(single_phase_task("backup", vec![blocker]), MaintenanceType::Backup)
            .await
            .unwrap();
        probe.started().await;

        other
            .update_client_progress(MaintenanceType::Backup, 40)
            .await
            .unwrap();
        assert_eq!(monitor.client_progress(), Some(40));
        assert_eq!(*seen.lock().unwrap(), vec![Some(40)]);

        let snapshot = other.progress(MaintenanceType::Backup).await.unwrap();
        assert_eq!(snapshot.owner, NodeId::from("node-1"));
        assert_eq!(snapshot.client_progress, Some(40));
        assert_eq!(snapshot.state, TaskState::Running);

        other.cancel(MaintenanceType::Backup).await.unwrap();
        assert_eq!(monitor.wait().await.state, TaskState::Canceled);
    }

    #[tokio::test]
    async fn local_progress_notifies_listeners_directly() {
        let cluster = MemoryCluster::new();
        let owner = relay(&cluster, "node-1");
        let seen = Arc::new(Mutex::new(Vec::new()));
        owner.add_listener(RecordingListener { seen: seen.clone() });

        let blocker = ScriptedStep::block("work");
        let probe = blocker.probe();
        let monitor = owner
            .coordinator
            .start(single_phase_task("backup", vec![blocker]), MaintenanceType::Backup)
            .await
            .unwrap();

        owner
            .update_client_progress(MaintenanceType::Backup, 70)
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Some(70)]);

        probe.release();
        assert!(monitor.wait().await.is_success());
    }

    #[tokio::test]
    async fn no_running_maintenance_is_rejected() {
        let cluster = MemoryCluster::new();
        let node = relay(&cluster, "node-1");

        let err = node
            .update_client_progress(MaintenanceType::Backup, 10)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoActiveMaintenance);

        let err = node.progress(MaintenanceType::Restore).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoActiveMaintenance);
    }

    #[tokio::test]
    async fn other_maintenance_type_is_rejected() {
        let cluster = MemoryCluster::new();
        let owner = relay(&cluster, "node-1");
        let other = relay(&cluster, "node-2");

        let blocker = ScriptedStep::block("work");
        let probe = blocker.probe();
        let monitor = owner
            .coordinator
            .start(single_phase_task("backup", vec![blocker]), MaintenanceType::Backup)
            .await
            .unwrap();

        let err = other
            .update_client_progress(MaintenanceType::Restore, 10)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoActiveMaintenance);
        assert_eq!(err.detail(), Some("requested restore but backup is running"));

        probe.release();
        monitor.wait().await;
    }

    #[tokio::test]
    async fn unreachable_owner_is_reported() {
        let cluster = MemoryCluster::new();
        let owner = relay(&cluster, "node-1");
        let other = relay(&cluster, "node-2");

        let blocker = ScriptedStep::block("work");
        let probe = blocker.probe();
        let monitor = owner
            .coordinator
            .start(single_phase_task("backup", vec![blocker]), MaintenanceType::Backup)
            .await
            .unwrap();
        cluster.leave(&NodeId::from("node-1"));

        let err = other
            .update_client_progress(MaintenanceType::Backup, 10)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClusterNodeUnavailable);

        probe.release();
        monitor.wait().await;
    }

    #[tokio::test]
    async fn registered_handler_does_not_keep_node_alive() {
        let cluster = MemoryCluster::new();
        let dropped = relay(&cluster, "node-1");
        let other = relay(&cluster, "node-2");
        let coordinator = dropped.coordinator.downgrade();

        drop(dropped);
        assert!(coordinator.upgrade().is_none());

        let response = other
            .coordinator
            .cluster()
            .execute_on_node(
                &NodeId::from("node-1"),
                ClusterRequest::Progress {
                    kind: MaintenanceType::Backup,
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            response,
            ClusterResponse::NoActiveMaintenance {
                kind: MaintenanceType::Backup
            }
        ));
    }
}

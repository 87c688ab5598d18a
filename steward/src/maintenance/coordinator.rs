use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::bail;
use crate::cluster::{Cluster, NodeId};
use crate::engine::{Task, TaskOutcome, TaskState};
use crate::error::{ErrorKind, StewardResult};
use crate::maintenance::monitor::TaskMonitor;
use crate::maintenance::slot::{MaintenanceSlot, MaintenanceType};
use crate::steward_error;

/// Cluster store key holding the [`MaintenanceSlot`].
pub const MAINTENANCE_SLOT_KEY: &str = "steward/maintenance/slot";

/// Number of attempts made to remove the slot before giving up.
const SLOT_RELEASE_ATTEMPTS: u32 = 3;

/// Delay between two slot removal attempts.
const SLOT_RELEASE_RETRY_DELAY: Duration = Duration::from_millis(200);

struct CoordinatorInner<C> {
    cluster: C,
    monitors: Mutex<HashMap<MaintenanceType, TaskMonitor>>,
}

/// Admits at most one maintenance task across the cluster and runs it.
pub struct MaintenanceCoordinator<C> {
    inner: Arc<CoordinatorInner<C>>,
}

impl<C> Clone for MaintenanceCoordinator<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> MaintenanceCoordinator<C> {
    /// Returns a reference that does not keep the coordinator alive.
    pub fn downgrade(&self) -> WeakCoordinator<C> {
        WeakCoordinator {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning reference to a [`MaintenanceCoordinator`].
///
/// Handlers registered with the cluster hold this, since the cluster is owned by the
/// coordinator itself.
pub struct WeakCoordinator<C> {
    inner: Weak<CoordinatorInner<C>>,
}

impl<C> WeakCoordinator<C> {
    /// Returns the coordinator if it is still alive.
    pub fn upgrade(&self) -> Option<MaintenanceCoordinator<C>> {
        self.inner
            .upgrade()
            .map(|inner| MaintenanceCoordinator { inner })
    }
}

impl<C> Clone for WeakCoordinator<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> fmt::Debug for MaintenanceCoordinator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<MaintenanceType> = self
            .inner
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        kinds.sort_by_key(|kind| kind.as_str());

        f.debug_struct("MaintenanceCoordinator")
            .field("local_maintenance", &kinds)
            .finish_non_exhaustive()
    }
}

impl<C> MaintenanceCoordinator<C>
where
    C: Cluster,
{
    pub fn new(cluster: C) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                cluster,
                monitors: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn cluster(&self) -> &C {
        &self.inner.cluster
    }

    pub fn node_id(&self) -> &NodeId {
        self.inner.cluster.local_node()
    }

    /// Admits `task` as the cluster's maintenance operation of type `kind` and runs it.
    ///
    /// Fails right away with [`ErrorKind::MaintenanceAlreadyRunning`] when any node holds the
    /// maintenance slot. Once the task is terminal its callbacks fire, then the slot is removed
    /// and the returned monitor is marked released.
    pub async fn start(&self, task: Task, kind: MaintenanceType) -> StewardResult<TaskMonitor> {
        let handle = task.handle();
        let slot = MaintenanceSlot {
            kind,
            owner: self.node_id().clone(),
            started_at: Utc::now(),
            monitor_id: handle.id(),
        };
        let encoded_slot = serde_json::to_vec(&slot)?;

        if let Some(current) = self
            .inner
            .cluster
            .put_if_absent(MAINTENANCE_SLOT_KEY, encoded_slot.clone())
            .await?
        {
            let detail = match serde_json::from_slice::<MaintenanceSlot>(&current) {
                Ok(current) => format!(
                    "{} started by node `{}` at {}",
                    current.kind, current.owner, current.started_at
                ),
                Err(_) => "the maintenance slot holds an unreadable record".to_owned(),
            };
            warn!(node = %self.node_id(), %kind, %detail, "maintenance admission rejected");

            bail!(
                ErrorKind::MaintenanceAlreadyRunning,
                "Another maintenance operation is already running",
                detail
            );
        }

        let monitor = TaskMonitor::new(kind, slot.owner.clone(), slot.started_at, handle.clone());
        self.lock_monitors().insert(kind, monitor.clone());
        info!(
            node = %self.node_id(),
            %kind,
            task_id = %handle.id(),
            task = %handle.name(),
            "maintenance admitted"
        );

        let coordinator = self.clone();
        let supervised = monitor.clone();
        tokio::spawn(async move {
            let outcome = match tokio::spawn(task.run()).await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    let error = if join_error.is_panic() {
                        steward_error!(
                            ErrorKind::TaskPanic,
                            "The maintenance task panicked",
                            format!("task {}", handle.id())
                        )
                    } else {
                        steward_error!(
                            ErrorKind::TaskPanic,
                            "The maintenance task was aborted",
                            format!("task {}", handle.id())
                        )
                    };
                    error!(task_id = %handle.id(), error = %error, "maintenance task crashed");
                    handle.force_terminal(TaskState::Failed);

                    TaskOutcome {
                        state: TaskState::Failed,
                        progress: handle.progress(),
                        error: Some(error),
                    }
                }
            };

            coordinator.finish(&supervised, outcome, &encoded_slot).await;
        });

        Ok(monitor)
    }

    /// Returns the maintenance currently running anywhere in the cluster.
    pub async fn running_task(&self) -> StewardResult<Option<MaintenanceSlot>> {
        let Some(encoded) = self.inner.cluster.get(MAINTENANCE_SLOT_KEY).await? else {
            return Ok(None);
        };

        Ok(Some(serde_json::from_slice(&encoded)?))
    }

    /// Requests cooperative cancellation of the task behind `monitor`.
    pub fn cancel(&self, monitor: &TaskMonitor) {
        info!(task_id = %monitor.task_id(), kind = %monitor.kind(), "maintenance cancel requested");
        monitor.cancel();
    }

    /// Returns the monitor of the maintenance of type `kind` running on this node.
    pub fn local_monitor(&self, kind: MaintenanceType) -> Option<TaskMonitor> {
        self.lock_monitors().get(&kind).cloned()
    }

    async fn finish(&self, monitor: &TaskMonitor, outcome: TaskOutcome, encoded_slot: &[u8]) {
        let state = outcome.state;
        monitor.complete(outcome);

        {
            let mut monitors = self.lock_monitors();
            if monitors
                .get(&monitor.kind())
                .is_some_and(|current| current.task_id() == monitor.task_id())
            {
                monitors.remove(&monitor.kind());
            }
        }

        self.release_slot(encoded_slot).await;
        monitor.mark_released();

        info!(
            node = %self.node_id(),
            kind = %monitor.kind(),
            task_id = %monitor.task_id(),
            %state,
            "maintenance released"
        );
    }

    async fn release_slot(&self, encoded_slot: &[u8]) {
        for attempt in 1..=SLOT_RELEASE_ATTEMPTS {
            match self
                .inner
                .cluster
                .remove_if(MAINTENANCE_SLOT_KEY, encoded_slot)
                .await
            {
                Ok(true) => return,
                Ok(false) => {
                    warn!("maintenance slot was replaced before it could be released");
                    return;
                }
                Err(err) => {
                    error!(attempt, error = %err, "failed to release maintenance slot");
                    if attempt < SLOT_RELEASE_ATTEMPTS {
                        tokio::time::sleep(SLOT_RELEASE_RETRY_DELAY).await;
                    }
                }
            }
        }

        error!("giving up on releasing the maintenance slot");
    }

    fn lock_monitors(&self) -> MutexGuard<'_, HashMap<MaintenanceType, TaskMonitor>> {
        self.inner
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::cluster::{ClusterStore, MemoryCluster};
    use crate::test_utils::steps::{ScriptedStep, single_phase_task};

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_starts_admit_exactly_one() {
        let cluster = MemoryCluster::new();
        let coordinators: Vec<_> = (0..8)
            .map(|i| MaintenanceCoordinator::new(cluster.join(format!("node-{i}"))))
            .collect();

        let attempts = coordinators.iter().map(|coordinator| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let task = single_phase_task("backup", vec![ScriptedStep::block("work")]);
                coordinator.start(task, MaintenanceType::Backup).await
            })
        });
        let results = futures::future::join_all(attempts).await;

        let mut admitted = Vec::new();
        for result in results {
            match result.unwrap() {
                Ok(monitor) => admitted.push(monitor),
                Err(err) => assert_eq!(err.kind(), ErrorKind::MaintenanceAlreadyRunning),
            }
        }
        assert_eq!(admitted.len(), 1);
        let monitor = admitted.remove(0);

        let slot = coordinators[0].running_task().await.unwrap().unwrap();
        assert_eq!(slot.monitor_id, monitor.task_id());
        assert_eq!(&slot.owner, monitor.owner());

        monitor.cancel();
        let outcome = monitor.wait().await;
        assert_eq!(outcome.state, TaskState::Canceled);
        assert!(coordinators[3].running_task().await.unwrap().is_none());

        let next = coordinators[5]
            .start(
                single_phase_task("backup", vec![ScriptedStep::succeed("work")]),
                MaintenanceType::Backup,
            )
            .await
            .unwrap();
        assert!(next.wait().await.is_success());
    }

    #[tokio::test]
    async fn rejection_names_the_owner() {
        let cluster = MemoryCluster::new();
        let first = MaintenanceCoordinator::new(cluster.join("node-1"));
        let second = MaintenanceCoordinator::new(cluster.join("node-2"));

        let blocker = ScriptedStep::block("work");
        let probe = blocker.probe();
        let monitor = first
            .start(single_phase_task("backup", vec![blocker]), MaintenanceType::Backup)
            .await
            .unwrap();

        let err = second
            .start(
                single_phase_task("restore", vec![ScriptedStep::succeed("work")]),
                MaintenanceType::Restore,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MaintenanceAlreadyRunning);
        assert!(err.detail().unwrap().contains("backup started by node `node-1`"));

        probe.release();
        assert!(monitor.wait().await.is_success());
    }

    #[tokio::test]
    async fn slot_is_released_after_failure() {
        let cluster = MemoryCluster::new();
        let coordinator = MaintenanceCoordinator::new(cluster.join("node-1"));

        let monitor = coordinator
            .start(
                single_phase_task("backup", vec![ScriptedStep::fail("work", ErrorKind::IoError)]),
                MaintenanceType::Backup,
            )
            .await
            .unwrap();

        let outcome = monitor.wait().await;
        assert_eq!(outcome.state, TaskState::Failed);
        assert!(monitor.is_released());
        assert!(coordinator.running_task().await.unwrap().is_none());
        assert!(coordinator.local_monitor(MaintenanceType::Backup).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_task_fails_and_releases_slot() {
        let cluster = MemoryCluster::new();
        let coordinator = MaintenanceCoordinator::new(cluster.join("node-1"));
        let fired = Arc::new(AtomicUsize::new(0));

        let monitor = coordinator
            .start(
                single_phase_task("backup", vec![ScriptedStep::panic("work")]),
                MaintenanceType::Backup,
            )
            .await
            .unwrap();
        let counter = fired.clone();
        monitor.on_terminal(move |outcome| {
            assert_eq!(outcome.state, TaskState::Failed);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let outcome = monitor.wait().await;
        assert_eq!(
            outcome.error.map(|err| err.kind()),
            Some(ErrorKind::TaskPanic)
        );
        assert_eq!(monitor.state(), TaskState::Failed);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(
            cluster.join("node-2").get(MAINTENANCE_SLOT_KEY).await.unwrap(),
            None
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_callback_still_releases_slot() {
        let cluster = MemoryCluster::new();
        let coordinator = MaintenanceCoordinator::new(cluster.join("node-1"));
        let blocker = ScriptedStep::block("work");
        let probe = blocker.probe();

        let monitor = coordinator
            .start(single_phase_task("backup", vec![blocker]), MaintenanceType::Backup)
            .await
            .unwrap();
        monitor.on_terminal(|_| panic!("terminal callback failure"));
        probe.release();

        let outcome = tokio::time::timeout(Duration::from_secs(5), monitor.wait())
            .await
            .expect("monitor was never released");
        assert!(outcome.is_success());
        assert!(monitor.is_released());
        assert!(coordinator.running_task().await.unwrap().is_none());

        let next = coordinator
            .start(
                single_phase_task("backup", vec![ScriptedStep::succeed("work")]),
                MaintenanceType::Backup,
            )
            .await
            .unwrap();
        assert!(next.wait().await.is_success());
    }

    #[tokio::test]
    async fn local_monitor_is_tracked_while_running() {
        let cluster = MemoryCluster::new();
        let coordinator = MaintenanceCoordinator::new(cluster.join("node-1"));
        let blocker = ScriptedStep::block("work");
        let probe = blocker.probe();

        let monitor = coordinator
            .start(single_phase_task("backup", vec![blocker]), MaintenanceType::Backup)
            .await
            .unwrap();
        probe.started().await;

        let local = coordinator.local_monitor(MaintenanceType::Backup).unwrap();
        assert_eq!(local.task_id(), monitor.task_id());
        assert_eq!(local.state(), TaskState::Running);
        assert!(coordinator.local_monitor(MaintenanceType::Restore).is_none());

        coordinator.cancel(&monitor);
        assert!(monitor.cancel_requested());
        assert_eq!(monitor.wait().await.state, TaskState::Canceled);
        assert!(probe.observed_cancel());
    }
}

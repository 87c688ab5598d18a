use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::error;

use crate::cluster::NodeId;
use crate::engine::{TaskHandle, TaskId, TaskOutcome, TaskState};
use crate::maintenance::slot::MaintenanceType;

type TerminalCallback = Box<dyn FnOnce(&TaskOutcome) + Send + 'static>;

/// Point-in-time view of a [`TaskMonitor`], also sent between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub task_id: TaskId,
    pub kind: MaintenanceType,
    pub owner: NodeId,
    pub state: TaskState,
    pub progress: u8,
    pub client_progress: Option<u8>,
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
struct Terminal {
    outcome: Option<TaskOutcome>,
    callbacks: Vec<TerminalCallback>,
}

struct MonitorInner {
    kind: MaintenanceType,
    owner: NodeId,
    started_at: DateTime<Utc>,
    task: TaskHandle,
    client_progress_tx: watch::Sender<Option<u8>>,
    terminal: Mutex<Terminal>,
    released_tx: watch::Sender<bool>,
}

/// Client-facing handle of an admitted maintenance task.
///
/// Progress and state mirror the task. Callbacks registered with [`TaskMonitor::on_terminal`]
/// fire exactly once, when the task reaches a terminal state.
#[derive(Clone)]
pub struct TaskMonitor {
    inner: Arc<MonitorInner>,
}

impl TaskMonitor {
    pub(crate) fn new(
        kind: MaintenanceType,
        owner: NodeId,
        started_at: DateTime<Utc>,
        task: TaskHandle,
    ) -> Self {
        let (client_progress_tx, _) = watch::channel(None);
        let (released_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(MonitorInner {
                kind,
                owner,
                started_at,
                task,
                client_progress_tx,
                terminal: Mutex::new(Terminal::default()),
                released_tx,
            }),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.inner.task.id()
    }

    pub fn kind(&self) -> MaintenanceType {
        self.inner.kind
    }

    pub fn owner(&self) -> &NodeId {
        &self.inner.owner
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn state(&self) -> TaskState {
        self.inner.task.state()
    }

    pub fn progress(&self) -> u8 {
        self.inner.task.progress()
    }

    /// Returns the last progress reported by the client driving the maintenance, if any.
    pub fn client_progress(&self) -> Option<u8> {
        *self.inner.client_progress_tx.borrow()
    }

    /// Subscribes to client progress updates.
    pub fn subscribe_client_progress(&self) -> watch::Receiver<Option<u8>> {
        self.inner.client_progress_tx.subscribe()
    }

    pub fn cancel_requested(&self) -> bool {
        self.inner.task.is_cancel_requested()
    }

    /// Requests cooperative cancellation of the task.
    pub fn cancel(&self) {
        self.inner.task.cancel();
    }

    /// Returns the outcome once the task reached a terminal state.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.lock_terminal().outcome.clone()
    }

    /// Returns whether the maintenance slot was released.
    pub fn is_released(&self) -> bool {
        *self.inner.released_tx.borrow()
    }

    /// Registers `callback` to run once the task reached a terminal state.
    ///
    /// Runs `callback` right away when the task already finished.
    pub fn on_terminal<F>(&self, callback: F)
    where
        F: FnOnce(&TaskOutcome) + Send + 'static,
    {
        let mut terminal = self.lock_terminal();
        match terminal.outcome.clone() {
            Some(outcome) => {
                drop(terminal);
                callback(&outcome);
            }
            None => terminal.callbacks.push(Box::new(callback)),
        }
    }

    /// Waits until the task finished and its maintenance slot was released.
    pub async fn wait(&self) -> TaskOutcome {
        let mut released_rx = self.inner.released_tx.subscribe();
        // The sender lives as long as `self`, so waiting can only end with the flag set.
        let _ = released_rx.wait_for(|released| *released).await;

        self.outcome().unwrap_or_else(|| TaskOutcome {
            state: self.state(),
            progress: self.progress(),
            error: None,
        })
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            task_id: self.task_id(),
            kind: self.kind(),
            owner: self.owner().clone(),
            state: self.state(),
            progress: self.progress(),
            client_progress: self.client_progress(),
            cancel_requested: self.cancel_requested(),
            started_at: self.started_at(),
        }
    }

    pub(crate) fn set_client_progress(&self, percent: u8) {
        self.inner
            .client_progress_tx
            .send_replace(Some(percent.min(100)));
    }

    /// Records the outcome and fires the callbacks. Later calls have no effect.
    ///
    /// A panicking callback is logged and does not prevent the remaining ones from running.
    pub(crate) fn complete(&self, outcome: TaskOutcome) -> bool {
        let callbacks = {
            let mut terminal = self.lock_terminal();
            if terminal.outcome.is_some() {
                return false;
            }
            terminal.outcome = Some(outcome.clone());
            std::mem::take(&mut terminal.callbacks)
        };

        for callback in callbacks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(&outcome))) {
                error!(
                    task_id = %self.task_id(),
                    kind = %self.kind(),
                    panic = panic_message(payload.as_ref()),
                    "terminal callback panicked"
                );
            }
        }

        true
    }

    pub(crate) fn mark_released(&self) {
        self.inner.released_tx.send_replace(true);
    }

    fn lock_terminal(&self) -> MutexGuard<'_, Terminal> {
        self.inner
            .terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

impl fmt::Debug for TaskMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskMonitor")
            .field("task_id", &self.task_id())
            .field("kind", &self.inner.kind)
            .field("owner", &self.inner.owner)
            .field("state", &self.state())
            .field("progress", &self.progress())
            .finish()
    }
}

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::bail;
use crate::engine::phase::{Phase, StepEntry, run_entries};
use crate::engine::progress::ProgressNode;
use crate::engine::step::StepContext;
use crate::error::{ErrorKind, StewardError, StewardResult};

/// Unique identifier of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a [`Task`].
///
/// `Pending` moves to `Running`, which moves to exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Canceled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Canceled => "canceled",
        };

        f.write_str(state)
    }
}

/// Final result of a [`Task`] run.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub state: TaskState,
    pub progress: u8,
    pub error: Option<StewardError>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.state == TaskState::Succeeded
    }
}

#[derive(Debug)]
struct TaskShared {
    id: TaskId,
    name: Cow<'static, str>,
    cancel: CancellationToken,
    progress: ProgressNode,
    state_tx: watch::Sender<TaskState>,
}

/// An ordered list of weighted phases executed as one unit.
///
/// Running consumes the task, so a terminal state can never be left. Observers use a
/// [`TaskHandle`].
#[derive(Debug)]
pub struct Task {
    shared: Arc<TaskShared>,
    entries: Vec<StepEntry>,
}

impl Task {
    pub fn builder(name: impl Into<Cow<'static, str>>) -> TaskBuilder {
        TaskBuilder {
            name: name.into(),
            phases: Vec::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns a handle observing and controlling this task.
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            shared: self.shared.clone(),
        }
    }

    /// Runs every phase and returns the outcome.
    ///
    /// A task canceled before it started runs its always-run steps only and ends canceled.
    pub async fn run(self) -> TaskOutcome {
        let shared = &self.shared;
        shared.state_tx.send_replace(TaskState::Running);
        info!(task_id = %shared.id, task = %shared.name, "task started");

        let ctx = StepContext::new(shared.id, shared.cancel.clone(), shared.progress.clone());
        let result = run_entries(&self.entries, &ctx).await;

        let outcome = match result {
            Ok(()) => {
                info!(task_id = %shared.id, task = %shared.name, "task succeeded");
                TaskOutcome {
                    state: TaskState::Succeeded,
                    progress: shared.progress.percent(),
                    error: None,
                }
            }
            Err(err) if err.kind() == ErrorKind::OperationCanceled => {
                info!(task_id = %shared.id, task = %shared.name, "task canceled");
                TaskOutcome {
                    state: TaskState::Canceled,
                    progress: shared.progress.percent(),
                    error: Some(err),
                }
            }
            Err(err) => {
                error!(task_id = %shared.id, task = %shared.name, error = %err, "task failed");
                TaskOutcome {
                    state: TaskState::Failed,
                    progress: shared.progress.percent(),
                    error: Some(err),
                }
            }
        };

        shared.state_tx.send_replace(outcome.state);

        outcome
    }
}

/// Builds a [`Task`].
pub struct TaskBuilder {
    name: Cow<'static, str>,
    phases: Vec<(u32, Phase)>,
}

impl TaskBuilder {
    /// Appends a phase with the given weight.
    pub fn phase(mut self, weight: u32, phase: Phase) -> Self {
        self.phases.push((weight, phase));
        self
    }

    /// Builds the task.
    ///
    /// Fails when the task has no phases or when a phase has weight 0.
    pub fn build(self) -> StewardResult<Task> {
        if self.phases.is_empty() {
            bail!(
                ErrorKind::InvalidState,
                "A task needs at least one phase",
                format!("task `{}` is empty", self.name)
            );
        }

        let entries = self
            .phases
            .into_iter()
            .map(|(weight, phase)| StepEntry::new(weight, Box::new(phase)))
            .collect::<StewardResult<Vec<_>>>()?;
        let progress = ProgressNode::weighted(entries.iter().map(StepEntry::weighted_progress));
        let (state_tx, _) = watch::channel(TaskState::Pending);

        Ok(Task {
            shared: Arc::new(TaskShared {
                id: TaskId::new(),
                name: self.name,
                cancel: CancellationToken::new(),
                progress,
                state_tx,
            }),
            entries,
        })
    }
}

impl fmt::Debug for TaskBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskBuilder")
            .field("name", &self.name)
            .field("phases", &self.phases.len())
            .finish()
    }
}

/// Cloneable handle observing and controlling a [`Task`].
#[derive(Debug, Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> TaskState {
        *self.shared.state_tx.borrow()
    }

    /// Returns the aggregated progress of the task.
    pub fn progress(&self) -> u8 {
        self.shared.progress.percent()
    }

    /// Requests cancellation.
    ///
    /// Running steps observe the request at their next safe point. Has no effect on a task
    /// that already finished.
    pub fn cancel(&self) {
        if !self.state().is_terminal() {
            info!(task_id = %self.shared.id, task = %self.shared.name, "task cancellation requested");
        }
        self.shared.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.shared.state_tx.subscribe()
    }

    /// Waits until the task reached a terminal state and returns it.
    pub async fn wait(&self) -> TaskState {
        let mut state_rx = self.subscribe();
        match state_rx.wait_for(TaskState::is_terminal).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Forces a terminal state on a task whose run was aborted.
    pub(crate) fn force_terminal(&self, state: TaskState) {
        self.shared.state_tx.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = state;
            true
        });
    }
}

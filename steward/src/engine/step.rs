use std::borrow::Cow;
use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bail;
use crate::engine::progress::ProgressNode;
use crate::engine::task::TaskId;
use crate::error::{ErrorKind, StewardResult};

/// A unit of work executed by a [`crate::engine::Phase`].
///
/// Cancellation and progress reporting go through the [`StepContext`] handed to
/// [`Step::run`]: cancelling the owning task cancels the context, and long-running steps are
/// expected to poll [`StepContext::check_canceled`] at their safe points.
#[async_trait]
pub trait Step: Send + Sync {
    /// Returns the name used in logs and error details.
    fn name(&self) -> Cow<'static, str>;

    /// Returns whether the step runs even after an earlier failure or a cancellation.
    ///
    /// Always-run steps are cleanup steps. They receive a context whose cancellation token is
    /// not triggered.
    fn always_run(&self) -> bool {
        false
    }

    /// Returns the progress node of a composite step.
    ///
    /// The engine otherwise allocates a leaf for the step.
    fn composite_progress(&self) -> Option<ProgressNode> {
        None
    }

    /// Executes the step.
    async fn run(&self, ctx: &StepContext) -> StewardResult<()>;
}

/// Execution context handed to a running [`Step`].
#[derive(Debug, Clone)]
pub struct StepContext {
    task_id: TaskId,
    cancel: CancellationToken,
    progress: ProgressNode,
}

impl StepContext {
    pub(crate) fn new(task_id: TaskId, cancel: CancellationToken, progress: ProgressNode) -> Self {
        Self {
            task_id,
            cancel,
            progress,
        }
    }

    /// Returns the id of the task this step belongs to.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Returns whether cancellation was requested.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails with [`ErrorKind::OperationCanceled`] once cancellation was requested.
    pub fn check_canceled(&self) -> StewardResult<()> {
        if self.is_canceled() {
            bail!(
                ErrorKind::OperationCanceled,
                "The task was canceled",
                format!("task {}", self.task_id)
            );
        }

        Ok(())
    }

    /// Returns the token triggered when cancellation is requested.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Reports the progress of the step.
    ///
    /// Values lower than the last reported one are ignored and values above 100 are clamped.
    pub fn report_progress(&self, percent: u8) {
        self.progress.advance(percent);
    }

    /// Returns the progress of the step.
    pub fn progress(&self) -> u8 {
        self.progress.percent()
    }

    /// Derives the context of a child step.
    pub(crate) fn child(&self, progress: ProgressNode) -> Self {
        Self {
            task_id: self.task_id,
            cancel: self.cancel.clone(),
            progress,
        }
    }

    /// Derives the context of a cleanup step, which is not affected by the cancellation.
    pub(crate) fn detached(&self, progress: ProgressNode) -> Self {
        Self {
            task_id: self.task_id,
            cancel: CancellationToken::new(),
            progress,
        }
    }
}

/// A [`Step`] backed by an async closure.
pub struct FnStep<F> {
    name: Cow<'static, str>,
    always_run: bool,
    f: F,
}

impl<F> FnStep<F> {
    /// Marks the step as always-run.
    pub fn with_always_run(mut self) -> Self {
        self.always_run = true;
        self
    }
}

impl<F> fmt::Debug for FnStep<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep")
            .field("name", &self.name)
            .field("always_run", &self.always_run)
            .finish_non_exhaustive()
    }
}

/// Creates a step named `name` running `f`.
pub fn step_fn<F, Fut>(name: impl Into<Cow<'static, str>>, f: F) -> FnStep<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = StewardResult<()>> + Send,
{
    FnStep {
        name: name.into(),
        always_run: false,
        f,
    }
}

#[async_trait]
impl<F, Fut> Step for FnStep<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = StewardResult<()>> + Send,
{
    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn always_run(&self) -> bool {
        self.always_run
    }

    async fn run(&self, ctx: &StepContext) -> StewardResult<()> {
        (self.f)(ctx.clone()).await
    }
}

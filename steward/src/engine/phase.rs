use std::borrow::Cow;
use std::fmt;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bail;
use crate::engine::progress::ProgressNode;
use crate::engine::step::{Step, StepContext};
use crate::error::{ErrorKind, StewardError, StewardResult};
use crate::steward_error;

/// A step scheduled inside a phase or a task, together with its weight and progress node.
pub(crate) struct StepEntry {
    weight: u32,
    step: Box<dyn Step>,
    progress: ProgressNode,
}

impl StepEntry {
    pub(crate) fn new(weight: u32, step: Box<dyn Step>) -> StewardResult<Self> {
        if weight == 0 {
            bail!(
                ErrorKind::InvalidState,
                "Step weights must be positive",
                format!("step `{}` has weight 0", step.name())
            );
        }

        let progress = step.composite_progress().unwrap_or_else(ProgressNode::leaf);

        Ok(Self {
            weight,
            step,
            progress,
        })
    }

    pub(crate) fn weighted_progress(&self) -> (u32, ProgressNode) {
        (self.weight, self.progress.clone())
    }
}

impl fmt::Debug for StepEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepEntry")
            .field("name", &self.step.name())
            .field("weight", &self.weight)
            .field("always_run", &self.step.always_run())
            .finish()
    }
}

/// An ordered, weighted group of steps.
///
/// A phase is itself a [`Step`], so phases nest. Its progress is the weighted average of its
/// steps.
#[derive(Debug)]
pub struct Phase {
    name: Cow<'static, str>,
    always_run: bool,
    entries: Vec<StepEntry>,
    progress: ProgressNode,
}

impl Phase {
    pub fn builder(name: impl Into<Cow<'static, str>>) -> PhaseBuilder {
        PhaseBuilder {
            name: name.into(),
            always_run: false,
            steps: Vec::new(),
        }
    }

    /// Returns the sum of the weights of the phase steps.
    pub fn total_weight(&self) -> u32 {
        self.entries.iter().map(|entry| entry.weight).sum()
    }
}

#[async_trait]
impl Step for Phase {
    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn always_run(&self) -> bool {
        self.always_run
    }

    fn composite_progress(&self) -> Option<ProgressNode> {
        Some(self.progress.clone())
    }

    async fn run(&self, ctx: &StepContext) -> StewardResult<()> {
        debug!(task_id = %ctx.task_id(), phase = %self.name, "phase started");
        let result = run_entries(&self.entries, ctx).await;
        debug!(
            task_id = %ctx.task_id(),
            phase = %self.name,
            succeeded = result.is_ok(),
            "phase finished"
        );

        result
    }
}

/// Builds a [`Phase`].
pub struct PhaseBuilder {
    name: Cow<'static, str>,
    always_run: bool,
    steps: Vec<(u32, Box<dyn Step>)>,
}

impl PhaseBuilder {
    /// Appends a step with the given weight.
    pub fn step<S>(self, weight: u32, step: S) -> Self
    where
        S: Step + 'static,
    {
        self.boxed_step(weight, Box::new(step))
    }

    /// Appends an already boxed step.
    pub fn boxed_step(mut self, weight: u32, step: Box<dyn Step>) -> Self {
        self.steps.push((weight, step));
        self
    }

    /// Marks the phase as always-run.
    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    /// Builds the phase.
    ///
    /// Fails when the phase has no steps or when a step has weight 0.
    pub fn build(self) -> StewardResult<Phase> {
        if self.steps.is_empty() {
            bail!(
                ErrorKind::InvalidState,
                "A phase needs at least one step",
                format!("phase `{}` is empty", self.name)
            );
        }

        let entries = self
            .steps
            .into_iter()
            .map(|(weight, step)| StepEntry::new(weight, step))
            .collect::<StewardResult<Vec<_>>>()?;
        let progress = ProgressNode::weighted(entries.iter().map(StepEntry::weighted_progress));

        Ok(Phase {
            name: self.name,
            always_run: self.always_run,
            entries,
            progress,
        })
    }
}

impl fmt::Debug for PhaseBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseBuilder")
            .field("name", &self.name)
            .field("steps", &self.steps.len())
            .finish()
    }
}

/// Runs `entries` in order.
///
/// Once a step failed or cancellation was observed, only always-run steps execute, with a
/// detached context. The first error is the primary cause. Errors of cleanup steps are
/// aggregated behind it.
pub(crate) async fn run_entries(entries: &[StepEntry], ctx: &StepContext) -> StewardResult<()> {
    let mut failure: Option<StewardError> = None;
    let mut cleanup_errors = Vec::new();

    for entry in entries {
        let name = entry.step.name();

        if failure.is_none() && ctx.is_canceled() {
            failure = Some(steward_error!(
                ErrorKind::OperationCanceled,
                "The task was canceled",
                format!("canceled before step `{name}`")
            ));
        }

        let step_ctx = match failure {
            Some(_) if !entry.step.always_run() => {
                debug!(task_id = %ctx.task_id(), step = %name, "step skipped");
                continue;
            }
            Some(_) => ctx.detached(entry.progress.clone()),
            None => ctx.child(entry.progress.clone()),
        };

        debug!(task_id = %ctx.task_id(), step = %name, "step started");
        match entry.step.run(&step_ctx).await {
            Ok(()) => {
                entry.progress.complete();
                debug!(task_id = %ctx.task_id(), step = %name, "step finished");
            }
            Err(err) => {
                let err = step_failure(&name, err);
                warn!(task_id = %ctx.task_id(), step = %name, error = %err, "step failed");

                if failure.is_none() {
                    failure = Some(err);
                } else {
                    cleanup_errors.push(err);
                }
            }
        }
    }

    match failure {
        None => Ok(()),
        Some(primary) if cleanup_errors.is_empty() => Err(primary),
        Some(primary) => {
            let mut errors = vec![primary];
            errors.extend(cleanup_errors);

            Err(StewardError::from(errors))
        }
    }
}

/// Classifies the error of a failed step.
///
/// Drain timeouts and cancellations keep their kind. Every other error becomes a
/// [`ErrorKind::StepExecutionFailed`] naming the step.
fn step_failure(name: &str, err: StewardError) -> StewardError {
    match err.kind() {
        ErrorKind::DrainTimeout | ErrorKind::OperationCanceled | ErrorKind::StepExecutionFailed => {
            err
        }
        _ => steward_error!(
            ErrorKind::StepExecutionFailed,
            "A maintenance step failed",
            format!("step `{name}`: {}", err.description()),
            source: err
        ),
    }
}

//! Composable, cancellable, progress-reporting units of work.
//!
//! A [`task::Task`] runs weighted [`phase::Phase`]s in order, and a phase runs weighted
//! [`step::Step`]s in order. A phase is itself a step, so phases nest. Progress is computed
//! bottom-up as weighted averages, see [`progress::ProgressNode`].
//!
//! When a step fails or cancellation is observed, the remaining steps are skipped except the
//! ones marked always-run, which still execute with an uncanceled context. This is how
//! cleanup such as reopening a latch is guaranteed on every exit path.

pub mod phase;
pub mod progress;
pub mod step;
pub mod task;

pub use phase::{Phase, PhaseBuilder};
pub use progress::ProgressNode;
pub use step::{FnStep, Step, StepContext, step_fn};
pub use task::{Task, TaskBuilder, TaskHandle, TaskId, TaskOutcome, TaskState};

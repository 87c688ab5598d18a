use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::engine::{Phase, Step, StepContext, Task};
use crate::error::{ErrorKind, StewardResult};
use crate::steward_error;
use crate::test_utils::notify::TimedNotify;

/// What a [`ScriptedStep`] does when run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepScript {
    Succeed,
    Fail(ErrorKind),
    Panic,
    /// Waits until released through its [`StepProbe`] or until the task is canceled.
    Block,
}

/// A step whose behavior is fixed upfront and observed through a [`StepProbe`].
#[derive(Debug)]
pub struct ScriptedStep {
    name: Cow<'static, str>,
    script: StepScript,
    always_run: bool,
    probe: StepProbe,
}

impl ScriptedStep {
    pub fn new(name: impl Into<Cow<'static, str>>, script: StepScript) -> Self {
        Self {
            name: name.into(),
            script,
            always_run: false,
            probe: StepProbe::default(),
        }
    }

    pub fn succeed(name: impl Into<Cow<'static, str>>) -> Self {
        Self::new(name, StepScript::Succeed)
    }

    pub fn fail(name: impl Into<Cow<'static, str>>, kind: ErrorKind) -> Self {
        Self::new(name, StepScript::Fail(kind))
    }

    pub fn panic(name: impl Into<Cow<'static, str>>) -> Self {
        Self::new(name, StepScript::Panic)
    }

    pub fn block(name: impl Into<Cow<'static, str>>) -> Self {
        Self::new(name, StepScript::Block)
    }

    /// Marks the step as always-run.
    pub fn cleanup(mut self) -> Self {
        self.always_run = true;
        self
    }

    /// Returns the probe observing this step.
    pub fn probe(&self) -> StepProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl Step for ScriptedStep {
    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn always_run(&self) -> bool {
        self.always_run
    }

    async fn run(&self, ctx: &StepContext) -> StewardResult<()> {
        self.probe.runs.fetch_add(1, Ordering::SeqCst);
        self.probe.started.notify_one();

        match self.script {
            StepScript::Succeed => Ok(()),
            StepScript::Fail(kind) => Err(steward_error!(
                kind,
                "Scripted step failure",
                format!("step `{}`", self.name)
            )),
            StepScript::Panic => panic!("scripted panic in step `{}`", self.name),
            StepScript::Block => {
                ctx.report_progress(10);
                tokio::select! {
                    _ = self.probe.release.notified() => Ok(()),
                    _ = ctx.cancellation().cancelled() => {
                        self.probe.observed_cancel.store(true, Ordering::SeqCst);
                        ctx.check_canceled()
                    }
                }
            }
        }
    }
}

/// Observes and drives a [`ScriptedStep`] from a test.
#[derive(Debug, Clone, Default)]
pub struct StepProbe {
    started: Arc<Notify>,
    release: Arc<Notify>,
    runs: Arc<AtomicUsize>,
    observed_cancel: Arc<AtomicBool>,
}

impl StepProbe {
    /// Waits until the step started running.
    pub async fn started(&self) {
        TimedNotify::new(self.started.clone()).notified().await;
    }

    /// Lets a blocking step finish successfully.
    pub fn release(&self) {
        self.release.notify_one();
    }

    /// Returns how many times the step ran.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Returns whether a blocking step stopped because of a cancellation.
    pub fn observed_cancel(&self) -> bool {
        self.observed_cancel.load(Ordering::SeqCst)
    }
}

/// Builds a task made of a single phase running `steps` with weight 1 each.
pub fn single_phase_task(name: &'static str, steps: Vec<ScriptedStep>) -> Task {
    let phase = steps
        .into_iter()
        .fold(Phase::builder(name), |builder, step| builder.step(1, step))
        .build()
        .expect("scripted phase must be valid");

    Task::builder(name)
        .phase(1, phase)
        .build()
        .expect("scripted task must be valid")
}

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backup::archive::{ArchiveFormat, ArchiveReader, ArchiveWriter};
use crate::backup::feature::{BackupFeature, ExportSink, FeatureExporter, ImportSource};
use crate::backup::naming::BackupName;
use crate::backup::repository::BackupRepository;
use crate::bail;
use crate::engine::{Step, StepContext};
use crate::error::{ErrorKind, StewardResult};
use crate::latch::{DrainCoordinator, LatchToken, ResourceLatch};

/// Name of the archive entry describing the archive itself.
pub const MANIFEST_ENTRY: &str = "manifest.json";

/// Describes what an archive contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub features: Vec<BackupFeature>,
}

/// Hands the latch token from [`LatchAndDrain`] to [`Unlatch`].
#[derive(Debug, Clone, Default)]
pub struct LatchHold {
    token: Arc<StdMutex<Option<LatchToken>>>,
}

impl LatchHold {
    fn put(&self, token: LatchToken) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    fn take(&self) -> Option<LatchToken> {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Closes the datastore latch and waits for in-flight operations to drain.
#[derive(Debug)]
pub struct LatchAndDrain {
    latch: ResourceLatch,
    drain: DrainCoordinator,
    timeout: Duration,
    hold: LatchHold,
}

impl LatchAndDrain {
    pub fn new(latch: ResourceLatch, timeout: Duration, hold: LatchHold) -> Self {
        Self {
            latch,
            drain: DrainCoordinator::new(),
            timeout,
            hold,
        }
    }
}

#[async_trait]
impl Step for LatchAndDrain {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("latch-and-drain")
    }

    async fn run(&self, ctx: &StepContext) -> StewardResult<()> {
        ctx.check_canceled()?;

        let token = self.latch.close()?;
        self.hold.put(token);
        ctx.report_progress(10);

        tokio::select! {
            quiesced = self.drain.quiesce(&self.latch, self.timeout) => {
                quiesced?;
            }
            _ = ctx.cancellation().cancelled() => {
                return ctx.check_canceled();
            }
        }

        Ok(())
    }
}

/// Reopens the datastore latch. Always runs.
#[derive(Debug)]
pub struct Unlatch {
    hold: LatchHold,
}

impl Unlatch {
    pub fn new(hold: LatchHold) -> Self {
        Self { hold }
    }
}

#[async_trait]
impl Step for Unlatch {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("unlatch")
    }

    fn always_run(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &StepContext) -> StewardResult<()> {
        match self.hold.take() {
            Some(token) => token.release(),
            None => debug!(task_id = %ctx.task_id(), "latch was not held, nothing to reopen"),
        }

        Ok(())
    }
}

/// Archive being written by a backup.
pub(crate) struct PendingArchive {
    name: BackupName,
    partial: PathBuf,
    target: PathBuf,
}

/// State shared by the steps of one backup task.
#[derive(Clone)]
pub struct ArchiveSession {
    writer: Arc<Mutex<Option<Box<dyn ArchiveWriter>>>>,
    pending: Arc<StdMutex<Option<PendingArchive>>>,
}

impl ArchiveSession {
    pub fn new() -> Self {
        Self {
            writer: Arc::new(Mutex::new(None)),
            pending: Arc::new(StdMutex::new(None)),
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Option<PendingArchive>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ArchiveSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ArchiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self
            .pending()
            .as_ref()
            .map(|pending| pending.name.to_string());

        f.debug_struct("ArchiveSession")
            .field("pending", &pending)
            .finish()
    }
}

/// Creates the archive under its partial name.
pub struct OpenArchive {
    repository: BackupRepository,
    identifier: String,
    format: Arc<dyn ArchiveFormat>,
    session: ArchiveSession,
}

impl OpenArchive {
    pub fn new(
        repository: BackupRepository,
        identifier: String,
        format: Arc<dyn ArchiveFormat>,
        session: ArchiveSession,
    ) -> Self {
        Self {
            repository,
            identifier,
            format,
            session,
        }
    }
}

#[async_trait]
impl Step for OpenArchive {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("open-archive")
    }

    async fn run(&self, ctx: &StepContext) -> StewardResult<()> {
        ctx.check_canceled()?;

        let name = BackupName::new(&self.identifier, Utc::now())?;
        let partial = self.repository.partial_path_of(&name);
        let target = self.repository.path_of(&name);

        tokio::fs::create_dir_all(self.repository.directory()).await?;
        if tokio::fs::try_exists(&target).await? {
            bail!(
                ErrorKind::InvalidState,
                "A backup with the same name already exists",
                format!("name `{name}`")
            );
        }

        let writer = self.format.create(&partial).await?;
        *self.session.writer.lock().await = Some(writer);
        info!(task_id = %ctx.task_id(), backup = %name, "backup archive opened");
        *self.session.pending() = Some(PendingArchive {
            name,
            partial,
            target,
        });

        Ok(())
    }
}

/// Exports one feature group into the archive.
pub struct ExportGroup {
    group: String,
    features: Vec<BackupFeature>,
    exporter: Arc<dyn FeatureExporter>,
    session: ArchiveSession,
}

impl ExportGroup {
    pub fn new(
        group: String,
        features: Vec<BackupFeature>,
        exporter: Arc<dyn FeatureExporter>,
        session: ArchiveSession,
    ) -> Self {
        Self {
            group,
            features,
            exporter,
            session,
        }
    }
}

#[async_trait]
impl Step for ExportGroup {
    fn name(&self) -> Cow<'static, str> {
        Cow::Owned(format!("export-{}", self.group))
    }

    async fn run(&self, ctx: &StepContext) -> StewardResult<()> {
        ctx.check_canceled()?;

        let sink = ExportSink::new(self.group.clone(), self.session.writer.clone());
        self.exporter.export(&self.features, &sink, ctx).await?;
        debug!(task_id = %ctx.task_id(), group = %self.group, "feature group exported");

        Ok(())
    }
}

/// Finalizes the archive and moves it to its committed name.
pub struct CommitArchive {
    features: Vec<BackupFeature>,
    session: ArchiveSession,
}

impl CommitArchive {
    pub fn new(features: Vec<BackupFeature>, session: ArchiveSession) -> Self {
        Self { features, session }
    }
}

#[async_trait]
impl Step for CommitArchive {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("commit-archive")
    }

    async fn run(&self, ctx: &StepContext) -> StewardResult<()> {
        ctx.check_canceled()?;

        let Some(writer) = self.session.writer.lock().await.take() else {
            bail!(ErrorKind::InvalidState, "No archive is open for commit");
        };
        let Some(pending) = self.session.pending().take() else {
            bail!(ErrorKind::InvalidState, "No archive is open for commit");
        };

        let manifest = Manifest {
            name: pending.name.to_string(),
            created_at: pending.name.timestamp(),
            features: self.features.clone(),
        };

        let mut writer = writer;
        let committed = async {
            writer
                .write_entry(MANIFEST_ENTRY, &serde_json::to_vec(&manifest)?)
                .await?;
            writer.finish().await?;
            tokio::fs::rename(&pending.partial, &pending.target).await?;

            StewardResult::Ok(())
        }
        .await;

        if let Err(err) = committed {
            remove_partial(&pending.partial).await;
            return Err(err);
        }

        info!(task_id = %ctx.task_id(), backup = %pending.name, "backup archive committed");

        Ok(())
    }
}

/// Deletes an archive that was opened but never committed. Always runs.
pub struct DiscardArchive {
    session: ArchiveSession,
}

impl DiscardArchive {
    pub fn new(session: ArchiveSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Step for DiscardArchive {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("discard-archive")
    }

    fn always_run(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &StepContext) -> StewardResult<()> {
        drop(self.session.writer.lock().await.take());
        let pending = self.session.pending().take();

        if let Some(pending) = pending {
            warn!(task_id = %ctx.task_id(), backup = %pending.name, "discarding uncommitted backup archive");
            remove_partial(&pending.partial).await;
        }

        Ok(())
    }
}

/// Deletes the oldest backups beyond the retention limit.
pub struct ApplyRetention {
    repository: BackupRepository,
    max_retained: usize,
}

impl ApplyRetention {
    pub fn new(repository: BackupRepository, max_retained: usize) -> Self {
        Self {
            repository,
            max_retained,
        }
    }
}

#[async_trait]
impl Step for ApplyRetention {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("apply-retention")
    }

    async fn run(&self, _ctx: &StepContext) -> StewardResult<()> {
        self.repository.apply_retention(self.max_retained).await?;

        Ok(())
    }
}

/// Imports one feature group from the archive being restored.
pub struct ImportGroup {
    group: String,
    features: Vec<BackupFeature>,
    exporter: Arc<dyn FeatureExporter>,
    archive: Arc<dyn ArchiveReader>,
}

impl ImportGroup {
    pub fn new(
        group: String,
        features: Vec<BackupFeature>,
        exporter: Arc<dyn FeatureExporter>,
        archive: Arc<dyn ArchiveReader>,
    ) -> Self {
        Self {
            group,
            features,
            exporter,
            archive,
        }
    }
}

#[async_trait]
impl Step for ImportGroup {
    fn name(&self) -> Cow<'static, str> {
        Cow::Owned(format!("import-{}", self.group))
    }

    async fn run(&self, ctx: &StepContext) -> StewardResult<()> {
        ctx.check_canceled()?;

        let source = ImportSource::new(self.group.clone(), self.archive.clone());
        self.exporter.import(&self.features, &source, ctx).await?;
        debug!(task_id = %ctx.task_id(), group = %self.group, "feature group imported");

        Ok(())
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove partial archive"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::{Phase, Task, TaskState};
    use crate::latch::LatchState;
    use crate::test_utils::steps::ScriptedStep;

    fn latch() -> ResourceLatch {
        ResourceLatch::new("datastore", Duration::from_secs(5))
    }

    fn latched_task(latch: &ResourceLatch, work: ScriptedStep) -> Task {
        let hold = LatchHold::default();
        let phase = Phase::builder("backup")
            .step(1, LatchAndDrain::new(latch.clone(), Duration::from_secs(1), hold.clone()))
            .step(3, work)
            .step(1, Unlatch::new(hold))
            .build()
            .unwrap();

        Task::builder("backup").phase(1, phase).build().unwrap()
    }

    #[tokio::test]
    async fn work_failure_still_reopens_latch() {
        let latch = latch();
        let task = latched_task(&latch, ScriptedStep::fail("export", ErrorKind::IoError));

        let outcome = task.run().await;
        assert_eq!(outcome.state, TaskState::Failed);
        assert_eq!(latch.state(), LatchState::Open);
    }

    #[tokio::test]
    async fn latch_is_closed_while_work_runs() {
        let latch = latch();
        let work = ScriptedStep::block("export");
        let probe = work.probe();
        let task = latched_task(&latch, work);
        let running = tokio::spawn(task.run());

        probe.started().await;
        assert_eq!(latch.state(), LatchState::Closed);

        probe.release();
        assert!(running.await.unwrap().is_success());
        assert_eq!(latch.state(), LatchState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_fails_task_and_reopens_latch() {
        let latch = latch();
        let _stuck = latch.enter(None).await.unwrap();
        let work = ScriptedStep::succeed("export");
        let probe = work.probe();

        let outcome = latched_task(&latch, work).run().await;
        assert_eq!(outcome.state, TaskState::Failed);
        assert_eq!(
            outcome.error.map(|err| err.kind()),
            Some(ErrorKind::DrainTimeout)
        );
        assert_eq!(probe.runs(), 0);
        assert_eq!(latch.state(), LatchState::Open);
    }

    #[tokio::test]
    async fn discard_removes_uncommitted_archive() {
        let dir = tempfile::tempdir().unwrap();
        let repository = BackupRepository::new(dir.path());
        let session = ArchiveSession::new();

        let phase = Phase::builder("archive")
            .step(
                1,
                OpenArchive::new(
                    repository.clone(),
                    "steward".to_owned(),
                    Arc::new(crate::backup::archive::JsonLinesFormat),
                    session.clone(),
                ),
            )
            .step(1, ScriptedStep::fail("export", ErrorKind::IoError))
            .step(1, CommitArchive::new(Vec::new(), session.clone()))
            .step(1, DiscardArchive::new(session))
            .build()
            .unwrap();
        let outcome = Task::builder("backup").phase(1, phase).build().unwrap().run().await;

        assert_eq!(outcome.state, TaskState::Failed);
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}

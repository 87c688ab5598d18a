use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use steward_config::shared::{BackupConfig, MaintenanceConfig};
use tracing::{info, warn};

use crate::backup::archive::{ArchiveFormat, ArchiveReader, JsonLinesFormat};
use crate::backup::feature::{FeatureExporter, FeatureRegistry};
use crate::backup::repository::BackupRepository;
use crate::backup::steps::{
    ApplyRetention, ArchiveSession, CommitArchive, DiscardArchive, ExportGroup, ImportGroup,
    LatchAndDrain, LatchHold, MANIFEST_ENTRY, Manifest, OpenArchive, Unlatch,
};
use crate::bail;
use crate::engine::{Phase, Task};
use crate::error::{ErrorKind, StewardResult};
use crate::latch::ResourceLatch;
use crate::steward_error;

/// Weight of the phase doing the actual export or import work, relative to archive handling.
const WORK_PHASE_WEIGHT: u32 = 8;

/// Builds backup and restore tasks over a latched datastore.
pub struct BackupOrchestrator {
    identifier: String,
    max_retained: Option<usize>,
    drain_timeout: Duration,
    latch: ResourceLatch,
    registry: FeatureRegistry,
    exporters: HashMap<String, Arc<dyn FeatureExporter>>,
    format: Arc<dyn ArchiveFormat>,
    repository: BackupRepository,
}

impl BackupOrchestrator {
    pub fn new(
        backup: &BackupConfig,
        maintenance: &MaintenanceConfig,
        latch: ResourceLatch,
        registry: FeatureRegistry,
    ) -> Self {
        Self {
            identifier: backup.identifier.clone(),
            max_retained: backup.max_retained,
            drain_timeout: maintenance.drain_timeout(),
            latch,
            registry,
            exporters: HashMap::new(),
            format: Arc::new(JsonLinesFormat),
            repository: BackupRepository::new(backup.directory.clone()),
        }
    }

    /// Registers the exporter handling feature group `group`.
    pub fn with_exporter<E>(mut self, group: impl Into<String>, exporter: E) -> Self
    where
        E: FeatureExporter,
    {
        self.exporters.insert(group.into(), Arc::new(exporter));
        self
    }

    /// Replaces the archive format.
    pub fn with_format<F>(mut self, format: F) -> Self
    where
        F: ArchiveFormat,
    {
        self.format = Arc::new(format);
        self
    }

    pub fn repository(&self) -> &BackupRepository {
        &self.repository
    }

    pub fn latch(&self) -> &ResourceLatch {
        &self.latch
    }

    pub fn registry(&self) -> &FeatureRegistry {
        &self.registry
    }

    /// Builds the backup task.
    ///
    /// The datastore is latched and drained, every backup-capable feature group with a
    /// registered exporter is exported, then the latch is reopened before the archive is
    /// committed. Unlatching and discarding an uncommitted archive run on every exit path.
    pub fn backup_task(&self) -> StewardResult<Task> {
        let hold = LatchHold::default();
        let session = ArchiveSession::new();

        let mut backup = Phase::builder("backup").step(
            1,
            LatchAndDrain::new(self.latch.clone(), self.drain_timeout, hold.clone()),
        );
        let mut exported = Vec::new();
        for (group, features) in self.registry.backup_groups() {
            let Some(exporter) = self.exporters.get(&group) else {
                warn!(%group, "no exporter registered for feature group, skipping it");
                continue;
            };

            let weight = exporter.weight();
            exported.extend(features.iter().cloned());
            backup = backup.step(
                weight,
                ExportGroup::new(group, features, exporter.clone(), session.clone()),
            );
        }
        let backup = backup.step(1, Unlatch::new(hold)).build()?;

        let mut maintenance = Phase::builder("maintenance-mode")
            .step(
                1,
                OpenArchive::new(
                    self.repository.clone(),
                    self.identifier.clone(),
                    self.format.clone(),
                    session.clone(),
                ),
            )
            .step(WORK_PHASE_WEIGHT, backup)
            .step(1, CommitArchive::new(exported, session.clone()))
            .step(1, DiscardArchive::new(session));
        if let Some(max_retained) = self.max_retained {
            maintenance = maintenance.step(
                1,
                ApplyRetention::new(self.repository.clone(), max_retained),
            );
        }

        Task::builder("backup").phase(1, maintenance.build()?).build()
    }

    /// Builds the task restoring backup `name`.
    ///
    /// The archive is loaded and checked before the task is built, so an unknown or corrupt
    /// backup never latches the datastore.
    pub async fn restore_task(&self, name: &str) -> StewardResult<Task> {
        let name = self.repository.validate_name(name)?;
        if self.repository.find_by_name(name.as_str()).await?.is_none() {
            bail!(
                ErrorKind::BackupNotFound,
                "The backup does not exist",
                format!("name `{name}`")
            );
        }

        let archive: Arc<dyn ArchiveReader> =
            Arc::from(self.format.open(&self.repository.path_of(&name)).await?);
        let manifest: Manifest = match archive.read_entry(MANIFEST_ENTRY) {
            Some(manifest) => serde_json::from_slice(manifest).map_err(|err| {
                steward_error!(
                    ErrorKind::InvalidArchive,
                    "The backup manifest is malformed",
                    format!("backup `{name}`"),
                    source: err
                )
            })?,
            None => bail!(
                ErrorKind::InvalidArchive,
                "The backup has no manifest",
                format!("backup `{name}`")
            ),
        };
        if manifest.name != name.as_str() {
            bail!(
                ErrorKind::InvalidArchive,
                "The backup manifest belongs to another backup",
                format!("backup `{name}` holds the manifest of `{}`", manifest.name)
            );
        }

        let archived_groups: HashSet<&str> = manifest
            .features
            .iter()
            .map(|feature| feature.group.as_str())
            .collect();
        let hold = LatchHold::default();

        let mut restore = Phase::builder("restore").step(
            1,
            LatchAndDrain::new(self.latch.clone(), self.drain_timeout, hold.clone()),
        );
        for (group, features) in self.registry.restore_groups() {
            if !archived_groups.contains(group.as_str()) {
                warn!(backup = %name, %group, "backup holds no data for feature group");
                continue;
            }
            let Some(exporter) = self.exporters.get(&group) else {
                warn!(%group, "no exporter registered for feature group, skipping it");
                continue;
            };

            let weight = exporter.weight();
            restore = restore.step(
                weight,
                ImportGroup::new(group, features, exporter.clone(), archive.clone()),
            );
        }
        let restore = restore.step(1, Unlatch::new(hold)).build()?;

        info!(backup = %name, created_at = %manifest.created_at, "restore prepared");
        let maintenance = Phase::builder("maintenance-mode")
            .step(WORK_PHASE_WEIGHT, restore)
            .build()?;

        Task::builder("restore").phase(1, maintenance).build()
    }
}

impl fmt::Debug for BackupOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut groups: Vec<&String> = self.exporters.keys().collect();
        groups.sort();

        f.debug_struct("BackupOrchestrator")
            .field("identifier", &self.identifier)
            .field("max_retained", &self.max_retained)
            .field("exporters", &groups)
            .field("repository", &self.repository)
            .finish()
    }
}

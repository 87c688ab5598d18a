use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::backup::archive::{ArchiveReader, ArchiveWriter};
use crate::bail;
use crate::engine::StepContext;
use crate::error::{ErrorKind, StewardResult};

/// Directions a feature supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureMode {
    Backup,
    Restore,
    Both,
}

impl FeatureMode {
    pub fn supports_backup(&self) -> bool {
        matches!(self, FeatureMode::Backup | FeatureMode::Both)
    }

    pub fn supports_restore(&self) -> bool {
        matches!(self, FeatureMode::Restore | FeatureMode::Both)
    }
}

/// Declares that a component can back up and/or restore a piece of data.
///
/// Features sharing a group are exported together by the group's [`FeatureExporter`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupFeature {
    pub group: String,
    pub name: String,
    pub mode: FeatureMode,
}

impl BackupFeature {
    pub fn new(group: impl Into<String>, name: impl Into<String>, mode: FeatureMode) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            mode,
        }
    }
}

/// Contributes features discovered at runtime, typically by pluggable components.
pub trait FeatureProvider: Send + Sync {
    fn features(&self) -> Vec<BackupFeature>;
}

/// Immutable set of the features known to a node.
#[derive(Debug, Clone, Default)]
pub struct FeatureRegistry {
    features: Vec<BackupFeature>,
}

impl FeatureRegistry {
    /// Builds the registry from a static list followed by the features of every provider.
    ///
    /// Duplicates keep their first declaration. Features with an empty group or name are
    /// rejected.
    pub fn build(
        static_features: Vec<BackupFeature>,
        providers: &[Arc<dyn FeatureProvider>],
    ) -> StewardResult<Self> {
        let mut seen = HashSet::new();
        let mut features = Vec::new();

        let discovered = providers.iter().flat_map(|provider| provider.features());
        for feature in static_features.into_iter().chain(discovered) {
            if feature.group.is_empty() || feature.name.is_empty() {
                bail!(
                    ErrorKind::InvalidState,
                    "Backup features need a group and a name",
                    format!("got group `{}` and name `{}`", feature.group, feature.name)
                );
            }

            if seen.insert((feature.group.clone(), feature.name.clone())) {
                features.push(feature);
            }
        }

        Ok(Self { features })
    }

    pub fn features(&self) -> &[BackupFeature] {
        &self.features
    }

    /// Returns the backup-capable features grouped by group, in declaration order.
    pub fn backup_groups(&self) -> Vec<(String, Vec<BackupFeature>)> {
        self.groups(FeatureMode::supports_backup)
    }

    /// Returns the restore-capable features grouped by group, in declaration order.
    pub fn restore_groups(&self) -> Vec<(String, Vec<BackupFeature>)> {
        self.groups(FeatureMode::supports_restore)
    }

    fn groups(&self, supports: fn(&FeatureMode) -> bool) -> Vec<(String, Vec<BackupFeature>)> {
        let mut groups: Vec<(String, Vec<BackupFeature>)> = Vec::new();

        for feature in self.features.iter().filter(|feature| supports(&feature.mode)) {
            match groups.iter_mut().find(|(group, _)| *group == feature.group) {
                Some((_, members)) => members.push(feature.clone()),
                None => groups.push((feature.group.clone(), vec![feature.clone()])),
            }
        }

        groups
    }
}

/// Exports and imports the features of one group.
#[async_trait]
pub trait FeatureExporter: Send + Sync + 'static {
    /// Relative cost of the group, used as the weight of its step.
    fn weight(&self) -> u32 {
        1
    }

    /// Writes the data of `features` to `sink`.
    async fn export(
        &self,
        features: &[BackupFeature],
        sink: &ExportSink,
        ctx: &StepContext,
    ) -> StewardResult<()>;

    /// Restores the data of `features` from `source`.
    async fn import(
        &self,
        features: &[BackupFeature],
        source: &ImportSource,
        ctx: &StepContext,
    ) -> StewardResult<()>;
}

/// Writes the entries of one feature group into the archive being built.
///
/// Entry names are scoped by the group, so groups never overwrite each other.
pub struct ExportSink {
    group: String,
    writer: Arc<Mutex<Option<Box<dyn ArchiveWriter>>>>,
}

impl ExportSink {
    pub(crate) fn new(group: String, writer: Arc<Mutex<Option<Box<dyn ArchiveWriter>>>>) -> Self {
        Self { group, writer }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Appends entry `name` with `payload` to the archive.
    pub async fn write(&self, name: &str, payload: &[u8]) -> StewardResult<()> {
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            bail!(
                ErrorKind::InvalidState,
                "No archive is open for writing",
                format!("group `{}` tried to write entry `{name}`", self.group)
            );
        };

        writer
            .write_entry(&scoped_entry(&self.group, name), payload)
            .await
    }
}

impl fmt::Debug for ExportSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportSink")
            .field("group", &self.group)
            .finish()
    }
}

/// Reads the entries of one feature group from an archive being restored.
pub struct ImportSource {
    group: String,
    reader: Arc<dyn ArchiveReader>,
}

impl ImportSource {
    pub(crate) fn new(group: String, reader: Arc<dyn ArchiveReader>) -> Self {
        Self { group, reader }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Returns the entries written by this group, without the group scope.
    pub fn entry_names(&self) -> Vec<String> {
        let prefix = format!("{}/", self.group);
        self.reader
            .entry_names()
            .into_iter()
            .filter_map(|name| name.strip_prefix(&prefix).map(str::to_owned))
            .collect()
    }

    /// Returns the payload of entry `name` of this group.
    pub fn read(&self, name: &str) -> Option<&[u8]> {
        self.reader.read_entry(&scoped_entry(&self.group, name))
    }
}

impl fmt::Debug for ImportSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportSource")
            .field("group", &self.group)
            .finish()
    }
}

fn scoped_entry(group: &str, name: &str) -> String {
    format!("{group}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PluginFeatures;

    impl FeatureProvider for PluginFeatures {
        fn features(&self) -> Vec<BackupFeature> {
            vec![
                BackupFeature::new("plugins", "calendar", FeatureMode::Both),
                BackupFeature::new("configuration", "settings", FeatureMode::Backup),
            ]
        }
    }

    fn registry() -> FeatureRegistry {
        FeatureRegistry::build(
            vec![
                BackupFeature::new("datastore", "tables", FeatureMode::Both),
                BackupFeature::new("configuration", "settings", FeatureMode::Both),
                BackupFeature::new("changelog", "history", FeatureMode::Backup),
            ],
            &[Arc::new(PluginFeatures)],
        )
        .unwrap()
    }

    #[test]
    fn duplicates_keep_first_declaration() {
        let registry = registry();
        let settings: Vec<_> = registry
            .features()
            .iter()
            .filter(|feature| feature.name == "settings")
            .collect();

        assert_eq!(settings.len(), 1);
        assert_eq!(settings[0].mode, FeatureMode::Both);
        assert_eq!(registry.features().len(), 4);
    }

    #[test]
    fn groups_follow_direction_and_declaration_order() {
        let registry = registry();

        let backup: Vec<_> = registry
            .backup_groups()
            .into_iter()
            .map(|(group, _)| group)
            .collect();
        assert_eq!(backup, ["datastore", "configuration", "changelog", "plugins"]);

        let restore: Vec<_> = registry
            .restore_groups()
            .into_iter()
            .map(|(group, _)| group)
            .collect();
        assert_eq!(restore, ["datastore", "configuration", "plugins"]);
    }

    #[test]
    fn unnamed_features_are_rejected() {
        let err = FeatureRegistry::build(
            vec![BackupFeature::new("", "tables", FeatureMode::Both)],
            &[],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use steward::backup::{BackupFeature, ExportSink, FeatureExporter, ImportSource};
use steward::bail;
use steward::engine::StepContext;
use steward::error::{ErrorKind, StewardResult};
use steward::latch::{Datastore, LatchedDatastore};
use steward_config::shared::NodeConfig;
use tracing::debug;

/// Datastore keeping one file per record, with one subdirectory per backup feature.
#[derive(Debug, Clone)]
pub struct DirectoryDatastore {
    root: PathBuf,
}

impl DirectoryDatastore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Reads every record of feature `feature`.
    pub async fn records(&self, feature: &str) -> StewardResult<BTreeMap<String, Vec<u8>>> {
        let directory = self.root.join(feature);
        let mut entries = match tokio::fs::read_dir(&directory).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(key) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };

            records.insert(key, tokio::fs::read(entry.path()).await?);
        }

        Ok(records)
    }

    /// Replaces every record of feature `feature` with `records`.
    pub async fn replace(
        &self,
        feature: &str,
        records: BTreeMap<String, Vec<u8>>,
    ) -> StewardResult<()> {
        let directory = self.root.join(feature);
        match tokio::fs::remove_dir_all(&directory).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tokio::fs::create_dir_all(&directory).await?;

        for (key, data) in records {
            tokio::fs::write(record_path(&directory, &key)?, data).await?;
        }

        Ok(())
    }
}

/// Connection to a [`DirectoryDatastore`].
#[derive(Debug)]
pub struct DirectoryConnection {
    root: PathBuf,
}

impl DirectoryConnection {
    pub async fn read(&self, feature: &str, key: &str) -> StewardResult<Option<Vec<u8>>> {
        match tokio::fs::read(record_path(&self.root.join(feature), key)?).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn write(&self, feature: &str, key: &str, data: &[u8]) -> StewardResult<()> {
        let directory = self.root.join(feature);
        tokio::fs::create_dir_all(&directory).await?;
        tokio::fs::write(record_path(&directory, key)?, data).await?;

        Ok(())
    }
}

#[async_trait]
impl Datastore for DirectoryDatastore {
    type Connection = DirectoryConnection;

    async fn connection(&self) -> StewardResult<Self::Connection> {
        tokio::fs::create_dir_all(&self.root).await?;

        Ok(DirectoryConnection {
            root: self.root.clone(),
        })
    }
}

fn record_path(directory: &Path, key: &str) -> StewardResult<PathBuf> {
    if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
        bail!(
            ErrorKind::InvalidState,
            "Record keys must be plain file names",
            format!("key `{key}`")
        );
    }

    Ok(directory.join(key))
}

/// Backs up the records of a [`DirectoryDatastore`], one archive entry per record.
#[derive(Debug, Clone)]
pub struct DirectoryExporter {
    datastore: LatchedDatastore<DirectoryDatastore>,
}

impl DirectoryExporter {
    pub fn new(datastore: LatchedDatastore<DirectoryDatastore>) -> Self {
        Self { datastore }
    }
}

#[async_trait]
impl FeatureExporter for DirectoryExporter {
    fn weight(&self) -> u32 {
        8
    }

    async fn export(
        &self,
        features: &[BackupFeature],
        sink: &ExportSink,
        ctx: &StepContext,
    ) -> StewardResult<()> {
        for (index, feature) in features.iter().enumerate() {
            let records = self.datastore.bypass().records(&feature.name).await?;
            for (key, data) in &records {
                ctx.check_canceled()?;
                sink.write(&format!("{}/{key}", feature.name), data).await?;
            }

            debug!(feature = %feature.name, records = records.len(), "feature exported");
            ctx.report_progress(((index + 1) * 100 / features.len()) as u8);
        }

        Ok(())
    }

    async fn import(
        &self,
        features: &[BackupFeature],
        source: &ImportSource,
        ctx: &StepContext,
    ) -> StewardResult<()> {
        let entries = source.entry_names();

        for (index, feature) in features.iter().enumerate() {
            ctx.check_canceled()?;

            let prefix = format!("{}/", feature.name);
            let mut records = BTreeMap::new();
            for entry in &entries {
                let Some(key) = entry.strip_prefix(&prefix) else {
                    continue;
                };
                if let Some(data) = source.read(entry) {
                    records.insert(key.to_owned(), data.to_vec());
                }
            }

            debug!(feature = %feature.name, records = records.len(), "feature imported");
            self.datastore.bypass().replace(&feature.name, records).await?;
            ctx.report_progress(((index + 1) * 100 / features.len()) as u8);
        }

        Ok(())
    }
}

/// Archives the node configuration alongside the data.
///
/// Only used for backups: a restore never overwrites the configuration of the node it runs
/// on.
#[derive(Debug, Clone)]
pub struct ConfigurationExporter {
    config: NodeConfig,
}

impl ConfigurationExporter {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl FeatureExporter for ConfigurationExporter {
    async fn export(
        &self,
        features: &[BackupFeature],
        sink: &ExportSink,
        ctx: &StepContext,
    ) -> StewardResult<()> {
        ctx.check_canceled()?;

        let payload = serde_json::to_vec_pretty(&self.config)?;
        for feature in features {
            sink.write(&feature.name, &payload).await?;
        }

        Ok(())
    }

    async fn import(
        &self,
        _features: &[BackupFeature],
        _source: &ImportSource,
        _ctx: &StepContext,
    ) -> StewardResult<()> {
        Ok(())
    }
}

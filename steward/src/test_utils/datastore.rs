use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::backup::{BackupFeature, ExportSink, FeatureExporter, FeatureMode, ImportSource};
use crate::bail;
use crate::engine::StepContext;
use crate::error::{ErrorKind, StewardResult};
use crate::latch::{Datastore, LatchedDatastore};
use crate::test_utils::notify::TimedNotify;

/// Feature group backed up by [`RecordsExporter`].
pub const RECORDS_GROUP: &str = "datastore";

type Records = Arc<Mutex<BTreeMap<String, String>>>;

/// Key-value datastore kept in memory.
///
/// Keys are expected to look like `<feature>/<key>`, so that every backup feature owns the
/// records under its prefix.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatastore {
    records: Records,
    connections: Arc<AtomicUsize>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.records.lock().unwrap().insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.records.lock().unwrap().get(key).cloned()
    }

    pub fn records(&self) -> BTreeMap<String, String> {
        self.records.lock().unwrap().clone()
    }

    /// Returns the records owned by feature `feature`.
    pub fn snapshot(&self, feature: &str) -> BTreeMap<String, String> {
        let prefix = format!("{feature}/");
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Replaces the records owned by feature `feature` with `records`.
    pub fn replace(&self, feature: &str, records: BTreeMap<String, String>) {
        let prefix = format!("{feature}/");
        let mut current = self.records.lock().unwrap();
        current.retain(|key, _| !key.starts_with(&prefix));
        current.extend(records);
    }

    /// Returns how many connections were handed out.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Connection to a [`MemoryDatastore`].
#[derive(Debug)]
pub struct MemoryConnection {
    records: Records,
}

impl MemoryConnection {
    pub fn get(&self, key: &str) -> Option<String> {
        self.records.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.records.lock().unwrap().insert(key.into(), value.into());
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    type Connection = MemoryConnection;

    async fn connection(&self) -> StewardResult<Self::Connection> {
        self.connections.fetch_add(1, Ordering::SeqCst);

        Ok(MemoryConnection {
            records: self.records.clone(),
        })
    }
}

/// Holds an export back until released, so tests can act while the datastore is latched.
#[derive(Debug, Clone, Default)]
pub struct ExportGate {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

impl ExportGate {
    /// Waits until an export reached the gate.
    pub async fn started(&self) {
        TimedNotify::new(self.started.clone()).notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Backs up and restores the records of a [`MemoryDatastore`], one archive entry per feature.
#[derive(Debug, Clone)]
pub struct RecordsExporter {
    datastore: LatchedDatastore<MemoryDatastore>,
    gate: Option<ExportGate>,
    fail_export: bool,
    exports: Arc<AtomicUsize>,
    imports: Arc<AtomicUsize>,
}

impl RecordsExporter {
    pub fn new(datastore: LatchedDatastore<MemoryDatastore>) -> Self {
        Self {
            datastore,
            gate: None,
            fail_export: false,
            exports: Arc::new(AtomicUsize::new(0)),
            imports: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes every export wait on `gate` before writing.
    pub fn with_gate(mut self, gate: ExportGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Makes every export fail.
    pub fn failing(mut self) -> Self {
        self.fail_export = true;
        self
    }

    pub fn exports(&self) -> usize {
        self.exports.load(Ordering::SeqCst)
    }

    pub fn imports(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeatureExporter for RecordsExporter {
    fn weight(&self) -> u32 {
        4
    }

    async fn export(
        &self,
        features: &[BackupFeature],
        sink: &ExportSink,
        ctx: &StepContext,
    ) -> StewardResult<()> {
        if let Some(gate) = &self.gate {
            gate.started.notify_one();
            tokio::select! {
                _ = gate.release.notified() => {}
                _ = ctx.cancellation().cancelled() => {}
            }
        }

        for (index, feature) in features.iter().enumerate() {
            ctx.check_canceled()?;
            if self.fail_export {
                bail!(
                    ErrorKind::IoError,
                    "The datastore could not be read",
                    format!("feature `{}`", feature.name)
                );
            }

            let records = self.datastore.bypass().snapshot(&feature.name);
            sink.write(&feature.name, &serde_json::to_vec(&records)?)
                .await?;
            ctx.report_progress(((index + 1) * 100 / features.len()) as u8);
        }

        self.exports.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn import(
        &self,
        features: &[BackupFeature],
        source: &ImportSource,
        ctx: &StepContext,
    ) -> StewardResult<()> {
        for feature in features {
            ctx.check_canceled()?;
            let Some(payload) = source.read(&feature.name) else {
                bail!(
                    ErrorKind::InvalidArchive,
                    "The backup holds no data for a feature",
                    format!("feature `{}`", feature.name)
                );
            };

            let records: BTreeMap<String, String> = serde_json::from_slice(payload)?;
            self.datastore.bypass().replace(&feature.name, records);
        }

        self.imports.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Returns the features backed up by [`RecordsExporter`].
pub fn records_features(names: &[&str]) -> Vec<BackupFeature> {
    names
        .iter()
        .map(|name| BackupFeature::new(RECORDS_GROUP, *name, FeatureMode::Both))
        .collect()
}

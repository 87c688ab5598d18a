//! Backup and restore orchestration.
//!
//! A backup freezes the datastore behind its latch, lets every registered feature group export
//! its data into an archive, then reopens the datastore and commits the archive under a name
//! encoding its UTC creation time. Restores run the same frame with imports.

pub mod archive;
pub mod feature;
pub mod naming;
pub mod orchestrator;
pub mod repository;
pub mod steps;

pub use archive::{ArchiveFormat, ArchiveReader, ArchiveWriter, JsonLinesFormat, MemoryArchive};
pub use feature::{
    BackupFeature, ExportSink, FeatureExporter, FeatureMode, FeatureProvider, FeatureRegistry,
    ImportSource,
};
pub use naming::BackupName;
pub use orchestrator::BackupOrchestrator;
pub use repository::{BackupPage, BackupRecord, BackupRepository, Page};

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::{ErrorKind, StewardResult};
use crate::steward_error;

/// Sequential writer of a backup archive.
#[async_trait]
pub trait ArchiveWriter: Send {
    /// Appends an entry.
    async fn write_entry(&mut self, name: &str, payload: &[u8]) -> StewardResult<()>;

    /// Flushes every entry to durable storage.
    async fn finish(self: Box<Self>) -> StewardResult<()>;
}

/// Random access to the entries of a backup archive.
pub trait ArchiveReader: Send + Sync {
    fn entry_names(&self) -> Vec<&str>;

    fn read_entry(&self, name: &str) -> Option<&[u8]>;
}

/// Physical layout of backup archives.
#[async_trait]
pub trait ArchiveFormat: Send + Sync + 'static {
    /// Creates a new archive at `path`.
    async fn create(&self, path: &Path) -> StewardResult<Box<dyn ArchiveWriter>>;

    /// Loads the archive at `path`.
    async fn open(&self, path: &Path) -> StewardResult<Box<dyn ArchiveReader>>;
}

/// Archive entries held in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryArchive {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, payload: Vec<u8>) {
        self.entries.insert(name.into(), payload);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ArchiveReader for MemoryArchive {
    fn entry_names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    fn read_entry(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }
}

/// One line of a JSON lines archive.
#[derive(Debug, Serialize, Deserialize)]
struct ArchiveLine {
    name: String,
    /// Base64 encoded payload.
    data: String,
}

/// Archive format storing one JSON object per entry and line, with base64 payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesFormat;

#[async_trait]
impl ArchiveFormat for JsonLinesFormat {
    async fn create(&self, path: &Path) -> StewardResult<Box<dyn ArchiveWriter>> {
        let file = File::create(path).await?;

        Ok(Box::new(JsonLinesWriter {
            file: BufWriter::new(file),
        }))
    }

    async fn open(&self, path: &Path) -> StewardResult<Box<dyn ArchiveReader>> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut archive = MemoryArchive::new();

        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            let line: ArchiveLine = serde_json::from_str(line).map_err(|err| {
                steward_error!(
                    ErrorKind::InvalidArchive,
                    "The backup archive contains a malformed entry",
                    format!("line {} of {}", index + 1, path.display()),
                    source: err
                )
            })?;
            let payload = STANDARD.decode(line.data.as_bytes())?;
            archive.insert(line.name, payload);
        }

        Ok(Box::new(archive))
    }
}

struct JsonLinesWriter {
    file: BufWriter<File>,
}

#[async_trait]
impl ArchiveWriter for JsonLinesWriter {
    async fn write_entry(&mut self, name: &str, payload: &[u8]) -> StewardResult<()> {
        let line = ArchiveLine {
            name: name.to_owned(),
            data: STANDARD.encode(payload),
        };
        let mut encoded = serde_json::to_vec(&line)?;
        encoded.push(b'\n');
        self.file.write_all(&encoded).await?;

        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StewardResult<()> {
        self.file.flush().await?;
        self.file.get_ref().sync_all().await?;

        Ok(())
    }
}

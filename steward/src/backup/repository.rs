use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backup::naming::{BackupName, PARTIAL_SUFFIX};
use crate::bail;
use crate::error::{ErrorKind, StewardResult};

/// Default number of records per page.
const DEFAULT_PAGE_LIMIT: usize = 50;

/// A committed backup artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    pub name: String,
    pub identifier: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Window over the backups, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// Returns a page holding every backup.
    pub fn all() -> Self {
        Self::new(0, usize::MAX)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, DEFAULT_PAGE_LIMIT)
    }
}

/// One page of backups together with the total count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupPage {
    pub items: Vec<BackupRecord>,
    pub total: usize,
}

/// Backup artifacts stored in a directory.
///
/// Only files named after the backup naming convention are considered. They are ordered by the
/// timestamp encoded in their names, newest first, never by filesystem times.
#[derive(Debug, Clone)]
pub struct BackupRepository {
    directory: PathBuf,
}

impl BackupRepository {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Checks that `name` is a canonical backup name.
    pub fn validate_name(&self, name: &str) -> StewardResult<BackupName> {
        BackupName::parse(name)
    }

    /// Returns the path of the committed artifact `name`.
    pub fn path_of(&self, name: &BackupName) -> PathBuf {
        self.directory.join(name.as_str())
    }

    /// Returns the path the artifact `name` is written to before being committed.
    pub fn partial_path_of(&self, name: &BackupName) -> PathBuf {
        self.directory.join(name.partial_file_name())
    }

    pub async fn find_all(&self, page: Page) -> StewardResult<BackupPage> {
        let records = self.scan().await?;
        let total = records.len();
        let items = records
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();

        Ok(BackupPage { items, total })
    }

    /// Returns the backup named `name`.
    ///
    /// Invalid names fail before the directory is read.
    pub async fn find_by_name(&self, name: &str) -> StewardResult<Option<BackupRecord>> {
        let name = self.validate_name(name)?;

        match tokio::fs::metadata(self.path_of(&name)).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(record(&name, metadata.len()))),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Returns the backup with the most recent encoded timestamp.
    pub async fn get_latest(&self) -> StewardResult<Option<BackupRecord>> {
        Ok(self.scan().await?.into_iter().next())
    }

    /// Deletes the backup named `name`.
    ///
    /// Invalid names fail before the filesystem is touched.
    pub async fn delete(&self, name: &str) -> StewardResult<()> {
        let name = self.validate_name(name)?;

        match tokio::fs::remove_file(self.path_of(&name)).await {
            Ok(()) => {
                info!(backup = %name, "backup deleted");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                bail!(
                    ErrorKind::BackupNotFound,
                    "The backup does not exist",
                    format!("name `{name}`")
                );
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes the oldest backups so that at most `max_retained` remain.
    ///
    /// Returns the names of the deleted backups.
    pub async fn apply_retention(&self, max_retained: usize) -> StewardResult<Vec<String>> {
        let records = self.scan().await?;
        let mut deleted = Vec::new();

        for record in records.into_iter().skip(max_retained) {
            self.delete(&record.name).await?;
            deleted.push(record.name);
        }

        if !deleted.is_empty() {
            info!(max_retained, deleted = deleted.len(), "backup retention applied");
        }

        Ok(deleted)
    }

    /// Removes archives left half written by an interrupted backup.
    pub async fn remove_partials(&self) -> StewardResult<usize> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(committed) = file_name.strip_suffix(PARTIAL_SUFFIX) else {
                continue;
            };

            if BackupName::parse(committed).is_ok() {
                tokio::fs::remove_file(entry.path()).await?;
                warn!(file = %file_name, "removed partial backup archive");
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Lists the committed backups, newest first.
    async fn scan(&self) -> StewardResult<Vec<BackupRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(directory = %self.directory.display(), "backup directory does not exist");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry
                .file_name()
                .to_str()
                .and_then(|name| BackupName::parse(name).ok())
            else {
                continue;
            };

            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                names.push((name, metadata.len()));
            }
        }

        names.sort_by(|(a, _), (b, _)| b.cmp(a));

        Ok(names
            .iter()
            .map(|(name, size_bytes)| record(name, *size_bytes))
            .collect())
    }
}

fn record(name: &BackupName, size_bytes: u64) -> BackupRecord {
    BackupRecord {
        name: name.as_str().to_owned(),
        identifier: name.identifier().to_owned(),
        created_at: name.timestamp(),
        size_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repository_with(names: &[&str]) -> (tempfile::TempDir, BackupRepository) {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            tokio::fs::write(dir.path().join(name), b"archive").await.unwrap();
        }
        let repository = BackupRepository::new(dir.path());

        (dir, repository)
    }

    fn names(page: &BackupPage) -> Vec<&str> {
        page.items.iter().map(|record| record.name.as_str()).collect()
    }

    #[tokio::test]
    async fn backups_are_ordered_by_encoded_timestamp() {
        let (_dir, repository) = repository_with(&[
            "backup-a-20230101-000000-000Z.zip",
            "backup-a-20230102-000000-000Z.zip",
            "backup-a-20221231-000000-000Z.zip",
            "backup-a-20230103-000000-000Z.zip.partial",
            "notes.txt",
        ])
        .await;

        let page = repository.find_all(Page::default()).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(
            names(&page),
            [
                "backup-a-20230102-000000-000Z.zip",
                "backup-a-20230101-000000-000Z.zip",
                "backup-a-20221231-000000-000Z.zip",
            ]
        );

        let latest = repository.get_latest().await.unwrap().unwrap();
        assert_eq!(latest.name, "backup-a-20230102-000000-000Z.zip");
        assert_eq!(latest.size_bytes, 7);
    }

    #[tokio::test]
    async fn pages_slice_the_ordered_list() {
        let (_dir, repository) = repository_with(&[
            "backup-a-20230101-000000-000Z.zip",
            "backup-a-20230102-000000-000Z.zip",
            "backup-a-20230103-000000-000Z.zip",
        ])
        .await;

        let page = repository.find_all(Page::new(1, 1)).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(names(&page), ["backup-a-20230102-000000-000Z.zip"]);
    }

    #[tokio::test]
    async fn invalid_names_never_reach_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim.txt");
        tokio::fs::write(&victim, b"keep").await.unwrap();
        let repository = BackupRepository::new(dir.path().join("backups"));

        let err = repository.delete("../victim.txt").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidBackupName);
        assert!(victim.exists());

        let err = repository.find_by_name("../victim.txt").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidBackupName);
    }

    #[tokio::test]
    async fn deleting_a_missing_backup_fails() {
        let (_dir, repository) = repository_with(&[]).await;

        let err = repository
            .delete("backup-a-20230101-000000-000Z.zip")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackupNotFound);
    }

    #[tokio::test]
    async fn find_by_name_and_delete() {
        let (_dir, repository) = repository_with(&["backup-a-20230101-000000-000Z.zip"]).await;

        let record = repository
            .find_by_name("backup-a-20230101-000000-000Z.zip")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.identifier, "a");

        repository
            .delete("backup-a-20230101-000000-000Z.zip")
            .await
            .unwrap();
        assert!(
            repository
                .find_by_name("backup-a-20230101-000000-000Z.zip")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn retention_deletes_oldest_first() {
        let (_dir, repository) = repository_with(&[
            "backup-a-20230101-000000-000Z.zip",
            "backup-a-20230102-000000-000Z.zip",
            "backup-a-20230103-000000-000Z.zip",
        ])
        .await;

        let deleted = repository.apply_retention(2).await.unwrap();
        assert_eq!(deleted, ["backup-a-20230101-000000-000Z.zip"]);
        assert_eq!(repository.find_all(Page::all()).await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn partial_archives_are_cleaned_up() {
        let (dir, repository) = repository_with(&[
            "backup-a-20230101-000000-000Z.zip",
            "backup-a-20230102-000000-000Z.zip.partial",
            "other.partial",
        ])
        .await;

        assert_eq!(repository.remove_partials().await.unwrap(), 1);
        assert!(dir.path().join("other.partial").exists());
        assert!(dir.path().join("backup-a-20230101-000000-000Z.zip").exists());
    }

    #[tokio::test]
    async fn missing_directory_has_no_backups() {
        let dir = tempfile::tempdir().unwrap();
        let repository = BackupRepository::new(dir.path().join("absent"));

        assert_eq!(repository.find_all(Page::default()).await.unwrap().total, 0);
        assert!(repository.get_latest().await.unwrap().is_none());
    }
}

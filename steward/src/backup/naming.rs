use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;

use crate::bail;
use crate::error::{ErrorKind, StewardResult};
use crate::steward_error;

/// Suffix of archives that are still being written.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Format of the timestamp embedded in backup names.
const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S-%3f";

static BACKUP_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^backup-([A-Za-z0-9][A-Za-z0-9_-]*)-([0-9]{4})([0-9]{2})([0-9]{2})-([0-9]{2})([0-9]{2})([0-9]{2})-([0-9]{3})Z\.zip$",
    )
    .expect("backup name pattern is valid")
});

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("identifier pattern is valid")
});

/// Canonical name of a backup artifact.
///
/// Names look like `backup-<identifier>-<yyyyMMdd-HHmmss-SSS>Z.zip` with a UTC timestamp. They
/// order by that timestamp, then by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackupName {
    name: String,
    identifier: String,
    timestamp: DateTime<Utc>,
}

impl BackupName {
    /// Builds the name of a backup created at `timestamp`.
    ///
    /// The timestamp is truncated to milliseconds.
    pub fn new(identifier: &str, timestamp: DateTime<Utc>) -> StewardResult<Self> {
        if !IDENTIFIER.is_match(identifier) {
            bail!(
                ErrorKind::InvalidBackupName,
                "The backup identifier contains invalid characters",
                format!("identifier `{identifier}`")
            );
        }

        let name = format!(
            "backup-{identifier}-{}Z.zip",
            timestamp.format(TIMESTAMP_FORMAT)
        );

        Self::parse(&name)
    }

    /// Parses and validates `name`.
    ///
    /// Fails with [`ErrorKind::InvalidBackupName`] for anything that is not a canonical
    /// backup name, which rules out path separators and relative components.
    pub fn parse(name: &str) -> StewardResult<Self> {
        let invalid = || {
            steward_error!(
                ErrorKind::InvalidBackupName,
                "The backup name does not follow the naming convention",
                format!("name `{name}`")
            )
        };

        let captures = BACKUP_NAME.captures(name).ok_or_else(invalid)?;
        let number = |index: usize| -> StewardResult<u32> {
            captures
                .get(index)
                .and_then(|group| group.as_str().parse().ok())
                .ok_or_else(invalid)
        };

        let date = NaiveDate::from_ymd_opt(number(2)? as i32, number(3)?, number(4)?)
            .ok_or_else(invalid)?;
        let timestamp = date
            .and_hms_milli_opt(number(5)?, number(6)?, number(7)?, number(8)?)
            .ok_or_else(invalid)?
            .and_utc();

        Ok(Self {
            name: name.to_owned(),
            identifier: captures[1].to_owned(),
            timestamp,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Returns the UTC creation time encoded in the name.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the file name used while the archive is being written.
    pub fn partial_file_name(&self) -> String {
        format!("{}{PARTIAL_SUFFIX}", self.name)
    }
}

impl Ord for BackupName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for BackupName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BackupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

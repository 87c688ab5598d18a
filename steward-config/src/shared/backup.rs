use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Configuration for backup artifacts.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct BackupConfig {
    /// Directory holding backup artifacts.
    pub directory: PathBuf,

    /// Identifier embedded in artifact names (`backup-<identifier>-<timestamp>Z.zip`).
    ///
    /// Default: `steward`
    #[serde(default = "default_identifier")]
    pub identifier: String,

    /// Number of artifacts kept after a successful backup. Older ones are deleted.
    ///
    /// Unset keeps every artifact.
    #[serde(default)]
    pub max_retained: Option<usize>,
}

impl BackupConfig {
    /// Default artifact identifier.
    pub const DEFAULT_IDENTIFIER: &'static str = "steward";

    /// Creates a configuration for `directory` with default identifier and no retention.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            identifier: Self::DEFAULT_IDENTIFIER.to_string(),
            max_retained: None,
        }
    }

    /// Validates the identifier charset and the retention bound.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_identifier(&self.identifier) {
            return Err(ValidationError::InvalidBackupIdentifier(
                self.identifier.clone(),
            ));
        }

        if self.max_retained == Some(0) {
            return Err(ValidationError::ZeroRetention);
        }

        Ok(())
    }
}

fn is_valid_identifier(identifier: &str) -> bool {
    let mut chars = identifier.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn default_identifier() -> String {
    BackupConfig::DEFAULT_IDENTIFIER.to_string()
}

use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The node id is empty.
    #[error("`node_id` cannot be empty")]
    EmptyNodeId,
    /// A timeout was configured as zero.
    #[error("`{0}` must be greater than zero")]
    ZeroTimeout(&'static str),
    /// The backup identifier contains characters not allowed in artifact names.
    #[error("Invalid backup identifier `{0}`: only ASCII letters, digits, `_` and `-` are allowed and it must start with a letter or digit")]
    InvalidBackupIdentifier(String),
    /// Retention was configured to keep no backups at all.
    #[error("`max_retained` must be at least 1 when set")]
    ZeroRetention,
}

//! Error taxonomy of the directory servers.

use thiserror::Error;

/// Result-level errors surfaced by local and remote directories. The names
/// mirror the LDAP result conditions the replicator dispatches on.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("entry already exists: {0}")]
    EntryAlreadyExists(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("no such object: {0}")]
    NoSuchObject(String),
    #[error("not allowed on non-leaf: {0}")]
    NotAllowedOnNonLeaf(String),
    #[error("server unavailable: {0}")]
    Unavailable(String),
    #[error("server busy: {0}")]
    Busy(String),
    #[error("bind failed: {0}")]
    Bind(String),
    #[error("directory version too old: {0}")]
    VersionTooOld(String),
    #[error("{0}")]
    Other(String),
}

impl DirectoryError {
    /// Availability errors suspend the replicator instead of counting
    /// against the per-change retry budget.
    pub fn is_availability(&self) -> bool {
        matches!(
            self,
            DirectoryError::Unavailable(_) | DirectoryError::Busy(_)
        )
    }
}

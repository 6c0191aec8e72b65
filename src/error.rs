//! Crate-level error type.

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::directory::DirectoryError;
use crate::replicator::State;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("replicator already started")]
    AlreadyStarted,

    #[error("illegal state transition: {from:?} -> {to:?}")]
    IllegalTransition { from: State, to: State },

    #[error("remote {url} already registered")]
    DuplicateRemote { url: String },

    #[error("version mismatch: local {local} < remote {remote} ({url})")]
    VersionMismatch { url: String, local: u32, remote: u32 },

    #[error("no checkpoint initialized for {url}")]
    MissingCheckpoint { url: String },

    #[error("change {changenumber} from {url} failed after {attempts} attempts")]
    RetriesExhausted {
        url: String,
        changenumber: u64,
        attempts: u32,
        #[source]
        source: DirectoryError,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

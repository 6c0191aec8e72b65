#![forbid(unsafe_code)]

//! One-way, multi-source LDAP directory replicator.
//!
//! Pulls changelog entries from upstream directories and applies them, in
//! each remote's commit order, to a single downstream directory. Position
//! per remote is a durable checkpoint record in the local directory,
//! advanced in the same commit as each replicated write.

pub mod apply;
pub mod checkpoint;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod queue;
pub mod remote;
pub mod replicator;
pub mod runtime;
pub mod telemetry;
pub mod test_harness;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{NullObserver, ReplicatorObserver};
pub use replicator::{PAGE_SIZE, Replicator, State};
pub use runtime::{Command, ReplicatorHandle, spawn};

//! Remote directory contract and changelog model.

use uuid::Uuid;

use crate::directory::{Attrs, DirectoryError, Filter, Modification};

/// Identity of an upstream directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteIdentity {
    pub url: String,
    pub uuid: Option<Uuid>,
}

/// One changelog entry as delivered by a remote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    /// Monotonic position in the remote's changelog.
    pub changenumber: u64,
    pub targetdn: String,
    pub payload: ChangePayload,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangePayload {
    Add(Attrs),
    Modify(Vec<Modification>),
    Delete,
}

/// Terminal outcome of one poll window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// A previous poll for this remote is still running; nothing was
    /// delivered.
    InFlight,
    /// The window held no new entries.
    CaughtUp,
    /// Entries were delivered; `last` is the highest changenumber fetched.
    Fetched { last: u64 },
}

/// Acceptance-filter matcher. Construction from the stored filter strings
/// is the remote directory's concern; the replicator only asks membership.
pub trait Matcher: Send {
    fn matches(&self, attrs: &Attrs) -> bool;
}

impl Matcher for Filter {
    fn matches(&self, attrs: &Attrs) -> bool {
        Filter::matches(self, attrs)
    }
}

/// Whether an entry belongs in the local copy for this remote. The queries
/// are a disjunction; an empty set accepts everything.
pub fn matches_any(queries: &[Box<dyn Matcher>], attrs: &Attrs) -> bool {
    queries.is_empty() || queries.iter().any(|q| q.matches(attrs))
}

/// Per-remote connection wrapper.
///
/// Implementations must allow at most one poll in flight per remote and
/// report `PollOutcome::InFlight` for calls rejected on that ground.
pub trait RemoteDirectory: Send {
    fn identity(&self) -> &RemoteIdentity;
    fn version(&self) -> u32;
    /// Decoded acceptance filter, a conceptual OR of matchers.
    fn queries(&self) -> &[Box<dyn Matcher>];
    /// The acceptance filter as stored in the checkpoint record.
    fn raw_queries(&self) -> &[String];
    fn connect(&mut self) -> Result<(), DirectoryError>;
    fn unbind(&mut self);
    fn destroy(&mut self);
    fn connected(&self) -> bool;
    /// Fetch changelog entries with `start <= changenumber <= end`, handing
    /// each to `sink` in changenumber order.
    fn poll(
        &mut self,
        start: u64,
        end: u64,
        sink: &mut dyn FnMut(Change),
    ) -> Result<PollOutcome, DirectoryError>;
}

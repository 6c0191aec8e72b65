//! Request controls attached to local mutations.
//!
//! Wire serialization is the server library's concern; the variants carry
//! exactly the values the server commits alongside the carrying write.

use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Control {
    /// Tags a write with the source remote so downstream changelog
    /// consumers can attribute and deduplicate it.
    ChangelogHint { uuid: Uuid, changenumber: u64 },
    /// Instructs the server to update the checkpoint record at `dn` to
    /// `changenumber` in the same transaction as the carrying write.
    CheckpointUpdate { dn: String, changenumber: u64 },
}

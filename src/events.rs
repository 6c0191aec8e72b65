//! Observer interface for replicator lifecycle signals.

use crate::error::Error;

/// Callbacks for the signals the replicator emits. Every hook defaults to a
/// no-op so observers implement only what they watch.
pub trait ReplicatorObserver: Send {
    /// Local directory (re)connected.
    fn on_connect(&mut self) {}
    /// A polling pass started.
    fn on_poll(&mut self) {}
    /// A remote had no new entries at `changenumber`.
    fn on_caughtup(&mut self, _url: &str, _changenumber: u64) {}
    /// A fatal condition escalated outward.
    fn on_error(&mut self, _err: &Error) {}
    /// The replicator was torn down.
    fn on_destroy(&mut self) {}
}

/// Observer that ignores every signal.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullObserver;

impl ReplicatorObserver for NullObserver {}

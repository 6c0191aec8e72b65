//! Replicator controller: state machine, polling, and queue draining.
//!
//! The controller owns the local client, every remote, and the FIFO of
//! pending changes. It never recurses on a state change: operations push
//! tasks onto an internal queue which `drive` drains one at a time, so a
//! transition's effects always run after the step that caused them.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::apply::{self, ApplyOutcome};
use crate::checkpoint;
use crate::config::Config;
use crate::directory::{Control, LocalDirectory};
use crate::error::{Error, Result};
use crate::events::ReplicatorObserver;
use crate::queue::ChangeQueue;
use crate::remote::{Change, PollOutcome, RemoteDirectory};

/// Changelog window requested per poll.
pub const PAGE_SIZE: u64 = 50;
/// Attempts per change before escalating.
const RETRY_LIMIT: u32 = 3;
const INIT_BACKOFF_BASE: Duration = Duration::from_millis(1000);
const INIT_BACKOFF_MAX: Duration = Duration::from_millis(60_000);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Init,
    Wait,
    Poll,
    Process,
    Destroy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Task {
    Resume,
    PollAll,
    PollRemote(String),
    Process,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SuspendKind {
    /// Recovery is driven by the next resume's blocking reconnect.
    Transient,
    /// Startup failure; retried on an exponential backoff.
    Init,
}

struct Remote {
    conn: Box<dyn RemoteDirectory>,
    /// Highest changenumber fetched (not necessarily applied).
    searchnumber: u64,
    /// DN of this remote's checkpoint record, set by checkpoint init.
    checkpoint: Option<String>,
    /// searchnumber at which caughtup was last emitted.
    caughtup: Option<u64>,
}

pub struct Replicator<C> {
    config: Config,
    client: C,
    observer: Box<dyn ReplicatorObserver>,
    state: State,
    destroyed: bool,
    remotes: Vec<Remote>,
    queue: ChangeQueue,
    tasks: VecDeque<Task>,
    poll_timer: Option<Instant>,
    backoff: Option<Backoff>,
    backoff_due: Option<Instant>,
}

impl<C: LocalDirectory> Replicator<C> {
    pub fn new(config: Config, client: C, observer: Box<dyn ReplicatorObserver>) -> Self {
        Self {
            config,
            client,
            observer,
            state: State::Init,
            destroyed: false,
            remotes: Vec::new(),
            queue: ChangeQueue::new(),
            tasks: VecDeque::new(),
            poll_timer: None,
            backoff: None,
            backoff_due: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn searchnumber(&self, url: &str) -> Option<u64> {
        self.remote_index(url).map(|i| self.remotes[i].searchnumber)
    }

    pub fn checkpoint_dn(&self, url: &str) -> Option<String> {
        self.remote_index(url)
            .and_then(|i| self.remotes[i].checkpoint.clone())
    }

    pub fn backoff_armed(&self) -> bool {
        self.backoff_due.is_some()
    }

    /// Register a remote. Its connection is opened immediately; a failure
    /// here is retried by the next resume.
    pub fn add_remote(&mut self, mut conn: Box<dyn RemoteDirectory>) -> Result<()> {
        let url = conn.identity().url.clone();
        if self.remotes.iter().any(|r| r.conn.identity().url == url) {
            return Err(Error::DuplicateRemote { url });
        }
        if let Err(err) = conn.connect() {
            tracing::warn!(%url, %err, "remote connect failed; will retry on resume");
        }
        tracing::info!(%url, "remote registered");
        self.remotes.push(Remote {
            conn,
            searchnumber: 0,
            checkpoint: None,
            caughtup: None,
        });
        Ok(())
    }

    /// Begin replication. Valid exactly once, from the initial state.
    pub fn start(&mut self) -> Result<()> {
        if self.state != State::Init {
            return Err(Error::AlreadyStarted);
        }
        self.set_state(State::Wait);
        self.tasks.push_back(Task::Resume);
        self.drive(Instant::now());
        Ok(())
    }

    /// Re-run the gated startup sequence. A no-op outside `Wait`.
    pub fn resume(&mut self) {
        self.tasks.push_back(Task::Resume);
        self.drive(Instant::now());
    }

    /// Run a polling pass over one named remote, or all of them.
    pub fn poll(&mut self, url: Option<&str>) {
        match url {
            Some(url) => self.tasks.push_back(Task::PollRemote(url.to_string())),
            None => self.tasks.push_back(Task::PollAll),
        }
        self.drive(Instant::now());
    }

    /// The local connection dropped. Ignored after destroy.
    pub fn handle_close(&mut self) {
        if self.destroyed {
            return;
        }
        tracing::warn!("local directory connection closed");
        let now = Instant::now();
        self.suspend(now, SuspendKind::Transient);
        self.tasks.push_back(Task::Resume);
        self.drive(now);
    }

    /// Tear down unconditionally: cancel timers, release every connection.
    pub fn destroy(&mut self) {
        if self.state == State::Destroy {
            return;
        }
        tracing::info!("destroying replicator");
        self.set_state(State::Destroy);
        self.destroyed = true;
        self.tasks.clear();
        self.queue.clear();
        self.poll_timer = None;
        self.backoff = None;
        self.backoff_due = None;
        self.client.destroy();
        for remote in &mut self.remotes {
            remote.conn.destroy();
        }
        self.observer.on_destroy();
    }

    /// Earliest pending timer (poll tick or init backoff), if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.backoff_due, self.poll_timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire any timer that is due at `now`.
    pub fn on_timer(&mut self, now: Instant) {
        if let Some(due) = self.backoff_due
            && due <= now
        {
            self.backoff_due = None;
            self.tasks.push_back(Task::Resume);
        }
        if let Some(due) = self.poll_timer
            && due <= now
        {
            self.poll_timer = None;
            self.tasks.push_back(Task::PollAll);
        }
        self.drive(now);
    }

    fn drive(&mut self, now: Instant) {
        while self.state != State::Destroy {
            let Some(task) = self.tasks.pop_front() else {
                break;
            };
            match task {
                Task::Resume => self.do_resume(now),
                Task::PollAll => self.do_poll(now, None),
                Task::PollRemote(url) => self.do_poll(now, Some(&url)),
                Task::Process => self.do_process(now),
            }
        }
    }

    fn set_state(&mut self, to: State) -> bool {
        if self.state == to {
            return true;
        }
        if !transition_allowed(self.state, to) {
            let err = Error::IllegalTransition {
                from: self.state,
                to,
            };
            tracing::error!(%err, "illegal state transition");
            self.observer.on_error(&err);
            return false;
        }
        tracing::debug!(from = ?self.state, to = ?to, "state transition");
        self.state = to;
        match to {
            State::Poll => self.tasks.push_back(Task::PollAll),
            State::Process => self.tasks.push_back(Task::Process),
            _ => {}
        }
        true
    }

    fn remote_index(&self, url: &str) -> Option<usize> {
        self.remotes
            .iter()
            .position(|r| r.conn.identity().url == url)
    }

    fn do_resume(&mut self, now: Instant) {
        if self.state != State::Wait {
            return;
        }

        // Local client first; connect blocks on the client's own reconnect
        // machinery and fails only for fatal setup problems.
        if !self.client.connected() {
            match self.client.connect() {
                Ok(()) => {
                    tracing::info!("local directory connected");
                    self.observer.on_connect();
                }
                Err(err) => {
                    let err = Error::Directory(err);
                    tracing::error!(%err, "local directory setup failed");
                    self.observer.on_error(&err);
                    return;
                }
            }
        }

        // Every remote connection.
        let mut remote_failed = false;
        for remote in &mut self.remotes {
            if !remote.conn.connected()
                && let Err(err) = remote.conn.connect()
            {
                tracing::warn!(url = %remote.conn.identity().url, %err, "remote connect failed");
                remote_failed = true;
                break;
            }
        }
        if remote_failed {
            self.suspend(now, SuspendKind::Init);
            return;
        }

        // Version gate: the local server must be at least as new as every
        // remote it replicates from.
        let local = self.client.version().unwrap_or(0);
        let mismatch = self.remotes.iter().find_map(|remote| {
            let remote_version = remote.conn.version();
            (local < remote_version).then(|| Error::VersionMismatch {
                url: remote.conn.identity().url.clone(),
                local,
                remote: remote_version,
            })
        });
        if let Some(err) = mismatch {
            tracing::error!(%err, "version mismatch");
            self.observer.on_error(&err);
            self.suspend(now, SuspendKind::Init);
            return;
        }

        // Checkpoint init for every remote.
        let base = self.config.checkpoint_base().to_string();
        let objectclass = self.config.checkpoint_objectclass.clone();
        for i in 0..self.remotes.len() {
            let identity = self.remotes[i].conn.identity().clone();
            let raw_queries = self.remotes[i].conn.raw_queries().to_vec();
            match checkpoint::init(&mut self.client, &base, &objectclass, &identity, &raw_queries)
            {
                Ok(record) => {
                    let remote = &mut self.remotes[i];
                    remote.searchnumber = record.changenumber;
                    remote.checkpoint = Some(record.dn);
                }
                Err(err) => {
                    let err = Error::from(err);
                    tracing::error!(url = %identity.url, %err, "checkpoint init failed");
                    self.observer.on_error(&err);
                    self.suspend(now, SuspendKind::Init);
                    return;
                }
            }
        }

        self.backoff = None;
        self.backoff_due = None;
        self.set_state(State::Poll);
    }

    fn do_poll(&mut self, now: Instant, target: Option<&str>) {
        if self.state != State::Poll {
            return;
        }
        self.observer.on_poll();

        let indices: Vec<usize> = match target {
            Some(url) => self.remote_index(url).into_iter().collect(),
            None => (0..self.remotes.len()).collect(),
        };
        for idx in indices {
            if self.state != State::Poll {
                break;
            }
            if !self.poll_remote(now, idx) {
                return;
            }
        }
        if self.poll_timer.is_none() {
            self.poll_timer = Some(now + self.config.poll_interval());
        }
    }

    /// Poll one remote's next changelog window. Returns false when the
    /// replicator suspended and the pass must stop.
    fn poll_remote(&mut self, now: Instant, idx: usize) -> bool {
        let url = self.remotes[idx].conn.identity().url.clone();
        if self.remotes[idx].checkpoint.is_none() {
            tracing::debug!(%url, "remote not initialized; skipping poll");
            return true;
        }
        let start = self.remotes[idx].searchnumber + 1;
        let end = start + PAGE_SIZE;

        let local = self.client.version().unwrap_or(0);
        let remote_version = self.remotes[idx].conn.version();
        if local < remote_version {
            let err = Error::VersionMismatch {
                url,
                local,
                remote: remote_version,
            };
            tracing::error!(%err, "version mismatch");
            self.observer.on_error(&err);
            self.suspend(now, SuspendKind::Init);
            return false;
        }

        let mut fetched: Vec<Change> = Vec::new();
        let outcome = self.remotes[idx]
            .conn
            .poll(start, end, &mut |change| fetched.push(change));
        match outcome {
            Err(err) => {
                tracing::warn!(%url, %err, "poll failed; suspending");
                self.suspend(now, SuspendKind::Transient);
                self.tasks.push_back(Task::Resume);
                false
            }
            Ok(PollOutcome::InFlight) => true,
            Ok(PollOutcome::Fetched { last }) => {
                tracing::debug!(%url, count = fetched.len(), last, "fetched changelog entries");
                for change in fetched {
                    self.enqueue(&url, change);
                }
                self.remotes[idx].searchnumber = last;
                // Bias toward draining a busy remote.
                self.tasks.push_back(Task::PollRemote(url));
                true
            }
            Ok(PollOutcome::CaughtUp) => {
                let searchnumber = self.remotes[idx].searchnumber;
                if self.remotes[idx].caughtup != Some(searchnumber) {
                    self.remotes[idx].caughtup = Some(searchnumber);
                    self.observer.on_caughtup(&url, searchnumber);
                }
                true
            }
        }
    }

    fn enqueue(&mut self, url: &str, change: Change) {
        tracing::trace!(%url, changenumber = change.changenumber, "enqueue");
        self.queue.push(url, change);
        if self.state == State::Poll {
            self.set_state(State::Process);
        }
    }

    /// Apply the head of the queue.
    fn do_process(&mut self, now: Instant) {
        if self.state != State::Process {
            return;
        }
        let Some(mut entry) = self.queue.pop() else {
            self.set_state(State::Poll);
            return;
        };

        let Some(idx) = self.remote_index(&entry.url) else {
            tracing::error!(url = %entry.url, "queued change from unknown remote; dropping");
            self.schedule_next_process();
            return;
        };
        let changenumber = entry.change.changenumber;
        let uuid = self.remotes[idx].conn.identity().uuid;
        let Some(checkpoint_dn) = self.remotes[idx].checkpoint.clone() else {
            let err = Error::MissingCheckpoint {
                url: entry.url.clone(),
            };
            tracing::error!(%err, "cannot process change");
            self.observer.on_error(&err);
            return;
        };

        let mut controls = Vec::with_capacity(2);
        if let Some(uuid) = uuid {
            controls.push(Control::ChangelogHint { uuid, changenumber });
        }
        controls.push(Control::CheckpointUpdate {
            dn: checkpoint_dn.clone(),
            changenumber,
        });

        let mut result = apply::apply_change(
            &mut self.client,
            self.remotes[idx].conn.queries(),
            &entry.change,
            &controls,
        );
        if let Ok(ApplyOutcome::Skipped) = result {
            // Nothing carried the checkpoint-update control; advance the
            // record directly so the stream still makes progress.
            result = checkpoint::update(&mut self.client, &checkpoint_dn, changenumber)
                .map(|()| ApplyOutcome::Skipped);
        }

        match result {
            Ok(_) => {
                tracing::debug!(url = %entry.url, changenumber, "change applied");
                self.schedule_next_process();
            }
            Err(err) if err.is_availability() => {
                tracing::warn!(%err, "local directory unavailable; suspending");
                self.suspend(now, SuspendKind::Transient);
                self.tasks.push_back(Task::Resume);
            }
            Err(err) => {
                entry.retry += 1;
                if entry.retry >= RETRY_LIMIT {
                    let err = Error::RetriesExhausted {
                        url: entry.url.clone(),
                        changenumber,
                        attempts: entry.retry,
                        source: err,
                    };
                    tracing::error!(%err, "change application failed permanently");
                    self.observer.on_error(&err);
                    // The queue is intentionally not advanced: the
                    // checkpoint must not move past this change.
                } else {
                    tracing::warn!(retry = entry.retry, %err, "change application failed; retrying");
                    self.queue.requeue_front(entry);
                    self.tasks.push_back(Task::Process);
                }
            }
        }
    }

    fn schedule_next_process(&mut self) {
        if self.queue.is_empty() {
            self.set_state(State::Poll);
        } else {
            self.tasks.push_back(Task::Process);
        }
    }

    fn suspend(&mut self, now: Instant, kind: SuspendKind) {
        if self.state == State::Destroy {
            return;
        }
        tracing::info!(kind = ?kind, "suspending");
        self.queue.clear();
        if self.client.connected() {
            self.client.unbind();
        }
        for remote in &mut self.remotes {
            if remote.conn.connected() {
                remote.conn.unbind();
            }
        }
        self.set_state(State::Wait);
        if kind == SuspendKind::Init && self.backoff_due.is_none() {
            let backoff = self
                .backoff
                .get_or_insert_with(|| Backoff::new(INIT_BACKOFF_BASE, INIT_BACKOFF_MAX));
            let delay = backoff.next_delay();
            tracing::info!(delay_ms = delay.as_millis() as u64, "arming init retry backoff");
            self.backoff_due = Some(now + delay);
        }
    }
}

fn transition_allowed(from: State, to: State) -> bool {
    use State::*;
    matches!(
        (from, to),
        (Init, Wait)
            | (Init, Destroy)
            | (Wait, Poll)
            | (Wait, Destroy)
            | (Poll, Wait)
            | (Poll, Process)
            | (Poll, Destroy)
            | (Process, Wait)
            | (Process, Poll)
            | (Process, Destroy)
    )
}

struct Backoff {
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self { max, current: base }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = next.min(self.max);
        delay
    }
}

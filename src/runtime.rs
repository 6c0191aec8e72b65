//! Driver thread for a replicator instance.
//!
//! The replicator itself is a deterministic state machine; this module owns
//! the thread that feeds it: commands from the embedder, plus the poll and
//! backoff timers it asks for via `next_deadline`.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, unbounded};

use crate::directory::LocalDirectory;
use crate::replicator::Replicator;

/// Wake the loop at least this often when no timer is pending.
const IDLE_TICK: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub enum Command {
    /// Run a polling pass over one named remote, or all of them.
    Poll(Option<String>),
    /// The local directory connection dropped.
    ClientClosed,
    Destroy,
}

pub struct ReplicatorHandle {
    commands: Sender<Command>,
    join: JoinHandle<()>,
}

impl ReplicatorHandle {
    pub fn poll(&self, url: Option<String>) {
        let _ = self.commands.send(Command::Poll(url));
    }

    pub fn notify_closed(&self) {
        let _ = self.commands.send(Command::ClientClosed);
    }

    /// Tear down the replicator and wait for its thread to exit.
    pub fn destroy(self) {
        let _ = self.commands.send(Command::Destroy);
        let _ = self.join.join();
    }
}

/// Start `replicator` on its own thread and return a handle to it.
pub fn spawn<C>(replicator: Replicator<C>) -> ReplicatorHandle
where
    C: LocalDirectory + Send + 'static,
{
    let (commands, receiver) = unbounded();
    let join = thread::spawn(move || run_loop(replicator, receiver));
    ReplicatorHandle { commands, join }
}

fn run_loop<C: LocalDirectory>(mut replicator: Replicator<C>, commands: Receiver<Command>) {
    if let Err(err) = replicator.start() {
        tracing::error!(%err, "replicator start failed");
    }

    loop {
        if replicator.destroyed() {
            break;
        }

        let now = Instant::now();
        let timeout = replicator
            .next_deadline()
            .map(|due| due.saturating_duration_since(now))
            .unwrap_or(IDLE_TICK);
        let timer = crossbeam::channel::after(timeout);

        crossbeam::select! {
            recv(commands) -> command => match command {
                Ok(Command::Poll(url)) => replicator.poll(url.as_deref()),
                Ok(Command::ClientClosed) => replicator.handle_close(),
                Ok(Command::Destroy) | Err(_) => {
                    replicator.destroy();
                    break;
                }
            },
            recv(timer) -> _ => replicator.on_timer(Instant::now()),
        }
    }
}

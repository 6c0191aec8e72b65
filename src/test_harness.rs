//! In-memory fakes for exercising the replicator without a network.
//!
//! `MemoryDirectory` honors the request-control semantics the real server
//! provides: a successful mutation and its checkpoint-update control commit
//! together, and changelog-hint controls are recorded for attribution
//! assertions. `ScriptedRemote` serves a fixed changelog. Both hand out
//! shared handles so tests keep inspecting state the replicator owns.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::directory::{
    Attrs, Control, DirectoryError, Entry, Filter, LocalDirectory, Modification, Scope,
    apply_modifications,
};
use crate::error::Error;
use crate::events::ReplicatorObserver;
use crate::remote::{Change, Matcher, PollOutcome, RemoteDirectory, RemoteIdentity};

/// Canonical DN spelling so `uid=x,o=smartdc` and `uid=x, o=smartdc` name
/// the same entry.
fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A changelog-hint control observed on a successful write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangelogHintRecord {
    pub dn: String,
    pub uuid: Uuid,
    pub changenumber: u64,
}

#[derive(Default)]
struct MemoryState {
    version: u32,
    connected: bool,
    connects: u32,
    entries: BTreeMap<String, Attrs>,
    hints: Vec<ChangelogHintRecord>,
    fail_connects: VecDeque<DirectoryError>,
    fail_searches: VecDeque<DirectoryError>,
    fail_mutations: VecDeque<DirectoryError>,
}

impl MemoryState {
    fn apply_controls(&mut self, target: &str, controls: &[Control]) {
        for control in controls {
            match control {
                Control::ChangelogHint { uuid, changenumber } => {
                    self.hints.push(ChangelogHintRecord {
                        dn: target.to_string(),
                        uuid: *uuid,
                        changenumber: *changenumber,
                    });
                }
                Control::CheckpointUpdate { dn, changenumber } => {
                    let dn = normalize_dn(dn);
                    if let Some(record) = self.entries.get_mut(&dn) {
                        record.insert("changenumber".into(), vec![changenumber.to_string()]);
                    }
                }
            }
        }
    }
}

/// Cloneable in-memory stand-in for the downstream directory.
#[derive(Clone)]
pub struct MemoryDirectory {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryDirectory {
    pub fn new(version: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                version,
                ..MemoryState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().expect("memory directory lock")
    }

    pub fn insert(&self, dn: &str, attrs: Attrs) {
        self.lock().entries.insert(normalize_dn(dn), attrs);
    }

    pub fn set_attr(&self, dn: &str, attr: &str, values: Vec<String>) {
        if let Some(entry) = self.lock().entries.get_mut(&normalize_dn(dn)) {
            entry.insert(attr.to_string(), values);
        }
    }

    pub fn entry(&self, dn: &str) -> Option<Attrs> {
        self.lock().entries.get(&normalize_dn(dn)).cloned()
    }

    /// The `changenumber` attribute of `dn`, parsed.
    pub fn changenumber(&self, dn: &str) -> Option<u64> {
        self.entry(dn)?
            .get("changenumber")?
            .first()?
            .parse()
            .ok()
    }

    pub fn hints(&self) -> Vec<ChangelogHintRecord> {
        self.lock().hints.clone()
    }

    pub fn connects(&self) -> u32 {
        self.lock().connects
    }

    pub fn set_version(&self, version: u32) {
        self.lock().version = version;
    }

    pub fn fail_next_connect(&self, err: DirectoryError) {
        self.lock().fail_connects.push_back(err);
    }

    pub fn fail_next_searches(&self, errs: Vec<DirectoryError>) {
        self.lock().fail_searches.extend(errs);
    }

    pub fn fail_next_mutations(&self, errs: Vec<DirectoryError>) {
        self.lock().fail_mutations.extend(errs);
    }
}

impl LocalDirectory for MemoryDirectory {
    fn connect(&mut self) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        if let Some(err) = state.fail_connects.pop_front() {
            return Err(err);
        }
        if state.version == 0 {
            return Err(DirectoryError::VersionTooOld(
                "root DSE reports no version".into(),
            ));
        }
        state.connected = true;
        state.connects += 1;
        Ok(())
    }

    fn unbind(&mut self) {
        self.lock().connected = false;
    }

    fn destroy(&mut self) {
        self.lock().connected = false;
    }

    fn connected(&self) -> bool {
        self.lock().connected
    }

    fn version(&self) -> Option<u32> {
        let state = self.lock();
        (state.version > 0).then_some(state.version)
    }

    fn search(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &Filter,
    ) -> Result<Vec<Entry>, DirectoryError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(DirectoryError::Unavailable("not connected".into()));
        }
        if let Some(err) = state.fail_searches.pop_front() {
            return Err(err);
        }
        let base = normalize_dn(base);
        match scope {
            Scope::Base => match state.entries.get(&base) {
                None => Err(DirectoryError::NoSuchObject(base)),
                Some(attrs) if filter.matches(attrs) => Ok(vec![Entry {
                    dn: base.clone(),
                    attrs: attrs.clone(),
                }]),
                Some(_) => Ok(Vec::new()),
            },
            Scope::One | Scope::Sub => {
                let child_suffix = format!(", {base}");
                Ok(state
                    .entries
                    .iter()
                    .filter(|(dn, _)| match scope {
                        Scope::Sub => **dn == base || dn.ends_with(&child_suffix),
                        _ => dn.ends_with(&child_suffix),
                    })
                    .filter(|(_, attrs)| filter.matches(attrs))
                    .map(|(dn, attrs)| Entry {
                        dn: dn.clone(),
                        attrs: attrs.clone(),
                    })
                    .collect())
            }
        }
    }

    fn add(
        &mut self,
        dn: &str,
        attrs: &Attrs,
        controls: &[Control],
    ) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(DirectoryError::Unavailable("not connected".into()));
        }
        if let Some(err) = state.fail_mutations.pop_front() {
            return Err(err);
        }
        let dn = normalize_dn(dn);
        if state.entries.contains_key(&dn) {
            return Err(DirectoryError::EntryAlreadyExists(dn));
        }
        state.entries.insert(dn.clone(), attrs.clone());
        state.apply_controls(&dn, controls);
        Ok(())
    }

    fn modify(
        &mut self,
        dn: &str,
        mods: &[Modification],
        controls: &[Control],
    ) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(DirectoryError::Unavailable("not connected".into()));
        }
        if let Some(err) = state.fail_mutations.pop_front() {
            return Err(err);
        }
        let dn = normalize_dn(dn);
        let Some(old) = state.entries.get(&dn) else {
            return Err(DirectoryError::NoSuchObject(dn));
        };
        let new = apply_modifications(old, mods);
        state.entries.insert(dn.clone(), new);
        state.apply_controls(&dn, controls);
        Ok(())
    }

    fn del(&mut self, dn: &str, controls: &[Control]) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(DirectoryError::Unavailable("not connected".into()));
        }
        if let Some(err) = state.fail_mutations.pop_front() {
            return Err(err);
        }
        let dn = normalize_dn(dn);
        if !state.entries.contains_key(&dn) {
            return Err(DirectoryError::NoSuchObject(dn));
        }
        let child_suffix = format!(", {dn}");
        if state.entries.keys().any(|k| k.ends_with(&child_suffix)) {
            return Err(DirectoryError::NotAllowedOnNonLeaf(dn));
        }
        state.entries.remove(&dn);
        state.apply_controls(&dn, controls);
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedState {
    version: u32,
    connected: bool,
    changes: BTreeMap<u64, Change>,
    /// Next N polls report a previous call still in flight.
    inflight_polls: u32,
    fail_connects: VecDeque<DirectoryError>,
    polls: u32,
}

/// Scripted upstream directory serving a fixed changelog.
pub struct ScriptedRemote {
    identity: RemoteIdentity,
    queries: Vec<Box<dyn Matcher>>,
    raw_queries: Vec<String>,
    shared: Arc<Mutex<ScriptedState>>,
}

/// Test-side handle to a `ScriptedRemote` owned by the replicator.
#[derive(Clone)]
pub struct RemoteHandle {
    shared: Arc<Mutex<ScriptedState>>,
}

impl ScriptedRemote {
    pub fn new(url: &str, uuid: Option<Uuid>, version: u32) -> Self {
        Self {
            identity: RemoteIdentity {
                url: url.to_string(),
                uuid,
            },
            queries: Vec::new(),
            raw_queries: Vec::new(),
            shared: Arc::new(Mutex::new(ScriptedState {
                version,
                ..ScriptedState::default()
            })),
        }
    }

    pub fn with_query(mut self, raw: &str, matcher: Filter) -> Self {
        self.raw_queries.push(raw.to_string());
        self.queries.push(Box::new(matcher));
        self
    }

    pub fn handle(&self) -> RemoteHandle {
        RemoteHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl RemoteHandle {
    fn lock(&self) -> MutexGuard<'_, ScriptedState> {
        self.shared.lock().expect("scripted remote lock")
    }

    pub fn push_change(&self, change: Change) {
        self.lock().changes.insert(change.changenumber, change);
    }

    pub fn set_version(&self, version: u32) {
        self.lock().version = version;
    }

    /// Make the next `polls` calls report an in-flight rejection.
    pub fn report_inflight(&self, polls: u32) {
        self.lock().inflight_polls = polls;
    }

    pub fn fail_next_connect(&self, err: DirectoryError) {
        self.lock().fail_connects.push_back(err);
    }

    pub fn polls(&self) -> u32 {
        self.lock().polls
    }
}

impl RemoteDirectory for ScriptedRemote {
    fn identity(&self) -> &RemoteIdentity {
        &self.identity
    }

    fn version(&self) -> u32 {
        self.shared.lock().expect("scripted remote lock").version
    }

    fn queries(&self) -> &[Box<dyn Matcher>] {
        &self.queries
    }

    fn raw_queries(&self) -> &[String] {
        &self.raw_queries
    }

    fn connect(&mut self) -> Result<(), DirectoryError> {
        let mut state = self.shared.lock().expect("scripted remote lock");
        if let Some(err) = state.fail_connects.pop_front() {
            return Err(err);
        }
        state.connected = true;
        Ok(())
    }

    fn unbind(&mut self) {
        self.shared.lock().expect("scripted remote lock").connected = false;
    }

    fn destroy(&mut self) {
        self.shared.lock().expect("scripted remote lock").connected = false;
    }

    fn connected(&self) -> bool {
        self.shared.lock().expect("scripted remote lock").connected
    }

    fn poll(
        &mut self,
        start: u64,
        end: u64,
        sink: &mut dyn FnMut(Change),
    ) -> Result<PollOutcome, DirectoryError> {
        let window: Vec<Change> = {
            let mut state = self.shared.lock().expect("scripted remote lock");
            state.polls += 1;
            if state.inflight_polls > 0 {
                state.inflight_polls -= 1;
                return Ok(PollOutcome::InFlight);
            }
            state
                .changes
                .range(start..=end)
                .map(|(_, change)| change.clone())
                .collect()
        };

        let Some(last) = window.last().map(|change| change.changenumber) else {
            return Ok(PollOutcome::CaughtUp);
        };
        for change in window {
            sink(change);
        }
        Ok(PollOutcome::Fetched { last })
    }
}

/// Everything a replicator emitted, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObservedEvent {
    Connect,
    Poll,
    Caughtup { url: String, changenumber: u64 },
    Error(String),
    Destroy,
}

/// Observer recording every signal for later assertions.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<ObservedEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: ObservedEvent) {
        self.events.lock().expect("observer lock").push(event);
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().expect("observer lock").clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ObservedEvent::Error(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn caughtups(&self) -> Vec<(String, u64)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ObservedEvent::Caughtup { url, changenumber } => Some((url, changenumber)),
                _ => None,
            })
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| **event == ObservedEvent::Connect)
            .count()
    }

    pub fn polls(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| **event == ObservedEvent::Poll)
            .count()
    }

    pub fn destroyed(&self) -> bool {
        self.events().contains(&ObservedEvent::Destroy)
    }
}

impl ReplicatorObserver for RecordingObserver {
    fn on_connect(&mut self) {
        self.push(ObservedEvent::Connect);
    }

    fn on_poll(&mut self) {
        self.push(ObservedEvent::Poll);
    }

    fn on_caughtup(&mut self, url: &str, changenumber: u64) {
        self.push(ObservedEvent::Caughtup {
            url: url.to_string(),
            changenumber,
        });
    }

    fn on_error(&mut self, err: &Error) {
        self.push(ObservedEvent::Error(err.to_string()));
    }

    fn on_destroy(&mut self) {
        self.push(ObservedEvent::Destroy);
    }
}

//! End-to-end replication scenarios against the in-memory harness.
//!
//! Every scenario drives a real `Replicator` over a `MemoryDirectory` and
//! one or more `ScriptedRemote`s, asserting the externally observable
//! contract: directory contents, checkpoint positions, and emitted signals.

use ldap_replicator::config::Config;
use ldap_replicator::directory::{Attrs, DirectoryError, Filter, Modification};
use ldap_replicator::remote::{Change, ChangePayload};
use ldap_replicator::replicator::{Replicator, State};
use ldap_replicator::test_harness::{
    MemoryDirectory, RecordingObserver, RemoteHandle, ScriptedRemote,
};
use uuid::Uuid;

const R1: &str = "ldaps://r1";
const R1_UUID: Uuid = Uuid::from_bytes([0xa1; 16]);

struct Fixture {
    dir: MemoryDirectory,
    observer: RecordingObserver,
    remote: RemoteHandle,
    repl: Replicator<MemoryDirectory>,
}

fn fixture(remote: ScriptedRemote) -> Fixture {
    let dir = MemoryDirectory::new(5);
    let observer = RecordingObserver::new();
    let handle = remote.handle();
    let mut repl = Replicator::new(Config::default(), dir.clone(), Box::new(observer.clone()));
    repl.add_remote(Box::new(remote)).expect("add remote");
    Fixture {
        dir,
        observer,
        remote: handle,
        repl,
    }
}

fn person_remote() -> ScriptedRemote {
    ScriptedRemote::new(R1, Some(R1_UUID), 5)
        .with_query("(objectclass=sdcperson)", Filter::eq("objectclass", "sdcperson"))
}

fn person(cn: &str) -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert("objectclass".into(), vec!["sdcperson".into()]);
    attrs.insert("cn".into(), vec![cn.to_string()]);
    attrs
}

fn add(changenumber: u64, dn: &str, attrs: Attrs) -> Change {
    Change {
        changenumber,
        targetdn: dn.to_string(),
        payload: ChangePayload::Add(attrs),
    }
}

fn modify(changenumber: u64, dn: &str, mods: Vec<Modification>) -> Change {
    Change {
        changenumber,
        targetdn: dn.to_string(),
        payload: ChangePayload::Modify(mods),
    }
}

fn delete(changenumber: u64, dn: &str) -> Change {
    Change {
        changenumber,
        targetdn: dn.to_string(),
        payload: ChangePayload::Delete,
    }
}

// S1: fresh bootstrap creates the checkpoint and reports caughtup.
#[test]
fn fresh_bootstrap_creates_checkpoint() {
    let mut f = fixture(person_remote());
    f.repl.start().expect("start");

    let dn = format!("uuid={R1_UUID}, o=smartdc");
    assert_eq!(f.repl.checkpoint_dn(R1), Some(dn.clone()));
    let record = f.dir.entry(&dn).expect("checkpoint record");
    assert_eq!(record.get("changenumber").unwrap(), &["0"]);
    assert_eq!(record.get("objectclass").unwrap(), &["sdcreplcheckpoint"]);
    assert_eq!(record.get("url").unwrap(), &[R1]);
    assert_eq!(record.get("query").unwrap(), &["(objectclass=sdcperson)"]);

    assert_eq!(f.repl.state(), State::Poll);
    assert_eq!(f.observer.caughtups(), vec![(R1.to_string(), 0)]);
    assert!(f.observer.errors().is_empty());
}

// S2: an add replayed over existing state converges, and the checkpoint
// lands on the last changenumber.
#[test]
fn add_then_replay_converges() {
    let mut f = fixture(person_remote());
    f.remote.push_change(add(1, "uid=x, o=smartdc", person("x")));
    f.remote.push_change(add(2, "uid=x, o=smartdc", person("x")));

    f.repl.start().expect("start");

    let entry = f.dir.entry("uid=x, o=smartdc").expect("entry");
    assert_eq!(entry.get("cn").unwrap(), &["x"]);
    let dn = f.repl.checkpoint_dn(R1).expect("checkpoint dn");
    assert_eq!(f.dir.changenumber(&dn), Some(2));
    assert!(f.observer.errors().is_empty());
}

// S3: a modify that drops the entry out of the acceptance filter deletes it.
#[test]
fn modify_with_filter_drop_deletes() {
    let mut f = fixture(person_remote());
    f.dir.insert("uid=y, o=smartdc", person("y"));
    f.remote.push_change(modify(
        7,
        "uid=y, o=smartdc",
        vec![Modification::replace("objectclass", vec!["sdcother".into()])],
    ));

    f.repl.start().expect("start");

    assert!(f.dir.entry("uid=y, o=smartdc").is_none());
    let dn = f.repl.checkpoint_dn(R1).expect("checkpoint dn");
    assert_eq!(f.dir.changenumber(&dn), Some(7));
    assert!(f.observer.errors().is_empty());
}

// S4: deleting a non-leaf entry warns, leaves it in place, and still
// advances the checkpoint.
#[test]
fn delete_of_non_leaf_advances_checkpoint() {
    let remote = ScriptedRemote::new(R1, Some(R1_UUID), 5).with_query(
        "(objectclass=organizationalunit)",
        Filter::eq("objectclass", "organizationalunit"),
    );
    let mut f = fixture(remote);
    let mut ou = Attrs::new();
    ou.insert("objectclass".into(), vec!["organizationalunit".into()]);
    f.dir.insert("ou=users, o=smartdc", ou);
    f.dir.insert("uid=a, ou=users, o=smartdc", person("a"));
    f.remote.push_change(delete(9, "ou=users, o=smartdc"));

    f.repl.start().expect("start");

    assert!(f.dir.entry("ou=users, o=smartdc").is_some());
    assert!(f.dir.entry("uid=a, ou=users, o=smartdc").is_some());
    let dn = f.repl.checkpoint_dn(R1).expect("checkpoint dn");
    assert_eq!(f.dir.changenumber(&dn), Some(9));
    assert!(f.observer.errors().is_empty());
}

// S5: a remote newer than the local server is fatal and arms the init
// backoff.
#[test]
fn version_skew_at_startup_suspends_with_backoff() {
    let remote = ScriptedRemote::new(R1, Some(R1_UUID), 6);
    let mut f = fixture(remote);
    f.remote.push_change(add(1, "uid=x, o=smartdc", person("x")));

    f.repl.start().expect("start");

    assert!(
        f.observer
            .errors()
            .iter()
            .any(|e| e.contains("version mismatch"))
    );
    assert_eq!(f.repl.state(), State::Wait);
    assert!(f.repl.backoff_armed());
    assert!(f.dir.entry("uid=x, o=smartdc").is_none());
}

#[test]
fn version_skew_mid_flight_suspends_with_backoff() {
    let mut f = fixture(person_remote());
    f.repl.start().expect("start");
    assert_eq!(f.repl.state(), State::Poll);

    f.remote.set_version(6);
    f.repl.poll(None);

    assert!(
        f.observer
            .errors()
            .iter()
            .any(|e| e.contains("version mismatch"))
    );
    assert_eq!(f.repl.state(), State::Wait);
    assert!(f.repl.backoff_armed());
}

// S6: three consecutive failures on one change emit a fatal error and the
// checkpoint never moves past the previous change.
#[test]
fn retry_exhaustion_stops_the_stream() {
    let mut f = fixture(person_remote());
    f.remote.push_change(add(11, "uid=a, o=smartdc", person("a")));
    f.repl.start().expect("start");
    let dn = f.repl.checkpoint_dn(R1).expect("checkpoint dn");
    assert_eq!(f.dir.changenumber(&dn), Some(11));

    f.dir.fail_next_mutations(vec![
        DirectoryError::Other("disk on fire".into()),
        DirectoryError::Other("disk on fire".into()),
        DirectoryError::Other("disk on fire".into()),
    ]);
    f.remote.push_change(add(12, "uid=b, o=smartdc", person("b")));
    f.repl.poll(None);

    assert!(
        f.observer
            .errors()
            .iter()
            .any(|e| e.contains("failed after 3 attempts"))
    );
    assert_eq!(f.dir.changenumber(&dn), Some(11));
    assert!(f.dir.entry("uid=b, o=smartdc").is_none());
    assert_eq!(f.repl.state(), State::Process);
}

// A transient failure below the retry budget is retried in place.
#[test]
fn retries_below_budget_succeed() {
    let mut f = fixture(person_remote());
    f.dir.fail_next_mutations(vec![
        DirectoryError::Other("flake".into()),
        DirectoryError::Other("flake".into()),
    ]);
    f.remote.push_change(add(1, "uid=x, o=smartdc", person("x")));

    f.repl.start().expect("start");

    assert!(f.dir.entry("uid=x, o=smartdc").is_some());
    let dn = f.repl.checkpoint_dn(R1).expect("checkpoint dn");
    assert_eq!(f.dir.changenumber(&dn), Some(1));
    assert!(f.observer.errors().is_empty());
}

// Property: the data write and the checkpoint bump are visible together or
// not at all.
#[test]
fn coupled_commit_never_shows_half_a_change() {
    let mut f = fixture(person_remote());
    f.dir.fail_next_mutations(vec![
        DirectoryError::Other("boom".into()),
        DirectoryError::Other("boom".into()),
        DirectoryError::Other("boom".into()),
    ]);
    f.remote.push_change(add(1, "uid=x, o=smartdc", person("x")));

    f.repl.start().expect("start");

    let dn = f.repl.checkpoint_dn(R1).expect("checkpoint dn");
    assert_eq!(f.dir.changenumber(&dn), Some(0));
    assert!(f.dir.entry("uid=x, o=smartdc").is_none());
}

// Property: per-remote changes apply in changenumber order.
#[test]
fn changes_apply_in_changenumber_order() {
    let mut f = fixture(person_remote());
    f.remote.push_change(add(1, "uid=x, o=smartdc", person("one")));
    f.remote.push_change(modify(
        2,
        "uid=x, o=smartdc",
        vec![Modification::replace("cn", vec!["two".into()])],
    ));
    f.remote.push_change(modify(
        3,
        "uid=x, o=smartdc",
        vec![Modification::replace("cn", vec!["three".into()])],
    ));

    f.repl.start().expect("start");

    let entry = f.dir.entry("uid=x, o=smartdc").expect("entry");
    assert_eq!(entry.get("cn").unwrap(), &["three"]);
    let applied: Vec<u64> = f.dir.hints().iter().map(|h| h.changenumber).collect();
    assert_eq!(applied, vec![1, 2, 3]);
    assert!(f.dir.hints().iter().all(|h| h.uuid == R1_UUID));
}

// Property: a poll rejected as in-flight enqueues nothing; the next pass
// picks the window up exactly once.
#[test]
fn inflight_poll_never_double_enqueues() {
    let mut f = fixture(person_remote());
    f.remote.push_change(add(1, "uid=x, o=smartdc", person("x")));
    f.remote.report_inflight(1);

    f.repl.start().expect("start");
    assert!(f.dir.entry("uid=x, o=smartdc").is_none());
    assert!(f.observer.caughtups().is_empty());

    f.repl.poll(None);
    assert!(f.dir.entry("uid=x, o=smartdc").is_some());
    assert_eq!(f.dir.hints().len(), 1);

    f.repl.poll(None);
    assert_eq!(f.dir.hints().len(), 1);
    assert_eq!(f.observer.caughtups(), vec![(R1.to_string(), 1)]);
}

// Remotes are independent streams with independent checkpoint schemas.
#[test]
fn remotes_track_independent_checkpoints() {
    let dir = MemoryDirectory::new(5);
    let observer = RecordingObserver::new();
    let mut repl = Replicator::new(Config::default(), dir.clone(), Box::new(observer.clone()));

    let r1 = ScriptedRemote::new(R1, Some(R1_UUID), 5);
    let h1 = r1.handle();
    h1.push_change(add(1, "uid=x, o=smartdc", person("x")));
    repl.add_remote(Box::new(r1)).expect("add r1");

    let r2 = ScriptedRemote::new("ldaps://r2", None, 5);
    let h2 = r2.handle();
    h2.push_change(add(5, "uid=y, o=smartdc", person("y")));
    repl.add_remote(Box::new(r2)).expect("add r2");

    repl.start().expect("start");

    assert!(dir.entry("uid=x, o=smartdc").is_some());
    assert!(dir.entry("uid=y, o=smartdc").is_some());

    let dn1 = repl.checkpoint_dn(R1).expect("r1 checkpoint");
    assert!(dn1.starts_with("uuid="));
    assert_eq!(dir.changenumber(&dn1), Some(1));

    let dn2 = repl.checkpoint_dn("ldaps://r2").expect("r2 checkpoint");
    let hashed = format!("{:x}", md5::compute("ldaps://r2".as_bytes()));
    assert_eq!(dn2, format!("uid={hashed}, o=smartdc"));
    assert_eq!(dir.changenumber(&dn2), Some(5));

    // Only the uuid-bearing remote tags its writes.
    assert!(dir.hints().iter().all(|h| h.uuid == R1_UUID));
    let mut caughtups = observer.caughtups();
    caughtups.sort();
    assert_eq!(
        caughtups,
        vec![(R1.to_string(), 1), ("ldaps://r2".to_string(), 5)]
    );
}

// An availability error suspends, reconnects, and replays from the
// checkpoint.
#[test]
fn unavailable_suspends_then_recovers() {
    let mut f = fixture(person_remote());
    f.dir
        .fail_next_mutations(vec![DirectoryError::Unavailable("maintenance".into())]);
    f.remote.push_change(add(1, "uid=x, o=smartdc", person("x")));

    f.repl.start().expect("start");

    assert!(f.dir.entry("uid=x, o=smartdc").is_some());
    let dn = f.repl.checkpoint_dn(R1).expect("checkpoint dn");
    assert_eq!(f.dir.changenumber(&dn), Some(1));
    assert_eq!(f.dir.connects(), 2);
    assert_eq!(f.observer.connects(), 2);
    assert!(f.observer.errors().is_empty());
    assert_eq!(f.repl.state(), State::Poll);
    assert!(!f.repl.backoff_armed());
}

// A connection-close event suspends without backoff and resumes through
// the client's own reconnect.
#[test]
fn close_event_resumes_without_backoff() {
    let mut f = fixture(person_remote());
    f.repl.start().expect("start");
    assert_eq!(f.repl.state(), State::Poll);

    f.repl.handle_close();

    assert_eq!(f.repl.state(), State::Poll);
    assert_eq!(f.dir.connects(), 2);
    assert!(!f.repl.backoff_armed());
}

// A checkpoint-init failure suspends with backoff; firing the backoff
// resumes and completes startup.
#[test]
fn checkpoint_init_failure_backs_off_then_recovers() {
    let mut f = fixture(person_remote());
    f.dir
        .fail_next_searches(vec![DirectoryError::Other("index rebuild".into())]);

    f.repl.start().expect("start");

    assert!(!f.observer.errors().is_empty());
    assert_eq!(f.repl.state(), State::Wait);
    assert!(f.repl.backoff_armed());

    let due = f.repl.next_deadline().expect("backoff deadline");
    f.repl.on_timer(due);

    assert_eq!(f.repl.state(), State::Poll);
    assert!(!f.repl.backoff_armed());
    assert_eq!(f.observer.caughtups(), vec![(R1.to_string(), 0)]);
}

// A restart resumes from the stored checkpoint rather than replaying the
// whole changelog.
#[test]
fn restart_resumes_from_checkpoint() {
    let dir = MemoryDirectory::new(5);
    {
        let remote = person_remote();
        let handle = remote.handle();
        handle.push_change(add(1, "uid=x, o=smartdc", person("x")));
        handle.push_change(add(2, "uid=y, o=smartdc", person("y")));
        let mut repl = Replicator::new(
            Config::default(),
            dir.clone(),
            Box::new(RecordingObserver::new()),
        );
        repl.add_remote(Box::new(remote)).expect("add remote");
        repl.start().expect("start");
        repl.destroy();
    }

    let before = dir.hints().len();
    let remote = person_remote();
    let handle = remote.handle();
    for cn in 1..=4 {
        handle.push_change(add(cn, &format!("uid=u{cn}, o=smartdc"), person("u")));
    }
    let observer = RecordingObserver::new();
    let mut repl = Replicator::new(Config::default(), dir.clone(), Box::new(observer.clone()));
    repl.add_remote(Box::new(remote)).expect("add remote");
    repl.start().expect("start");

    let replayed: Vec<u64> = dir.hints()[before..].iter().map(|h| h.changenumber).collect();
    assert_eq!(replayed, vec![3, 4]);
    let dn = repl.checkpoint_dn(R1).expect("checkpoint dn");
    assert_eq!(dir.changenumber(&dn), Some(4));
}

// A fatal local setup error (server too old for the checkpoint-update
// control) surfaces and leaves the replicator waiting, without backoff.
#[test]
fn fatal_local_setup_error_stays_in_wait() {
    let mut f = fixture(person_remote());
    f.dir.fail_next_connect(DirectoryError::VersionTooOld(
        "morayVersion missing".into(),
    ));

    f.repl.start().expect("start");

    assert!(
        f.observer
            .errors()
            .iter()
            .any(|e| e.contains("version too old"))
    );
    assert_eq!(f.repl.state(), State::Wait);
    assert!(!f.repl.backoff_armed());
}

// The poll timer keeps passes coming and picks up late changes.
#[test]
fn poll_timer_picks_up_new_changes() {
    let mut f = fixture(person_remote());
    f.repl.start().expect("start");
    assert_eq!(f.observer.caughtups(), vec![(R1.to_string(), 0)]);

    f.remote.push_change(add(1, "uid=x, o=smartdc", person("x")));
    let due = f.repl.next_deadline().expect("poll deadline");
    f.repl.on_timer(due);

    assert!(f.dir.entry("uid=x, o=smartdc").is_some());
    assert_eq!(
        f.observer.caughtups(),
        vec![(R1.to_string(), 0), (R1.to_string(), 1)]
    );
}

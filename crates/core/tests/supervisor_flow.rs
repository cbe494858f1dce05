// End-to-end supervisor run over a scripted working tree: a real child
// process, a real database, and a diff source that replays a planned
// sequence of dirty sets.

#![cfg(unix)]

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use leasehold_core::observer::DiffSource;
use leasehold_core::store::events::EventLog;
use leasehold_core::{LeaseDb, ProcessSupervisor, SupervisorOptions};
use serde_json::json;

/// Replays a fixed sequence of dirty sets, holding the last one forever.
struct ScriptedDiff {
    frames: Vec<BTreeSet<String>>,
    cursor: Mutex<usize>,
}

impl ScriptedDiff {
    fn new(frames: Vec<&[&str]>) -> Self {
        let frames = frames
            .into_iter()
            .map(|paths| paths.iter().map(|s| s.to_string()).collect())
            .collect();
        Self { frames, cursor: Mutex::new(0) }
    }
}

impl DiffSource for ScriptedDiff {
    fn dirty_paths(&self) -> BTreeSet<String> {
        let mut cursor = self.cursor.lock().expect("cursor lock should work");
        let frame = self.frames[*cursor].clone();
        if *cursor + 1 < self.frames.len() {
            *cursor += 1;
        }
        frame
    }
}

#[tokio::test]
async fn session_edits_are_leased_and_released_around_the_child() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let db_path = dir.path().join("leasehold.db");

    // Frame 0 is the pre-session baseline: notes.py was already dirty.
    // The session then touches scratch.py and later reverts it.
    let diff = ScriptedDiff::new(vec![
        &["notes.py"],
        &["notes.py", "scratch.py"],
        &["notes.py"],
    ]);

    let options = SupervisorOptions {
        client: Some("claude".to_string()),
        command: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 1".to_string()],
        db_path: db_path.clone(),
        poll_interval: Duration::from_millis(50),
        ttl: Duration::from_secs(300),
        description: None,
        cleanup_interval: Duration::from_secs(60),
        heartbeat_interval: Duration::from_secs(10),
        stale_after: Duration::from_secs(90),
    };

    let supervisor =
        ProcessSupervisor::with_diff_source(options, dir.path().to_path_buf(), diff);
    let exit_code = supervisor.run().await.expect("supervised run should succeed");
    assert_eq!(exit_code, 0);

    let db = LeaseDb::open(&db_path).expect("lease db should reopen");

    // scratch.py was leased exactly once and released when it went clean
    let events = EventLog::recent(db.connection(), 100).expect("events should read");
    let acquired: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "auto_lock_acquired")
        .collect();
    assert_eq!(acquired.len(), 1);
    assert_eq!(acquired[0].details, Some(json!({ "file": "scratch.py" })));

    let released: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "auto_lock_released_clean")
        .collect();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].details, Some(json!({ "file": "scratch.py" })));

    // teardown ran with nothing left to release
    let exits: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "auto_lock_released_exit")
        .collect();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].details, Some(json!({ "released": 0, "exit_code": 0 })));

    // the baseline file was never touched by coordination
    let notes_rows: i64 = db
        .connection()
        .query_row(
            "SELECT COUNT(*) FROM file_leases WHERE resource_path = 'notes.py'",
            [],
            |row| row.get(0),
        )
        .expect("lease count query should succeed");
    assert_eq!(notes_rows, 0);

    // no active lease survives the session
    let active_rows: i64 = db
        .connection()
        .query_row("SELECT COUNT(*) FROM file_leases WHERE status = 'active'", [], |row| {
            row.get(0)
        })
        .expect("lease count query should succeed");
    assert_eq!(active_rows, 0);

    // the agent row was registered and demoted on exit
    let inactive_agents: i64 = db
        .connection()
        .query_row("SELECT COUNT(*) FROM agents WHERE status = 'inactive'", [], |row| row.get(0))
        .expect("agent count query should succeed");
    assert_eq!(inactive_agents, 1);
}

#[tokio::test]
async fn child_exit_code_is_propagated() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let options = SupervisorOptions {
        client: Some("codex".to_string()),
        command: vec!["/bin/sh".to_string(), "-c".to_string(), "exit 7".to_string()],
        db_path: dir.path().join("leasehold.db"),
        poll_interval: Duration::from_millis(50),
        ttl: Duration::from_secs(300),
        description: None,
        cleanup_interval: Duration::from_secs(60),
        heartbeat_interval: Duration::from_secs(10),
        stale_after: Duration::from_secs(90),
    };

    let supervisor = ProcessSupervisor::with_diff_source(
        options,
        dir.path().to_path_buf(),
        ScriptedDiff::new(vec![&[]]),
    );
    let exit_code = supervisor.run().await.expect("supervised run should succeed");
    assert_eq!(exit_code, 7);
}

#[tokio::test]
async fn missing_command_fails_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let options = SupervisorOptions {
        client: None,
        command: vec!["/nonexistent/definitely-not-a-binary".to_string()],
        db_path: dir.path().join("leasehold.db"),
        poll_interval: Duration::from_millis(50),
        ttl: Duration::from_secs(300),
        description: None,
        cleanup_interval: Duration::from_secs(60),
        heartbeat_interval: Duration::from_secs(10),
        stale_after: Duration::from_secs(90),
    };

    let supervisor = ProcessSupervisor::with_diff_source(
        options,
        dir.path().to_path_buf(),
        ScriptedDiff::new(vec![&[]]),
    );
    assert!(supervisor.run().await.is_err());
}

use runcoach::checkpoint::{CheckpointStore, DirectCheckpointSink};
use runcoach::config::TrackerConfig;
use runcoach::controller::{ControllerDeps, SampleOutcome, SessionController, TrackingState};
use runcoach::database::SqliteKeyValueStore;
use runcoach::external::{
    Clock, CountingKeepAlive, ManualClock, ManualPositionSource, MemorySessionStore, NoopKeepAlive,
    RecordingVoiceCoach,
};
use runcoach::models::LocationSample;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

/// Crash and restart cycles against an on-disk checkpoint database.
/// Each "process" opens its own connection to the same file.

const T0: i64 = 1_700_000_000_000;
const HOUR_MS: i64 = 60 * 60 * 1000;
const METERS_PER_DEG_LAT: f64 = 111_194.926_644_558_7;

fn north(meters: f64, secs: i64) -> LocationSample {
    LocationSample::new(46.0 + meters / METERS_PER_DEG_LAT, 8.0, 5.0, T0 + secs * 1_000)
}

fn open_store(db_path: &Path, clock: Arc<ManualClock>) -> Arc<CheckpointStore> {
    Arc::new(CheckpointStore::new(
        Arc::new(SqliteKeyValueStore::open(db_path).unwrap()),
        clock,
        TrackerConfig::default().checkpoint,
    ))
}

fn controller(store: Arc<CheckpointStore>, clock: Arc<ManualClock>) -> SessionController {
    SessionController::new(
        &TrackerConfig::default(),
        ControllerDeps {
            session_store: Arc::new(MemorySessionStore::new()),
            voice: Arc::new(RecordingVoiceCoach::new()),
            keep_alive: Arc::new(NoopKeepAlive),
            checkpoints: Arc::new(DirectCheckpointSink::new(store)),
            clock,
        },
    )
}

/// Run 1.2 km and "crash" without stopping; returns the session id
fn crashed_run(db_path: &Path, clock: Arc<ManualClock>) -> String {
    let store = open_store(db_path, clock.clone());
    let mut controller = controller(store, clock);
    let (source, _handle) = ManualPositionSource::pair();

    let id = controller.start("runner", &source).unwrap();
    for i in 0..=400 {
        controller.process_sample(north(i as f64 * 3.0, i)).unwrap();
    }
    id
}

#[test]
fn test_restart_one_hour_later_resumes_active() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("runcoach.db");
    let clock = Arc::new(ManualClock::new(T0));
    let session_id = crashed_run(&db_path, clock.clone());

    // First restart: counter goes 0 -> 1, then that process dies too
    clock.advance(10 * 60 * 1000);
    let first = open_store(&db_path, clock.clone())
        .get_recovery_snapshot()
        .unwrap()
        .unwrap();
    assert_eq!(first.crash_attempts, 1);

    // Second restart an hour after the last checkpoint
    clock.set(first.last_update_time + HOUR_MS);
    let store = open_store(&db_path, clock.clone());
    let snapshot = store.get_recovery_snapshot().unwrap().unwrap();
    assert_eq!(snapshot.crash_attempts, 2);
    assert_eq!(snapshot.session_id, session_id);
    assert_eq!(snapshot.locations.len(), 400);

    let voice = Arc::new(RecordingVoiceCoach::new());
    let keep_alive = Arc::new(CountingKeepAlive::new());
    let mut resumed = SessionController::new(
        &TrackerConfig::default(),
        ControllerDeps {
            session_store: Arc::new(MemorySessionStore::new()),
            voice: voice.clone(),
            keep_alive: keep_alive.clone(),
            checkpoints: Arc::new(DirectCheckpointSink::new(store.clone())),
            clock: clock.clone(),
        },
    );
    assert_eq!(resumed.restore(snapshot).unwrap(), session_id);
    assert_eq!(resumed.state(), TrackingState::Active);
    assert_eq!(keep_alive.held(), 1);

    // The 1 km milestone was passed before the crash
    let outcome = resumed.process_sample(north(1_210.0, 405)).unwrap();
    assert!(matches!(outcome, SampleOutcome::Accepted { .. }));
    assert!(voice
        .messages()
        .iter()
        .all(|m| !m.starts_with("1 kilometer")));

    resumed.stop().unwrap();
    assert!(store.get_recovery_snapshot().unwrap().is_none());
}

#[test]
fn test_snapshot_older_than_a_day_is_discarded() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("runcoach.db");
    let clock = Arc::new(ManualClock::new(T0));
    crashed_run(&db_path, clock.clone());

    clock.advance(25 * HOUR_MS);
    let store = open_store(&db_path, clock.clone());
    assert!(store.get_recovery_snapshot().unwrap().is_none());

    let diag = store.peek_diagnostics().unwrap();
    assert!(!diag.has_recoverable_session);
    assert!(diag.last_error.is_some());
}

#[test]
fn test_crash_loop_gives_up_after_three_attempts() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("runcoach.db");
    let clock = Arc::new(ManualClock::new(T0));
    crashed_run(&db_path, clock.clone());

    for attempt in 1..=3 {
        clock.advance(60_000);
        let snapshot = open_store(&db_path, clock.clone())
            .get_recovery_snapshot()
            .unwrap()
            .expect("snapshot should still be recoverable");
        assert_eq!(snapshot.crash_attempts, attempt);
    }

    clock.advance(60_000);
    let store = open_store(&db_path, clock.clone());
    assert!(store.get_recovery_snapshot().unwrap().is_none());
    assert!(!store.peek_diagnostics().unwrap().has_recoverable_session);
}

#[test]
fn test_resumed_session_keeps_checkpointing() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("runcoach.db");
    let clock = Arc::new(ManualClock::new(T0));
    crashed_run(&db_path, clock.clone());

    clock.advance(5 * 60 * 1000);
    let store = open_store(&db_path, clock.clone());
    let snapshot = store.get_recovery_snapshot().unwrap().unwrap();
    let mut resumed = controller(store.clone(), clock.clone());
    resumed.restore(snapshot).unwrap();

    // 10 more accepted samples write a fresh checkpoint
    for i in 1..=10 {
        resumed
            .process_sample(north(1_200.0 + i as f64 * 3.0, 700 + i))
            .unwrap();
    }

    let diag = store.peek_diagnostics().unwrap();
    assert!(diag.has_recoverable_session);
    assert_eq!(diag.last_checkpoint_time, Some(clock.now_ms()));

    let next = store.get_recovery_snapshot().unwrap().unwrap();
    assert_eq!(next.locations.len(), 410);
    assert!(next
        .locations
        .windows(2)
        .all(|w| w[0].timestamp < w[1].timestamp));
    assert!(resumed.metrics().distance_meters > 1_200.0);
}

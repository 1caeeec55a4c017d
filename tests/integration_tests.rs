use runcoach::checkpoint::{CheckpointStore, DirectCheckpointSink};
use runcoach::config::TrackerConfig;
use runcoach::controller::{ControllerDeps, SampleOutcome, SessionController, TrackingState};
use runcoach::database::{RunDatabase, SqliteKeyValueStore};
use runcoach::external::{
    CountingKeepAlive, ManualClock, ManualPositionSource, RecordingVoiceCoach, SessionStore,
};
use runcoach::models::{LocationSample, SessionStatus, TriggerPriority, TriggerType};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

/// End-to-end runs through the controller with SQLite-backed stores

const T0: i64 = 1_700_000_000_000;
const METERS_PER_DEG_LAT: f64 = 111_194.926_644_558_7;

struct Run {
    controller: SessionController,
    source: ManualPositionSource,
    voice: Arc<RecordingVoiceCoach>,
    keep_alive: Arc<CountingKeepAlive>,
    runs: Arc<RunDatabase>,
    checkpoints: Arc<CheckpointStore>,
    _dir: TempDir,
}

fn run_with(config: TrackerConfig) -> Run {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("runcoach.db");
    let clock = Arc::new(ManualClock::new(T0));

    let checkpoints = Arc::new(CheckpointStore::new(
        Arc::new(SqliteKeyValueStore::open(&db_path).unwrap()),
        clock.clone(),
        config.checkpoint.clone(),
    ));
    let runs = Arc::new(RunDatabase::new(&db_path).unwrap());
    let voice = Arc::new(RecordingVoiceCoach::new());
    let keep_alive = Arc::new(CountingKeepAlive::new());

    let controller = SessionController::new(
        &config,
        ControllerDeps {
            session_store: runs.clone(),
            voice: voice.clone(),
            keep_alive: keep_alive.clone(),
            checkpoints: Arc::new(DirectCheckpointSink::new(checkpoints.clone())),
            clock,
        },
    );
    let (source, _handle) = ManualPositionSource::pair();

    Run {
        controller,
        source,
        voice,
        keep_alive,
        runs,
        checkpoints,
        _dir: dir,
    }
}

/// Sample `meters` north of the start, `secs` after T0
fn north(meters: f64, secs: i64) -> LocationSample {
    LocationSample::new(46.0 + meters / METERS_PER_DEG_LAT, 8.0, 5.0, T0 + secs * 1_000)
}

#[test]
fn test_two_samples_eleven_meters_apart() {
    let mut config = TrackerConfig::default();
    config.coaching.target_pace = Some(5.0);
    let mut run = run_with(config);
    run.controller.start("runner", &run.source).unwrap();

    run.controller.process_sample(north(0.0, 0)).unwrap();
    let outcome = run.controller.process_sample(north(11.0, 1)).unwrap();

    match outcome {
        SampleOutcome::Accepted { metrics, triggers, .. } => {
            assert!((metrics.distance_meters - 11.0).abs() < 0.05);
            assert_eq!(metrics.duration_ms, 1_000);
            assert!(triggers.iter().all(|t| !t.trigger_type.is_pace_warning()));
        }
        other => panic!("expected acceptance, got {:?}", other),
    }
}

#[test]
fn test_full_run_is_persisted_and_checkpoint_cleared() {
    let mut run = run_with(TrackerConfig::default());
    let id = run.controller.start("runner", &run.source).unwrap();
    assert_eq!(run.keep_alive.held(), 1);

    // 1.2 km at 3 m/s, one sample per second
    for i in 0..=400 {
        run.controller
            .process_sample(north(i as f64 * 3.0, i))
            .unwrap();
    }
    assert!(run.checkpoints.peek_diagnostics().unwrap().has_recoverable_session);

    let summary = run.controller.stop().unwrap();
    assert!(summary.persisted);
    assert_eq!(run.controller.state(), TrackingState::Stopped);
    assert_eq!(run.keep_alive.held(), 0);

    let stored = run.runs.load(&id).unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Stopped);
    // End time comes from the clock, duration from the samples
    assert_eq!(stored.end_time, Some(T0));
    assert!((stored.distance_meters - 1_200.0).abs() < 1.0);
    assert_eq!(stored.duration_ms, 400_000);

    assert!(!run.checkpoints.peek_diagnostics().unwrap().has_recoverable_session);

    let milestones: Vec<_> = run
        .voice
        .messages()
        .into_iter()
        .filter(|m| m.starts_with("1 kilometer"))
        .collect();
    assert_eq!(milestones.len(), 1);
}

#[test]
fn test_too_fast_reported_once_then_quiet() {
    let mut config = TrackerConfig::default();
    config.coaching.target_pace = Some(5.0);
    let mut run = run_with(config);
    run.controller.start("runner", &run.source).unwrap();

    // 3:00/km for 40 seconds
    let speed = 1000.0 / 180.0;
    let mut pace_warnings = Vec::new();
    for i in 0..40 {
        let sample = north(i as f64 * speed, i).with_speed(speed);
        if let SampleOutcome::Accepted { triggers, .. } = run.controller.process_sample(sample).unwrap() {
            pace_warnings.extend(
                triggers
                    .into_iter()
                    .filter(|t| t.trigger_type == TriggerType::PaceTooFast),
            );
        }
    }

    assert_eq!(pace_warnings.len(), 1);
    assert_eq!(pace_warnings[0].priority, TriggerPriority::Urgent);
}

#[test]
fn test_noisy_samples_do_not_move_the_run() {
    let mut run = run_with(TrackerConfig::default());
    run.controller.start("runner", &run.source).unwrap();

    run.controller.process_sample(north(0.0, 0)).unwrap();
    run.controller.process_sample(north(10.0, 1)).unwrap();

    let mut jump = north(900.0, 2);
    jump.accuracy = 150.0;
    let outcome = run.controller.process_sample(jump).unwrap();
    assert!(matches!(outcome, SampleOutcome::Rejected(_)));

    let mut bogus = north(20.0, 3);
    bogus.latitude = 123.0;
    assert!(matches!(
        run.controller.process_sample(bogus).unwrap(),
        SampleOutcome::Rejected(_)
    ));

    assert_eq!(run.controller.history().len(), 2);
    assert!((run.controller.metrics().distance_meters - 10.0).abs() < 0.05);
    assert_eq!(run.controller.filter_stats().rejected(), 2);
}

#[test]
fn test_recent_runs_and_stats() {
    let mut run = run_with(TrackerConfig::default());

    for round in 0..3i64 {
        run.controller.start("runner", &run.source).unwrap();
        let offset = round * 10_000;
        for i in 0..=100 {
            run.controller
                .process_sample(north(i as f64 * 2.5, offset + i))
                .unwrap();
        }
        run.controller.stop().unwrap();
    }

    let recent = run.runs.recent_runs("runner", 2).unwrap();
    assert_eq!(recent.len(), 2);
    assert!(recent[0].start_time >= recent[1].start_time);

    let stats = run.runs.get_stats().unwrap();
    assert_eq!(stats.run_count, 3);
    assert!((stats.total_distance_meters - 750.0).abs() < 1.0);
}

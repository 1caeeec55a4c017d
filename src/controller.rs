//! Session lifecycle and canonical tracking state
//!
//! The controller is the only writer of session, history and metrics. It
//! runs the per-sample pipeline (filter, metrics, phase, coaching, voice,
//! checkpoint) synchronously and publishes a `TrackingSnapshot` on a `watch`
//! channel after every state change.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointRequest, CheckpointSink};
use crate::coaching::{next_phase, CoachingTriggerEngine};
use crate::config::{CoachingSettings, FilterSettings, TrackerConfig};
use crate::error::{Result, TrackingError};
use crate::external::{Clock, KeepAlive, KeepAliveGuard, PositionSource, SessionStore, VoiceCoach};
use crate::filter::{FilterDecision, FilterStats, PositionFilter, RejectReason};
use crate::metrics::MetricsCalculator;
use crate::models::{
    CoachingPhase, CoachingTrigger, LocationSample, RecoverySnapshot, RunMetrics, RunSession,
    SessionStatus, SignalQuality,
};

/// Lifecycle state as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackingState {
    Idle,
    Active,
    Paused,
    Stopped,
}

impl TrackingState {
    /// Active or paused: a session is in progress
    pub fn is_in_progress(&self) -> bool {
        matches!(self, TrackingState::Active | TrackingState::Paused)
    }

    fn as_status(&self) -> Option<SessionStatus> {
        match self {
            TrackingState::Idle => None,
            TrackingState::Active => Some(SessionStatus::Active),
            TrackingState::Paused => Some(SessionStatus::Paused),
            TrackingState::Stopped => Some(SessionStatus::Stopped),
        }
    }
}

impl std::fmt::Display for TrackingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackingState::Idle => write!(f, "IDLE"),
            TrackingState::Active => write!(f, "ACTIVE"),
            TrackingState::Paused => write!(f, "PAUSED"),
            TrackingState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Value published on the state channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSnapshot {
    pub state: TrackingState,
    pub session_id: Option<String>,
    pub metrics: RunMetrics,
    pub phase: CoachingPhase,
    pub signal_quality: SignalQuality,
    pub status: Option<String>,
    pub last_error: Option<String>,
}

impl TrackingSnapshot {
    pub fn idle() -> Self {
        Self {
            state: TrackingState::Idle,
            session_id: None,
            metrics: RunMetrics::default(),
            phase: CoachingPhase::Warmup,
            signal_quality: SignalQuality::Unknown,
            status: None,
            last_error: None,
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.state.is_in_progress()
    }
}

/// What happened to one raw sample
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// No active session; the sample was not looked at
    Ignored,
    Rejected(RejectReason),
    Accepted {
        metrics: RunMetrics,
        triggers: Vec<CoachingTrigger>,
        checkpointed: bool,
    },
}

/// Result of a successful stop
#[derive(Debug, Clone, PartialEq)]
pub struct StopSummary {
    pub session: RunSession,
    pub metrics: RunMetrics,
    /// Whether the session store accepted the finished run
    pub persisted: bool,
}

/// Collaborators the controller calls out to
#[derive(Clone)]
pub struct ControllerDeps {
    pub session_store: Arc<dyn SessionStore>,
    pub voice: Arc<dyn VoiceCoach>,
    pub keep_alive: Arc<dyn KeepAlive>,
    pub checkpoints: Arc<dyn CheckpointSink>,
    pub clock: Arc<dyn Clock>,
}

pub struct SessionController {
    deps: ControllerDeps,
    checkpoint_interval: u32,
    filter_settings: FilterSettings,
    coaching_settings: CoachingSettings,

    filter: PositionFilter,
    calculator: MetricsCalculator,
    engine: CoachingTriggerEngine,

    state: TrackingState,
    session: Option<RunSession>,
    history: Vec<LocationSample>,
    metrics: RunMetrics,
    phase: CoachingPhase,
    paused_at: Option<i64>,
    paused_ms: u64,
    accepted_since_checkpoint: u32,
    keep_alive: Option<KeepAliveGuard>,
    status: Option<String>,
    last_error: Option<String>,

    state_tx: watch::Sender<TrackingSnapshot>,
}

impl SessionController {
    pub fn new(config: &TrackerConfig, deps: ControllerDeps) -> Self {
        let (state_tx, _) = watch::channel(TrackingSnapshot::idle());

        Self {
            deps,
            checkpoint_interval: config.checkpoint.interval_samples.max(1),
            filter_settings: config.filter.clone(),
            coaching_settings: config.coaching.clone(),
            filter: PositionFilter::new(&config.filter),
            calculator: MetricsCalculator::new(),
            engine: CoachingTriggerEngine::new(config.coaching.clone()),
            state: TrackingState::Idle,
            session: None,
            history: Vec::new(),
            metrics: RunMetrics::default(),
            phase: CoachingPhase::Warmup,
            paused_at: None,
            paused_ms: 0,
            accepted_since_checkpoint: 0,
            keep_alive: None,
            status: None,
            last_error: None,
            state_tx,
        }
    }

    /// Begin a new session for `user_id`; returns the session id
    pub fn start(&mut self, user_id: &str, source: &dyn PositionSource) -> Result<String> {
        if let (true, Some(session)) = (self.state.is_in_progress(), &self.session) {
            return Err(TrackingError::AlreadyActive {
                session_id: session.id.clone(),
            }
            .into());
        }
        if !source.is_available() {
            return Err(TrackingError::PositionSourceUnavailable.into());
        }

        let guard = KeepAliveGuard::acquire(self.deps.keep_alive.clone())?;
        let now = self.deps.clock.now_ms();
        let session = RunSession::new(Uuid::new_v4().to_string(), user_id, now);
        let session_id = session.id.clone();

        self.reset_session_state();
        self.metrics.last_update_time = now;
        self.session = Some(session);
        self.keep_alive = Some(guard);
        self.state = TrackingState::Active;
        self.status = Some("Tracking started".to_string());
        self.publish();

        info!(%session_id, user_id, "Session started");
        Ok(session_id)
    }

    pub fn pause(&mut self) -> Result<()> {
        if self.state != TrackingState::Active {
            return Err(TrackingError::invalid_state("pause", self.state.as_status()).into());
        }

        self.paused_at = Some(self.deps.clock.now_ms());
        self.set_session_status(SessionStatus::Paused);
        self.state = TrackingState::Paused;
        self.status = Some("Paused".to_string());
        self.checkpoint();
        self.publish();

        info!(session_id = ?self.session_id(), "Session paused");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.state != TrackingState::Paused {
            return Err(TrackingError::invalid_state("resume", self.state.as_status()).into());
        }

        self.fold_pause();
        self.set_session_status(SessionStatus::Active);
        self.state = TrackingState::Active;
        self.status = Some("Tracking resumed".to_string());
        self.publish();

        info!(session_id = ?self.session_id(), paused_ms = self.paused_ms, "Session resumed");
        Ok(())
    }

    /// Finish the session, hand it to the store and drop the checkpoint
    pub fn stop(&mut self) -> Result<StopSummary> {
        if !self.state.is_in_progress() {
            return Err(TrackingError::invalid_state("stop", self.state.as_status()).into());
        }
        let Some(mut session) = self.session.take() else {
            return Err(TrackingError::NoSession.into());
        };

        // A pause still open at stop is trailing idle time outside the sample span
        self.paused_at = None;

        let now = self.deps.clock.now_ms();
        let final_time = self.history.last().map_or(now, |s| s.timestamp);
        self.metrics = self
            .calculator
            .calculate(&self.history, self.paused_ms, final_time);

        session.apply_metrics(&self.metrics);
        session.end_time = Some(now);
        session.status = SessionStatus::Stopped;

        let persisted = match self.deps.session_store.save(&session) {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Could not persist finished session");
                self.last_error = Some(e.to_string());
                false
            }
        };

        self.deps.checkpoints.clear();
        self.keep_alive = None;
        self.state = TrackingState::Stopped;
        self.status = Some("Run saved".to_string()).filter(|_| persisted);
        self.publish_with_session(Some(session.id.clone()));

        info!(
            session_id = %session.id,
            distance_m = session.distance_meters,
            duration_s = session.duration_ms / 1000,
            persisted,
            "Session stopped"
        );

        Ok(StopSummary {
            session,
            metrics: self.metrics.clone(),
            persisted,
        })
    }

    /// Run one raw sample through the pipeline
    pub fn process_sample(&mut self, sample: LocationSample) -> Result<SampleOutcome> {
        if self.state != TrackingState::Active {
            return Ok(SampleOutcome::Ignored);
        }

        if let FilterDecision::Rejected(reason) = self.filter.evaluate(&sample) {
            self.publish();
            return Ok(SampleOutcome::Rejected(reason));
        }

        let timestamp = sample.timestamp;
        self.history.push(sample);
        self.metrics = self
            .calculator
            .calculate(&self.history, self.paused_ms, timestamp);
        if let Some(session) = self.session.as_mut() {
            session.apply_metrics(&self.metrics);
        }

        self.phase = next_phase(self.phase, &self.metrics, &self.coaching_settings);
        let triggers = self.engine.evaluate(&self.metrics, self.phase);
        for trigger in &triggers {
            self.deps
                .voice
                .speak(&trigger.message, trigger.urgency, trigger.priority);
        }

        self.accepted_since_checkpoint += 1;
        let checkpointed = self.accepted_since_checkpoint >= self.checkpoint_interval;
        if checkpointed {
            self.checkpoint();
        }

        self.status = None;
        self.publish();

        debug!(
            samples = self.history.len(),
            distance_m = self.metrics.distance_meters,
            pace = self.metrics.current_pace,
            triggers = triggers.len(),
            "Sample accepted"
        );

        Ok(SampleOutcome::Accepted {
            metrics: self.metrics.clone(),
            triggers,
            checkpointed,
        })
    }

    /// Feed an external heart-rate reading to the coaching engine
    pub fn record_heart_rate(&mut self, bpm: u16) -> Result<()> {
        if !self.state.is_in_progress() {
            return Err(TrackingError::NoSession.into());
        }
        self.engine.record_heart_rate(bpm);
        Ok(())
    }

    /// Rebuild a session from a recovery snapshot and resume tracking
    pub fn restore(&mut self, snapshot: RecoverySnapshot) -> Result<String> {
        if let (true, Some(session)) = (self.state.is_in_progress(), &self.session) {
            return Err(TrackingError::AlreadyActive {
                session_id: session.id.clone(),
            }
            .into());
        }

        let guard = KeepAliveGuard::acquire(self.deps.keep_alive.clone())?;
        self.reset_session_state();

        let span_ms = match (snapshot.locations.first(), snapshot.locations.last()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp).max(0) as u64,
            _ => 0,
        };
        self.paused_ms = span_ms.saturating_sub(snapshot.metrics.duration_ms);

        let start_time = snapshot
            .locations
            .first()
            .map_or(snapshot.last_update_time, |s| s.timestamp);
        let mut session = RunSession::new(snapshot.session_id.clone(), snapshot.user_id.clone(), start_time);

        self.history = snapshot.locations;
        self.metrics = if self.history.is_empty() {
            snapshot.metrics
        } else {
            let last = self.history.last().map_or(start_time, |s| s.timestamp);
            self.calculator.calculate(&self.history, self.paused_ms, last)
        };
        session.apply_metrics(&self.metrics);

        self.filter
            .resume_after(self.history.last().map(|s| s.timestamp));
        self.phase = next_phase(CoachingPhase::Warmup, &self.metrics, &self.coaching_settings);
        self.engine.resume_from(&self.metrics, self.phase);

        let session_id = session.id.clone();
        self.session = Some(session);
        self.keep_alive = Some(guard);
        self.state = TrackingState::Active;
        self.status = Some("Recovered interrupted run".to_string());
        self.publish();

        info!(
            %session_id,
            samples = self.history.len(),
            crash_attempts = snapshot.crash_attempts,
            phase = %self.phase,
            "Session restored"
        );
        Ok(session_id)
    }

    /// Fatal error path: keep the checkpoint, release resources, go idle
    pub fn fail(&mut self, reason: &str) -> Result<()> {
        let session_id = self.session_id().unwrap_or_default();
        warn!(%session_id, reason, "Tracking failed");

        self.deps.checkpoints.record_error(&session_id, reason);
        self.keep_alive = None;
        self.session = None;
        self.paused_at = None;
        self.state = TrackingState::Idle;
        self.status = None;
        self.last_error = Some(reason.to_string());
        self.publish_with_session(None);
        Ok(())
    }

    /// Record a non-fatal error against the current session
    pub fn record_error(&mut self, message: &str) {
        let session_id = self.session_id().unwrap_or_default();
        self.deps.checkpoints.record_error(&session_id, message);
        self.last_error = Some(message.to_string());
        self.publish();
    }

    /// Submit a checkpoint of the current state regardless of the interval
    pub fn checkpoint(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        self.deps.checkpoints.submit(CheckpointRequest {
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            locations: self.history.clone(),
            metrics: self.metrics.clone(),
        });
        self.accepted_since_checkpoint = 0;
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackingSnapshot> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> TrackingSnapshot {
        self.state_tx.borrow().clone()
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn session(&self) -> Option<&RunSession> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.id.clone())
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    pub fn history(&self) -> &[LocationSample] {
        &self.history
    }

    pub fn phase(&self) -> CoachingPhase {
        self.phase
    }

    pub fn filter_stats(&self) -> &FilterStats {
        self.filter.stats()
    }

    pub fn paused_ms(&self) -> u64 {
        self.paused_ms
    }

    fn reset_session_state(&mut self) {
        self.filter = PositionFilter::new(&self.filter_settings);
        self.engine.reset();
        self.history.clear();
        self.metrics = RunMetrics::default();
        self.phase = CoachingPhase::Warmup;
        self.paused_at = None;
        self.paused_ms = 0;
        self.accepted_since_checkpoint = 0;
        self.last_error = None;
    }

    // Pause time only counts once samples exist on both sides of it
    fn fold_pause(&mut self) {
        if let Some(paused_at) = self.paused_at.take() {
            if !self.history.is_empty() {
                let elapsed = (self.deps.clock.now_ms() - paused_at).max(0) as u64;
                self.paused_ms = self.paused_ms.saturating_add(elapsed);
            }
        }
    }

    fn set_session_status(&mut self, status: SessionStatus) {
        if let Some(session) = self.session.as_mut() {
            session.status = status;
        }
    }

    fn publish(&self) {
        self.publish_with_session(self.session_id());
    }

    fn publish_with_session(&self, session_id: Option<String>) {
        self.state_tx.send_replace(TrackingSnapshot {
            state: self.state,
            session_id,
            metrics: self.metrics.clone(),
            phase: self.phase,
            signal_quality: self.filter.signal_quality(),
            status: self.status.clone(),
            last_error: self.last_error.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, DirectCheckpointSink};
    use crate::database::MemoryKeyValueStore;
    use crate::error::RunCoachError;
    use crate::external::{
        CountingKeepAlive, ManualClock, ManualPositionSource, MemorySessionStore,
        RecordingVoiceCoach,
    };
    use crate::models::TriggerType;

    const T0: i64 = 1_700_000_000_000;
    const METERS_PER_DEG_LAT: f64 = 111_194.926_644_558_7;

    struct Harness {
        controller: SessionController,
        source: ManualPositionSource,
        clock: Arc<ManualClock>,
        keep_alive: Arc<CountingKeepAlive>,
        voice: Arc<RecordingVoiceCoach>,
        sessions: Arc<MemorySessionStore>,
        checkpoints: Arc<CheckpointStore>,
    }

    fn harness(config: TrackerConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(T0));
        let keep_alive = Arc::new(CountingKeepAlive::new());
        let voice = Arc::new(RecordingVoiceCoach::new());
        let sessions = Arc::new(MemorySessionStore::new());
        let checkpoints = Arc::new(CheckpointStore::new(
            Arc::new(MemoryKeyValueStore::new()),
            clock.clone(),
            config.checkpoint.clone(),
        ));
        let deps = ControllerDeps {
            session_store: sessions.clone(),
            voice: voice.clone(),
            keep_alive: keep_alive.clone(),
            checkpoints: Arc::new(DirectCheckpointSink::new(checkpoints.clone())),
            clock: clock.clone(),
        };
        let (source, _handle) = ManualPositionSource::pair();

        Harness {
            controller: SessionController::new(&config, deps),
            source,
            clock,
            keep_alive,
            voice,
            sessions,
            checkpoints,
        }
    }

    /// Sample `meters` north of the origin at `secs` after T0
    fn north(meters: f64, secs: i64) -> LocationSample {
        LocationSample::new(45.0 + meters / METERS_PER_DEG_LAT, 7.0, 5.0, T0 + secs * 1_000)
    }

    #[test]
    fn test_lifecycle() {
        let mut h = harness(TrackerConfig::default());
        assert_eq!(h.controller.state(), TrackingState::Idle);

        let id = h.controller.start("runner", &h.source).unwrap();
        assert_eq!(h.controller.state(), TrackingState::Active);
        assert_eq!(h.keep_alive.held(), 1);
        assert_eq!(h.controller.snapshot().session_id.as_deref(), Some(id.as_str()));

        h.controller.pause().unwrap();
        assert_eq!(h.controller.state(), TrackingState::Paused);
        h.controller.resume().unwrap();

        let summary = h.controller.stop().unwrap();
        assert!(summary.persisted);
        assert_eq!(summary.session.status, SessionStatus::Stopped);
        assert_eq!(h.controller.state(), TrackingState::Stopped);
        assert_eq!(h.keep_alive.held(), 0);
        assert!(h.sessions.load(&id).unwrap().is_some());

        // A new run can start after stopping
        assert!(h.controller.start("runner", &h.source).is_ok());
    }

    #[test]
    fn test_start_twice_fails() {
        let mut h = harness(TrackerConfig::default());
        h.controller.start("runner", &h.source).unwrap();
        let err = h.controller.start("runner", &h.source).unwrap_err();
        assert!(matches!(
            err,
            RunCoachError::Tracking(TrackingError::AlreadyActive { .. })
        ));
        assert_eq!(h.keep_alive.held(), 1);
    }

    #[test]
    fn test_start_without_position_source() {
        let mut h = harness(TrackerConfig::default());
        let (source, handle) = ManualPositionSource::pair();
        handle.set_available(false);

        let err = h.controller.start("runner", &source).unwrap_err();
        assert!(matches!(
            err,
            RunCoachError::Tracking(TrackingError::PositionSourceUnavailable)
        ));
        assert_eq!(h.controller.state(), TrackingState::Idle);
        assert_eq!(h.keep_alive.held(), 0);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut h = harness(TrackerConfig::default());
        assert!(h.controller.pause().is_err());
        assert!(h.controller.resume().is_err());
        assert!(h.controller.stop().is_err());

        h.controller.start("runner", &h.source).unwrap();
        assert!(h.controller.resume().is_err());
    }

    #[test]
    fn test_two_samples_eleven_meters() {
        let mut config = TrackerConfig::default();
        config.coaching.target_pace = Some(5.0);
        let mut h = harness(config);
        h.controller.start("runner", &h.source).unwrap();

        h.controller.process_sample(north(0.0, 0)).unwrap();
        let outcome = h.controller.process_sample(north(11.0, 1)).unwrap();

        match outcome {
            SampleOutcome::Accepted { metrics, triggers, .. } => {
                assert!((metrics.distance_meters - 11.0).abs() < 0.05);
                assert_eq!(metrics.duration_seconds(), 1);
                assert!(triggers.iter().all(|t| !t.trigger_type.is_pace_warning()));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_inaccurate_sample_leaves_history() {
        let mut h = harness(TrackerConfig::default());
        h.controller.start("runner", &h.source).unwrap();
        h.controller.process_sample(north(0.0, 0)).unwrap();

        let mut noisy = north(30.0, 1);
        noisy.accuracy = 35.0;
        let outcome = h.controller.process_sample(noisy).unwrap();

        assert_eq!(outcome, SampleOutcome::Rejected(RejectReason::LowAccuracy));
        assert_eq!(h.controller.history().len(), 1);
        assert_eq!(h.controller.filter_stats().rejected_accuracy, 1);
    }

    #[test]
    fn test_samples_ignored_while_paused() {
        let mut h = harness(TrackerConfig::default());
        h.controller.start("runner", &h.source).unwrap();
        h.controller.process_sample(north(0.0, 0)).unwrap();
        h.controller.pause().unwrap();

        assert_eq!(
            h.controller.process_sample(north(10.0, 1)).unwrap(),
            SampleOutcome::Ignored
        );
        assert_eq!(h.controller.history().len(), 1);
    }

    #[test]
    fn test_paused_time_excluded_from_duration() {
        let mut h = harness(TrackerConfig::default());
        h.controller.start("runner", &h.source).unwrap();
        h.controller.process_sample(north(0.0, 0)).unwrap();
        h.controller.process_sample(north(30.0, 10)).unwrap();

        h.clock.set(T0 + 10_000);
        h.controller.pause().unwrap();
        h.clock.set(T0 + 70_000);
        h.controller.resume().unwrap();

        h.controller.process_sample(north(60.0, 80)).unwrap();
        // 80 s span minus 60 s paused
        assert_eq!(h.controller.metrics().duration_ms, 20_000);
    }

    #[test]
    fn test_checkpoint_every_tenth_sample() {
        let mut h = harness(TrackerConfig::default());
        h.controller.start("runner", &h.source).unwrap();

        let mut checkpoints = 0;
        for i in 0..25 {
            if let SampleOutcome::Accepted { checkpointed, .. } =
                h.controller.process_sample(north(i as f64 * 3.0, i)).unwrap()
            {
                checkpoints += checkpointed as usize;
            }
        }
        assert_eq!(checkpoints, 2);

        let diag = h.checkpoints.peek_diagnostics().unwrap();
        assert!(diag.has_recoverable_session);
    }

    #[test]
    fn test_stop_clears_checkpoint() {
        let mut h = harness(TrackerConfig::default());
        h.controller.start("runner", &h.source).unwrap();
        for i in 0..12 {
            h.controller.process_sample(north(i as f64 * 3.0, i)).unwrap();
        }
        assert!(h.checkpoints.peek_diagnostics().unwrap().has_recoverable_session);

        h.controller.stop().unwrap();
        assert!(!h.checkpoints.peek_diagnostics().unwrap().has_recoverable_session);
    }

    #[test]
    fn test_too_fast_spoken_once() {
        let mut config = TrackerConfig::default();
        config.coaching.target_pace = Some(5.0);
        let mut h = harness(config);
        h.controller.start("runner", &h.source).unwrap();

        // 3:00/km is 5.556 m/s
        for i in 0..6 {
            let sample = north(i as f64 * 5.556, i).with_speed(1000.0 / 180.0);
            h.controller.process_sample(sample).unwrap();
        }

        let spoken = h.voice.spoken();
        assert_eq!(spoken.len(), 1);
        assert!(spoken[0].0.starts_with("Slow down"));
        assert_eq!(spoken[0].2, crate::models::TriggerPriority::Urgent);
    }

    #[test]
    fn test_restore_resumes_without_repeating_milestones() {
        let mut h = harness(TrackerConfig::default());
        let locations: Vec<_> = (0..=400).map(|i| north(i as f64 * 3.0, i)).collect();
        let snapshot = RecoverySnapshot {
            session_id: "recovered".to_string(),
            user_id: "runner".to_string(),
            metrics: MetricsCalculator::new().calculate(&locations, 0, T0 + 400_000),
            locations,
            last_update_time: T0 + 400_000,
            crash_attempts: 1,
        };

        let id = h.controller.restore(snapshot).unwrap();
        assert_eq!(id, "recovered");
        assert_eq!(h.controller.state(), TrackingState::Active);
        assert_eq!(h.controller.phase(), CoachingPhase::MainWorkout);
        assert_eq!(h.keep_alive.held(), 1);

        let outcome = h.controller.process_sample(north(1_203.0, 401)).unwrap();
        if let SampleOutcome::Accepted { triggers, .. } = outcome {
            assert!(triggers
                .iter()
                .all(|t| t.trigger_type != TriggerType::DistanceMilestone));
        } else {
            panic!("sample after restore should be accepted");
        }

        // Older samples than the restored history are out of order
        assert_eq!(
            h.controller.process_sample(north(5.0, 3)).unwrap(),
            SampleOutcome::Rejected(RejectReason::OutOfOrder)
        );
    }

    #[test]
    fn test_fail_keeps_checkpoint() {
        let mut h = harness(TrackerConfig::default());
        h.controller.start("runner", &h.source).unwrap();
        for i in 0..10 {
            h.controller.process_sample(north(i as f64 * 3.0, i)).unwrap();
        }

        h.controller.fail("position source gave up").unwrap();
        assert_eq!(h.controller.state(), TrackingState::Idle);
        assert_eq!(h.keep_alive.held(), 0);

        let snapshot = h.controller.snapshot();
        assert!(!snapshot.is_tracking());
        assert_eq!(snapshot.last_error.as_deref(), Some("position source gave up"));

        let diag = h.checkpoints.peek_diagnostics().unwrap();
        assert!(diag.has_recoverable_session);
        assert_eq!(diag.last_error.as_deref(), Some("position source gave up"));
    }

    #[test]
    fn test_state_channel_publishes() {
        let mut h = harness(TrackerConfig::default());
        let mut rx = h.controller.subscribe();
        assert_eq!(rx.borrow().state, TrackingState::Idle);

        h.controller.start("runner", &h.source).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().state, TrackingState::Active);

        h.controller.process_sample(north(0.0, 0)).unwrap();
        assert_eq!(rx.borrow_and_update().metrics.sample_count, 1);
    }
}

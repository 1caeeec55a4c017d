//! Long-lived tracking host
//!
//! `TrackingHost::launch` spawns one tokio task that owns the session
//! controller and the position source. Commands come in over an mpsc
//! channel, samples over a bounded mpsc channel fed by the source, and the
//! checkpoint sync and cleanup passes run on intervals. Observers follow the
//! controller's `watch` channel through the returned `HostHandle`.
//!
//! A launch without a directive is treated as an abnormal restart: the host
//! asks the checkpoint store for a recovery snapshot and resumes tracking
//! from it when one is eligible.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::checkpoint::{CheckpointStore, CoalescingCheckpointWriter, SyncOutcome};
use crate::config::{HostSettings, TrackerConfig};
use crate::controller::{
    ControllerDeps, SampleOutcome, SessionController, StopSummary, TrackingSnapshot,
};
use crate::diagnostics::DiagnosticsSnapshot;
use crate::error::{Result, RunCoachError, SourceError};
use crate::external::{Clock, KeepAlive, PositionSource, SessionStore, SourceEvent, VoiceCoach};

/// Explicit instruction the host was launched with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchDirective {
    Start { user_id: String },
    Stop,
}

/// Everything the host needs from the outside
pub struct HostComponents {
    pub source: Box<dyn PositionSource>,
    pub checkpoints: Arc<CheckpointStore>,
    pub session_store: Arc<dyn SessionStore>,
    pub voice: Arc<dyn VoiceCoach>,
    pub keep_alive: Arc<dyn KeepAlive>,
    pub clock: Arc<dyn Clock>,
}

enum HostCommand {
    Start {
        user_id: String,
        reply: oneshot::Sender<Result<String>>,
    },
    Pause {
        reply: oneshot::Sender<Result<()>>,
    },
    Resume {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<Result<StopSummary>>,
    },
    HeartRate {
        bpm: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    Diagnostics {
        reply: oneshot::Sender<Result<DiagnosticsSnapshot>>,
    },
    SyncNow {
        reply: oneshot::Sender<Result<SyncOutcome>>,
    },
    Shutdown,
}

pub struct TrackingHost;

impl TrackingHost {
    /// Spawn the host task; must be called inside a tokio runtime
    pub fn launch(
        config: TrackerConfig,
        components: HostComponents,
        directive: Option<LaunchDirective>,
    ) -> HostHandle {
        let HostComponents {
            source,
            checkpoints,
            session_store,
            voice,
            keep_alive,
            clock,
        } = components;

        let writer = CoalescingCheckpointWriter::spawn(checkpoints.clone());
        let controller = SessionController::new(
            &config,
            ControllerDeps {
                session_store,
                voice,
                keep_alive,
                checkpoints: writer.clone(),
                clock,
            },
        );
        let state = controller.subscribe();

        let (command_tx, command_rx) = mpsc::channel(config.host.command_buffer.max(1));
        let (sample_tx, sample_rx) = mpsc::channel(config.host.sample_buffer.max(1));

        let task = HostTask {
            settings: config.host.clone(),
            sync_period: Duration::from_secs(config.checkpoint.sync_interval_secs.max(1)),
            cleanup_period: Duration::from_secs(config.checkpoint.cleanup_interval_secs.max(1)),
            controller,
            source,
            checkpoints,
            writer,
            sample_tx,
            samples: sample_rx,
            restarts: 0,
            restart_at: None,
        };

        let task = tokio::spawn(
            task.run(command_rx, directive)
                .instrument(info_span!("tracking_host")),
        );

        HostHandle {
            commands: command_tx,
            state,
            task,
        }
    }
}

/// Client side of a running host
pub struct HostHandle {
    commands: mpsc::Sender<HostCommand>,
    state: watch::Receiver<TrackingSnapshot>,
    task: JoinHandle<()>,
}

fn host_gone() -> RunCoachError {
    RunCoachError::Internal("tracking host is not running".to_string())
}

impl HostHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> HostCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| host_gone())?;
        response.await.map_err(|_| host_gone())?
    }

    pub async fn start(&self, user_id: &str) -> Result<String> {
        let user_id = user_id.to_string();
        self.request(|reply| HostCommand::Start { user_id, reply })
            .await
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(|reply| HostCommand::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(|reply| HostCommand::Resume { reply }).await
    }

    pub async fn stop(&self) -> Result<StopSummary> {
        self.request(|reply| HostCommand::Stop { reply }).await
    }

    pub async fn record_heart_rate(&self, bpm: u16) -> Result<()> {
        self.request(|reply| HostCommand::HeartRate { bpm, reply })
            .await
    }

    pub async fn diagnostics(&self) -> Result<DiagnosticsSnapshot> {
        self.request(|reply| HostCommand::Diagnostics { reply })
            .await
    }

    /// Run a checkpoint sync pass now instead of waiting for the interval
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        self.request(|reply| HostCommand::SyncNow { reply }).await
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackingSnapshot> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> TrackingSnapshot {
        self.state.borrow().clone()
    }

    /// Wait until the published state satisfies `predicate`
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&TrackingSnapshot) -> bool,
    ) -> Result<TrackingSnapshot> {
        let mut state = self.state.clone();
        let snapshot = state.wait_for(predicate).await.map_err(|_| host_gone())?;
        Ok((*snapshot).clone())
    }

    /// Stop the host task, flushing pending checkpoint writes
    pub async fn shutdown(self) -> Result<()> {
        // A closed channel means the task already exited
        let _ = self.commands.send(HostCommand::Shutdown).await;
        self.task
            .await
            .map_err(|e| RunCoachError::Internal(format!("tracking host panicked: {}", e)))
    }
}

struct HostTask {
    settings: HostSettings,
    sync_period: Duration,
    cleanup_period: Duration,
    controller: SessionController,
    source: Box<dyn PositionSource>,
    checkpoints: Arc<CheckpointStore>,
    writer: Arc<CoalescingCheckpointWriter>,
    sample_tx: mpsc::Sender<SourceEvent>,
    samples: mpsc::Receiver<SourceEvent>,
    restarts: u32,
    restart_at: Option<Instant>,
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl HostTask {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<HostCommand>,
        directive: Option<LaunchDirective>,
    ) {
        self.apply_directive(directive).await;

        let mut sync_tick = interval_at(Instant::now() + self.sync_period, self.sync_period);
        let mut cleanup_tick =
            interval_at(Instant::now() + self.cleanup_period, self.cleanup_period);

        loop {
            let restart_at = self.restart_at;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(HostCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.samples.recv() => self.handle_source_event(event),
                _ = sync_tick.tick() => {
                    let _ = self.run_sync_pass().await;
                }
                _ = cleanup_tick.tick() => self.run_cleanup_pass().await,
                () = sleep_until_some(restart_at) => self.restart_source(),
            }
        }

        self.shutdown().await;
    }

    async fn apply_directive(&mut self, directive: Option<LaunchDirective>) {
        match directive {
            Some(LaunchDirective::Start { user_id }) => {
                if let Err(e) = self.start_session(&user_id) {
                    warn!(error = %e, "Start directive failed");
                }
            }
            Some(LaunchDirective::Stop) => {
                info!("Launched with stop directive, discarding any checkpoint");
                let store = self.checkpoints.clone();
                match tokio::task::spawn_blocking(move || store.clear()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "Could not discard checkpoint"),
                    Err(e) => error!(error = %e, "Checkpoint discard panicked"),
                }
            }
            None => self.recover().await,
        }
    }

    async fn recover(&mut self) {
        let store = self.checkpoints.clone();
        let snapshot = tokio::task::spawn_blocking(move || store.get_recovery_snapshot()).await;

        match snapshot {
            Ok(Ok(Some(snapshot))) => match self.controller.restore(snapshot) {
                Ok(session_id) => {
                    info!(%session_id, "Resumed session after abnormal restart");
                    self.restarts = 0;
                    self.start_source();
                }
                Err(e) => warn!(error = %e, "Recovered session could not be restored"),
            },
            Ok(Ok(None)) => info!("No recoverable session, staying idle"),
            Ok(Err(e)) => warn!(error = %e, "Recovery lookup failed, staying idle"),
            Err(e) => error!(error = %e, "Recovery lookup panicked"),
        }
    }

    fn start_session(&mut self, user_id: &str) -> Result<String> {
        let session_id = self.controller.start(user_id, self.source.as_ref())?;
        // Anything still queued belongs to the previous run
        self.drain_samples();
        self.restarts = 0;
        self.restart_at = None;
        self.start_source();
        Ok(session_id)
    }

    fn start_source(&mut self) {
        match self.source.start(self.sample_tx.clone()) {
            Ok(()) => debug!("Position source started"),
            Err(e) => self.handle_source_failure(&e.to_string()),
        }
    }

    fn stop_source(&mut self) {
        self.source.stop();
        self.restart_at = None;
        self.drain_samples();
    }

    fn drain_samples(&mut self) {
        let mut discarded = 0usize;
        while self.samples.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "Dropped queued source events");
        }
    }

    async fn handle_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::Start { user_id, reply } => {
                let _ = reply.send(self.start_session(&user_id));
            }
            HostCommand::Pause { reply } => {
                let _ = reply.send(self.controller.pause());
            }
            HostCommand::Resume { reply } => {
                let _ = reply.send(self.controller.resume());
            }
            HostCommand::Stop { reply } => {
                let result = self.controller.stop();
                if result.is_ok() {
                    self.stop_source();
                }
                let _ = reply.send(result);
            }
            HostCommand::HeartRate { bpm, reply } => {
                let _ = reply.send(self.controller.record_heart_rate(bpm));
            }
            HostCommand::Diagnostics { reply } => {
                let _ = reply.send(self.diagnostics().await);
            }
            HostCommand::SyncNow { reply } => {
                let _ = reply.send(self.run_sync_pass().await);
            }
            HostCommand::Shutdown => {}
        }
    }

    fn handle_source_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Sample(sample) => match self.controller.process_sample(sample) {
                Ok(SampleOutcome::Accepted { .. }) if self.restarts > 0 => {
                    // Delivery is healthy again
                    self.restarts = 0;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Sample processing failed"),
            },
            SourceEvent::Failed(reason) => self.handle_source_failure(&reason),
        }
    }

    fn handle_source_failure(&mut self, reason: &str) {
        if !self.controller.state().is_in_progress() {
            debug!(reason, "Position source failure with no session in progress");
            return;
        }

        warn!(reason, restarts = self.restarts, "Position source failed");
        self.source.stop();
        self.controller
            .record_error(&format!("position source failed: {}", reason));

        if self.restarts >= self.settings.max_source_restarts {
            let exhausted = SourceError::RestartsExhausted {
                attempts: self.restarts,
            };
            error!(error = %exhausted, "Giving up on position source");
            self.restart_at = None;
            if let Err(e) = self.controller.fail(&exhausted.to_string()) {
                warn!(error = %e, "Could not record fatal source failure");
            }
            return;
        }

        let delay = Duration::from_secs(self.settings.source_restart_delay_secs);
        self.restart_at = Some(Instant::now() + delay);
    }

    fn restart_source(&mut self) {
        self.restart_at = None;
        if !self.controller.state().is_in_progress() {
            return;
        }
        self.restarts += 1;
        info!(attempt = self.restarts, "Restarting position source");
        self.start_source();
    }

    async fn run_sync_pass(&mut self) -> Result<SyncOutcome> {
        let store = self.checkpoints.clone();
        let outcome = tokio::task::spawn_blocking(move || store.sync_pass())
            .await
            .map_err(|e| RunCoachError::Internal(e.to_string()))?
            .map_err(RunCoachError::from);

        match &outcome {
            Ok(SyncOutcome::Idle) => debug!("Sync pass: nothing pending"),
            Ok(outcome) => info!(?outcome, "Sync pass finished"),
            Err(e) => warn!(error = %e, "Sync pass failed"),
        }
        outcome
    }

    async fn run_cleanup_pass(&mut self) {
        if self.controller.state().is_in_progress() {
            // The live session owns the checkpoint
            return;
        }
        let store = self.checkpoints.clone();
        match tokio::task::spawn_blocking(move || store.cleanup_pass()).await {
            Ok(Ok(removed)) => debug!(removed, "Cleanup pass finished"),
            Ok(Err(e)) => warn!(error = %e, "Cleanup pass failed"),
            Err(e) => warn!(error = %e, "Cleanup pass panicked"),
        }
    }

    async fn diagnostics(&mut self) -> Result<DiagnosticsSnapshot> {
        let tracking = self.controller.snapshot();
        let samples = self.controller.filter_stats().clone();
        let store = self.checkpoints.clone();
        let checkpoint = tokio::task::spawn_blocking(move || store.peek_diagnostics())
            .await
            .map_err(|e| RunCoachError::Internal(e.to_string()))??;

        Ok(DiagnosticsSnapshot::collect(&tracking, &samples, &checkpoint))
    }

    async fn shutdown(&mut self) {
        if self.controller.state().is_in_progress() {
            // Leave the latest state behind for the next launch
            self.controller.checkpoint();
        }
        self.stop_source();
        self.writer.shutdown().await;
        info!("Tracking host stopped");
    }
}

//! Narrow interfaces to the collaborators around the tracking core
//!
//! Everything the controller and host touch outside their own state goes
//! through one of these traits: the position source, the finished-run store,
//! the voice coach, the keep-alive resource and the clock. Simple in-process
//! implementations live here as well; they back the CLI and the tests.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, SourceError, TrackingError};
use crate::models::{LocationSample, RunSession, TriggerPriority, UrgencyLevel};

/// Wall-clock source in epoch milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) -> i64 {
        self.now.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Event pushed by a position source
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Sample(LocationSample),
    Failed(String),
}

/// Push-only producer of location samples
///
/// `start` hands the source a channel and returns immediately; delivery
/// happens on whatever task the source owns. Calling `start` on a running
/// source restarts it.
pub trait PositionSource: Send {
    /// Whether the capability (permission, hardware) is present
    fn is_available(&self) -> bool;

    fn start(&mut self, events: mpsc::Sender<SourceEvent>) -> Result<(), SourceError>;

    fn stop(&mut self);
}

/// Source fed by hand through a `ManualSourceHandle`
pub struct ManualPositionSource {
    available: Arc<AtomicBool>,
    sender: Arc<Mutex<Option<mpsc::Sender<SourceEvent>>>>,
    starts: Arc<AtomicUsize>,
}

/// Test-side handle for pushing events into a `ManualPositionSource`
#[derive(Clone)]
pub struct ManualSourceHandle {
    available: Arc<AtomicBool>,
    sender: Arc<Mutex<Option<mpsc::Sender<SourceEvent>>>>,
    starts: Arc<AtomicUsize>,
}

impl ManualPositionSource {
    pub fn pair() -> (Self, ManualSourceHandle) {
        let available = Arc::new(AtomicBool::new(true));
        let sender = Arc::new(Mutex::new(None));
        let starts = Arc::new(AtomicUsize::new(0));
        let handle = ManualSourceHandle {
            available: available.clone(),
            sender: sender.clone(),
            starts: starts.clone(),
        };
        (
            Self {
                available,
                sender,
                starts,
            },
            handle,
        )
    }
}

impl PositionSource for ManualPositionSource {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn start(&mut self, events: mpsc::Sender<SourceEvent>) -> Result<(), SourceError> {
        if !self.is_available() {
            return Err(SourceError::Unavailable {
                reason: "manual source disabled".to_string(),
            });
        }
        let mut slot = self.sender.lock().map_err(|_| SourceError::Failed {
            reason: "source lock poisoned".to_string(),
        })?;
        *slot = Some(events);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        if let Ok(mut slot) = self.sender.lock() {
            slot.take();
        }
    }
}

impl ManualSourceHandle {
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of times the source has been started
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Deliver an event; false when the source is stopped or the host is gone
    pub async fn send(&self, event: SourceEvent) -> bool {
        let sender = match self.sender.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub async fn push(&self, sample: LocationSample) -> bool {
        self.send(SourceEvent::Sample(sample)).await
    }

    pub async fn fail(&self, reason: &str) -> bool {
        self.send(SourceEvent::Failed(reason.to_string())).await
    }
}

/// Durable store for finished runs
pub trait SessionStore: Send + Sync {
    fn save(&self, session: &RunSession) -> Result<(), DatabaseError>;

    fn load(&self, id: &str) -> Result<Option<RunSession>, DatabaseError>;

    /// Returns whether a record was removed
    fn delete(&self, id: &str) -> Result<bool, DatabaseError>;
}

/// Session store kept in process memory
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, RunSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, session: &RunSession) -> Result<(), DatabaseError> {
        let mut sessions = self.sessions.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<RunSession>, DatabaseError> {
        let sessions = self.sessions.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        Ok(sessions.get(id).cloned())
    }

    fn delete(&self, id: &str) -> Result<bool, DatabaseError> {
        let mut sessions = self.sessions.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        Ok(sessions.remove(id).is_some())
    }
}

/// Receiver of spoken coaching messages
pub trait VoiceCoach: Send + Sync {
    fn speak(&self, message: &str, urgency: UrgencyLevel, priority: TriggerPriority);
}

/// Voice coach that writes every message to the log
#[derive(Debug, Default)]
pub struct LoggingVoiceCoach;

impl VoiceCoach for LoggingVoiceCoach {
    fn speak(&self, message: &str, urgency: UrgencyLevel, priority: TriggerPriority) {
        info!(?urgency, ?priority, "Coach: {}", message);
    }
}

/// Voice coach that keeps what it was asked to say
#[derive(Debug, Default)]
pub struct RecordingVoiceCoach {
    spoken: Mutex<Vec<(String, UrgencyLevel, TriggerPriority)>>,
}

impl RecordingVoiceCoach {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spoken(&self) -> Vec<(String, UrgencyLevel, TriggerPriority)> {
        self.spoken.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.spoken().into_iter().map(|(message, _, _)| message).collect()
    }
}

impl VoiceCoach for RecordingVoiceCoach {
    fn speak(&self, message: &str, urgency: UrgencyLevel, priority: TriggerPriority) {
        if let Ok(mut spoken) = self.spoken.lock() {
            spoken.push((message.to_string(), urgency, priority));
        }
    }
}

/// Resource that keeps the process running in the background
pub trait KeepAlive: Send + Sync {
    fn acquire(&self) -> Result<(), TrackingError>;

    fn release(&self);
}

/// Holds a keep-alive acquisition; releases it on drop
pub struct KeepAliveGuard {
    keep_alive: Arc<dyn KeepAlive>,
}

impl KeepAliveGuard {
    pub fn acquire(keep_alive: Arc<dyn KeepAlive>) -> Result<Self, TrackingError> {
        keep_alive.acquire()?;
        debug!("Keep-alive acquired");
        Ok(Self { keep_alive })
    }
}

impl Drop for KeepAliveGuard {
    fn drop(&mut self) {
        self.keep_alive.release();
        debug!("Keep-alive released");
    }
}

impl std::fmt::Debug for KeepAliveGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveGuard").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct NoopKeepAlive;

impl KeepAlive for NoopKeepAlive {
    fn acquire(&self) -> Result<(), TrackingError> {
        Ok(())
    }

    fn release(&self) {}
}

/// Keep-alive that counts outstanding acquisitions
#[derive(Debug, Default)]
pub struct CountingKeepAlive {
    held: AtomicUsize,
    refuse: AtomicBool,
}

impl CountingKeepAlive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl KeepAlive for CountingKeepAlive {
    fn acquire(&self) -> Result<(), TrackingError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TrackingError::KeepAlive {
                reason: "acquisition refused".to_string(),
            });
        }
        self.held.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        let released = self
            .held
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if released.is_err() {
            warn!("Keep-alive released more often than acquired");
        }
    }
}

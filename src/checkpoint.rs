//! Crash-safe checkpoints of the session in progress
//!
//! `CheckpointStore` keeps at most one recoverable snapshot in a
//! `KeyValueStore`. A snapshot is handed back only while it is younger than
//! the age limit and its crash-attempt counter is below the budget; every
//! hand-out bumps the counter first, so a session that keeps crashing the
//! process is eventually abandoned instead of looping forever.
//!
//! Writes from the tracking path go through a `CheckpointSink`. The host
//! uses `CoalescingCheckpointWriter`, which keeps only the latest request
//! and performs the blocking write on its own task.

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CheckpointSettings;
use crate::database::{decode_counter, KeyValueStore};
use crate::error::{CheckpointError, DatabaseError};
use crate::external::Clock;
use crate::models::{LocationSample, RecoverySnapshot, RunMetrics};

/// Storage keys for the single active snapshot
pub mod keys {
    pub const ACTIVE_SESSION: &str = "checkpoint.active_session_id";
    pub const USER_ID: &str = "checkpoint.user_id";
    pub const LOCATIONS: &str = "checkpoint.locations";
    pub const METRICS: &str = "checkpoint.metrics";
    pub const LAST_UPDATE: &str = "checkpoint.last_update_time";
    pub const CRASH_ATTEMPTS: &str = "checkpoint.crash_attempts";
    pub const LAST_ERROR: &str = "error.message";
    pub const LAST_ERROR_TIME: &str = "error.time";
    pub const LAST_ERROR_SESSION: &str = "error.session_id";

    pub(crate) const SNAPSHOT: [&str; 5] = [ACTIVE_SESSION, USER_ID, LOCATIONS, METRICS, LAST_UPDATE];
}

/// Compressed location history for efficient storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedHistory {
    pub compressed_data: Vec<u8>,
    pub original_size: usize,
    pub point_count: usize,
}

impl CompressedHistory {
    /// bincode, then gzip
    pub fn compress(samples: &[LocationSample]) -> Result<Self, CheckpointError> {
        let serialized = bincode::serialize(samples).map_err(|e| CheckpointError::Serialization {
            key: keys::LOCATIONS.to_string(),
            reason: e.to_string(),
        })?;
        let original_size = serialized.len();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&serialized)?;
        let compressed_data = encoder.finish()?;

        Ok(Self {
            compressed_data,
            original_size,
            point_count: samples.len(),
        })
    }

    /// Decompress a blob produced by `compress`
    pub fn decompress(compressed: &[u8]) -> Result<Vec<LocationSample>, CheckpointError> {
        let mut decoder = GzDecoder::new(compressed);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;

        bincode::deserialize(&decompressed).map_err(|e| CheckpointError::Serialization {
            key: keys::LOCATIONS.to_string(),
            reason: e.to_string(),
        })
    }

    /// Original size over compressed size
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed_data.is_empty() {
            return 0.0;
        }
        self.original_size as f64 / self.compressed_data.len() as f64
    }
}

/// Everything needed to write one checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRequest {
    pub session_id: String,
    pub user_id: String,
    pub locations: Vec<LocationSample>,
    pub metrics: RunMetrics,
}

/// Result of a periodic sync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing was pending
    Idle,
    /// The pending write went through
    Synced,
    /// Still failing; kept for the next pass
    Retrying { failures: u32 },
    /// Retry budget used up; the write was discarded
    Dropped,
}

/// Read-only view of the checkpoint state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDiagnostics {
    pub has_recoverable_session: bool,
    pub session_id: Option<String>,
    pub last_checkpoint_time: Option<i64>,
    pub crash_attempts: u32,
    pub last_error: Option<String>,
    pub last_error_time: Option<i64>,
    pub pending_write: bool,
}

#[derive(Debug)]
struct PendingWrite {
    request: CheckpointRequest,
    failures: u32,
}

/// Checkpoint adapter over a key/value store
pub struct CheckpointStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    settings: CheckpointSettings,
    pending: Mutex<Option<PendingWrite>>,
    // Serializes snapshot writes against clear and removal
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        settings: CheckpointSettings,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            pending: Mutex::new(None),
            write_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &CheckpointSettings {
        &self.settings
    }

    /// Persist the latest session state
    ///
    /// A failed write is parked as the pending write for `sync_pass`,
    /// replacing whatever was parked before.
    pub fn save_checkpoint(&self, request: &CheckpointRequest) -> Result<(), CheckpointError> {
        let _guard = self.write_guard();
        match self.write_snapshot(request) {
            Ok(()) => {
                // A newer snapshot supersedes anything still waiting
                self.set_pending(None);
                debug!(
                    session_id = %request.session_id,
                    samples = request.locations.len(),
                    "Checkpoint saved"
                );
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %request.session_id, error = %e, "Checkpoint write failed, parked for retry");
                self.set_pending(Some(PendingWrite {
                    request: request.clone(),
                    failures: 0,
                }));
                Err(e)
            }
        }
    }

    fn write_snapshot(&self, request: &CheckpointRequest) -> Result<(), CheckpointError> {
        let history = CompressedHistory::compress(&request.locations)?;
        let metrics =
            serde_json::to_vec(&request.metrics).map_err(|e| CheckpointError::Serialization {
                key: keys::METRICS.to_string(),
                reason: e.to_string(),
            })?;

        let previous = self.read_string(keys::ACTIVE_SESSION)?;
        let now = self.clock.now_ms();

        let mut entries: Vec<(&str, Vec<u8>)> = vec![
            (keys::ACTIVE_SESSION, request.session_id.clone().into_bytes()),
            (keys::USER_ID, request.user_id.clone().into_bytes()),
            (keys::LOCATIONS, history.compressed_data),
            (keys::METRICS, metrics),
            (keys::LAST_UPDATE, now.to_string().into_bytes()),
        ];
        if previous.as_deref() != Some(request.session_id.as_str()) {
            entries.push((keys::CRASH_ATTEMPTS, b"0".to_vec()));
        }

        self.store.put_batch(&entries)?;
        Ok(())
    }

    /// Record the last error for diagnostics
    pub fn save_error(&self, session_id: &str, message: &str) -> Result<(), CheckpointError> {
        let now = self.clock.now_ms();
        self.store.put_batch(&[
            (keys::LAST_ERROR, message.as_bytes().to_vec()),
            (keys::LAST_ERROR_TIME, now.to_string().into_bytes()),
            (keys::LAST_ERROR_SESSION, session_id.as_bytes().to_vec()),
        ])?;
        Ok(())
    }

    /// Hand back the snapshot if it is still eligible
    ///
    /// Eligible means younger than the age limit and fewer crash attempts
    /// than the budget. The counter is incremented before the snapshot is
    /// returned. Ineligible or undecodable snapshots are abandoned.
    pub fn get_recovery_snapshot(&self) -> Result<Option<RecoverySnapshot>, CheckpointError> {
        let _guard = self.write_guard();
        let Some(session_id) = self.read_string(keys::ACTIVE_SESSION)? else {
            return Ok(None);
        };

        let last_update = self.read_i64(keys::LAST_UPDATE)?;
        let attempts = self.read_attempts()?;
        let now = self.clock.now_ms();

        let Some(last_update) = last_update else {
            self.abandon(&session_id, "checkpoint has no update time")?;
            return Ok(None);
        };

        let age_ms = now - last_update;
        if age_ms >= self.settings.max_age_ms() {
            self.abandon(
                &session_id,
                &format!("checkpoint is stale ({} h old)", age_ms / 3_600_000),
            )?;
            return Ok(None);
        }
        if attempts >= self.settings.max_crash_attempts {
            self.abandon(
                &session_id,
                &format!("recovery abandoned after {} attempts", attempts),
            )?;
            return Ok(None);
        }

        let decoded = self.decode_snapshot();
        let (user_id, locations, metrics) = match decoded {
            Ok(parts) => parts,
            Err(e) => {
                self.abandon(&session_id, &format!("checkpoint unreadable: {}", e))?;
                return Err(e);
            }
        };

        let crash_attempts = self.store.increment(keys::CRASH_ATTEMPTS)?;
        info!(
            %session_id,
            crash_attempts,
            samples = locations.len(),
            age_secs = age_ms / 1000,
            "Recovery snapshot handed out"
        );

        Ok(Some(RecoverySnapshot {
            session_id,
            user_id,
            locations,
            metrics,
            last_update_time: last_update,
            crash_attempts,
        }))
    }

    fn decode_snapshot(&self) -> Result<(String, Vec<LocationSample>, RunMetrics), CheckpointError> {
        let user_id = self.read_string(keys::USER_ID)?.unwrap_or_default();

        let locations = match self.store.get(keys::LOCATIONS)? {
            Some(blob) => CompressedHistory::decompress(&blob)?,
            None => Vec::new(),
        };

        let metrics = match self.store.get(keys::METRICS)? {
            Some(raw) => {
                serde_json::from_slice(&raw).map_err(|e| CheckpointError::Serialization {
                    key: keys::METRICS.to_string(),
                    reason: e.to_string(),
                })?
            }
            None => RunMetrics::default(),
        };

        Ok((user_id, locations, metrics))
    }

    fn abandon(&self, session_id: &str, reason: &str) -> Result<(), CheckpointError> {
        info!(%session_id, reason, "Abandoning recovery snapshot");
        self.remove_snapshot()?;
        self.save_error(session_id, reason)
    }

    fn remove_snapshot(&self) -> Result<(), CheckpointError> {
        let mut all = keys::SNAPSHOT.to_vec();
        all.push(keys::CRASH_ATTEMPTS);
        self.store.remove(&all)?;
        Ok(())
    }

    /// Forget the snapshot and reset the attempt counter
    pub fn clear(&self) -> Result<(), CheckpointError> {
        let _guard = self.write_guard();
        self.set_pending(None);
        self.remove_snapshot()?;
        debug!("Checkpoint cleared");
        Ok(())
    }

    /// Retry the parked write, if any
    ///
    /// Holds the write lock from taking the pending write until it lands or
    /// is parked again, so a concurrent `clear` cannot be undone.
    pub fn sync_pass(&self) -> Result<SyncOutcome, CheckpointError> {
        let _guard = self.write_guard();
        let Some(mut pending) = self.take_pending() else {
            return Ok(SyncOutcome::Idle);
        };

        match self.write_snapshot(&pending.request) {
            Ok(()) => {
                info!(session_id = %pending.request.session_id, "Pending checkpoint synced");
                Ok(SyncOutcome::Synced)
            }
            Err(e) => {
                pending.failures += 1;
                if pending.failures >= self.settings.max_sync_retries {
                    warn!(
                        session_id = %pending.request.session_id,
                        failures = pending.failures,
                        error = %e,
                        "Dropping checkpoint after repeated failures"
                    );
                    let message = format!(
                        "checkpoint dropped after {} failed sync attempts: {}",
                        pending.failures, e
                    );
                    if let Err(record_err) = self.save_error(&pending.request.session_id, &message) {
                        warn!(error = %record_err, "Could not record dropped checkpoint");
                    }
                    return Ok(SyncOutcome::Dropped);
                }

                let failures = pending.failures;
                self.restore_pending(pending);
                Ok(SyncOutcome::Retrying { failures })
            }
        }
    }

    /// Remove a snapshot that has aged out; returns whether one was removed
    pub fn cleanup_pass(&self) -> Result<bool, CheckpointError> {
        let _guard = self.write_guard();
        let Some(session_id) = self.read_string(keys::ACTIVE_SESSION)? else {
            return Ok(false);
        };

        let stale = match self.read_i64(keys::LAST_UPDATE)? {
            Some(last_update) => self.clock.now_ms() - last_update >= self.settings.max_age_ms(),
            None => true,
        };

        if stale {
            info!(%session_id, "Removing stale checkpoint");
            self.remove_snapshot()?;
        }
        Ok(stale)
    }

    /// Inspect the stored state without touching the attempt counter
    pub fn peek_diagnostics(&self) -> Result<CheckpointDiagnostics, CheckpointError> {
        let session_id = self.read_string(keys::ACTIVE_SESSION)?;
        let last_checkpoint_time = self.read_i64(keys::LAST_UPDATE)?;
        let crash_attempts = self.read_attempts()?;

        let has_recoverable_session = match (&session_id, last_checkpoint_time) {
            (Some(_), Some(last_update)) => {
                self.clock.now_ms() - last_update < self.settings.max_age_ms()
                    && crash_attempts < self.settings.max_crash_attempts
            }
            _ => false,
        };

        Ok(CheckpointDiagnostics {
            has_recoverable_session,
            session_id,
            last_checkpoint_time,
            crash_attempts,
            last_error: self.read_string(keys::LAST_ERROR)?,
            last_error_time: self.read_i64(keys::LAST_ERROR_TIME)?,
            pending_write: self.has_pending(),
        })
    }

    fn read_string(&self, key: &str) -> Result<Option<String>, CheckpointError> {
        match self.store.get(key)? {
            Some(raw) => String::from_utf8(raw).map(Some).map_err(|e| {
                DatabaseError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
                .into()
            }),
            None => Ok(None),
        }
    }

    fn read_i64(&self, key: &str) -> Result<Option<i64>, CheckpointError> {
        match self.read_string(key)? {
            Some(text) => text.trim().parse::<i64>().map(Some).map_err(|e| {
                DatabaseError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
                .into()
            }),
            None => Ok(None),
        }
    }

    fn read_attempts(&self) -> Result<u32, CheckpointError> {
        match self.store.get(keys::CRASH_ATTEMPTS)? {
            Some(raw) => Ok(decode_counter(keys::CRASH_ATTEMPTS, &raw)?),
            None => Ok(0),
        }
    }

    fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_pending(&self, pending: Option<PendingWrite>) {
        if let Ok(mut slot) = self.pending.lock() {
            *slot = pending;
        }
    }

    fn take_pending(&self) -> Option<PendingWrite> {
        self.pending.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Put a failed retry back unless a newer write has been parked meanwhile
    fn restore_pending(&self, pending: PendingWrite) {
        if let Ok(mut slot) = self.pending.lock() {
            if slot.is_none() {
                *slot = Some(pending);
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }
}

/// Where the controller sends checkpoint traffic
///
/// Calls never block on storage errors; failures are logged and left to the
/// store's retry path.
pub trait CheckpointSink: Send + Sync {
    fn submit(&self, request: CheckpointRequest);

    fn record_error(&self, session_id: &str, message: &str);

    fn clear(&self);
}

/// Writes straight through on the caller's thread
pub struct DirectCheckpointSink {
    store: Arc<CheckpointStore>,
}

impl DirectCheckpointSink {
    pub fn new(store: Arc<CheckpointStore>) -> Self {
        Self { store }
    }
}

impl CheckpointSink for DirectCheckpointSink {
    fn submit(&self, request: CheckpointRequest) {
        // Failure is already logged and parked by the store
        let _ = self.store.save_checkpoint(&request);
    }

    fn record_error(&self, session_id: &str, message: &str) {
        if let Err(e) = self.store.save_error(session_id, message) {
            warn!(error = %e, "Could not record error");
        }
    }

    fn clear(&self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Could not clear checkpoint");
        }
    }
}

#[derive(Debug, Clone)]
enum WriterCommand {
    Save(CheckpointRequest),
    Clear,
}

#[derive(Debug, Clone, Default)]
struct WriterSlot {
    seq: u64,
    command: Option<WriterCommand>,
    closing: bool,
}

/// Latest-value checkpoint writer
///
/// Requests land in a `watch` slot; a dedicated task drains the slot and
/// performs the blocking write. A request that arrives while a write is in
/// flight replaces any earlier request still waiting, so storage stalls
/// never queue work up behind the tracking path.
pub struct CoalescingCheckpointWriter {
    store: Arc<CheckpointStore>,
    slot: watch::Sender<WriterSlot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CoalescingCheckpointWriter {
    /// Start the writer task; must be called inside a tokio runtime
    pub fn spawn(store: Arc<CheckpointStore>) -> Arc<Self> {
        let (slot, mut rx) = watch::channel(WriterSlot::default());
        let writer_store = store.clone();

        let task = tokio::spawn(async move {
            let mut processed = 0u64;
            loop {
                let closed = rx.changed().await.is_err();
                let current = rx.borrow_and_update().clone();

                if current.seq > processed {
                    processed = current.seq;
                    if let Some(command) = current.command {
                        Self::execute(writer_store.clone(), command).await;
                    }
                }

                if closed || current.closing {
                    break;
                }
            }
            debug!("Checkpoint writer stopped");
        });

        Arc::new(Self {
            store,
            slot,
            task: Mutex::new(Some(task)),
        })
    }

    async fn execute(store: Arc<CheckpointStore>, command: WriterCommand) {
        let result = tokio::task::spawn_blocking(move || match command {
            WriterCommand::Save(request) => store.save_checkpoint(&request),
            WriterCommand::Clear => store.clear(),
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Checkpoint writer operation failed"),
            Err(e) => warn!(error = %e, "Checkpoint writer task panicked"),
        }
    }

    fn send(&self, command: WriterCommand) {
        self.slot.send_modify(|slot| {
            slot.seq += 1;
            slot.command = Some(command);
        });
    }

    /// Flush the last request and stop the writer task
    pub async fn shutdown(&self) {
        self.slot.send_modify(|slot| slot.closing = true);
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Checkpoint writer did not shut down cleanly");
            }
        }
    }
}

impl CheckpointSink for CoalescingCheckpointWriter {
    fn submit(&self, request: CheckpointRequest) {
        self.send(WriterCommand::Save(request));
    }

    // Errors bypass the slot so they never displace a queued snapshot
    fn record_error(&self, session_id: &str, message: &str) {
        let store = self.store.clone();
        let session_id = session_id.to_string();
        let message = message.to_string();
        let write = move || {
            if let Err(e) = store.save_error(&session_id, &message) {
                warn!(error = %e, "Could not record error");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }

    fn clear(&self) {
        self.send(WriterCommand::Clear);
    }
}

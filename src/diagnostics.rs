//! Read-only diagnostics for support tooling

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::checkpoint::CheckpointDiagnostics;
use crate::controller::{TrackingSnapshot, TrackingState};
use crate::filter::FilterStats;
use crate::models::SignalQuality;

/// Point-in-time view of tracking and checkpoint health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsSnapshot {
    /// When the snapshot was generated
    pub generated_at: DateTime<Utc>,

    /// A checkpoint exists that recovery would accept
    pub has_recoverable_session: bool,

    pub tracking_state: TrackingState,

    /// Live session id, else the checkpointed one
    pub session_id: Option<String>,

    pub last_error: Option<String>,
    pub last_error_time: Option<i64>,
    pub last_checkpoint_time: Option<i64>,
    pub crash_attempts: u32,
    pub pending_checkpoint: bool,
    pub signal_quality: SignalQuality,
    pub samples: FilterStats,

    /// Crate version that produced the snapshot
    pub version: String,
}

impl DiagnosticsSnapshot {
    pub fn collect(
        tracking: &TrackingSnapshot,
        samples: &FilterStats,
        checkpoint: &CheckpointDiagnostics,
    ) -> Self {
        Self {
            generated_at: Utc::now(),
            has_recoverable_session: checkpoint.has_recoverable_session,
            tracking_state: tracking.state,
            session_id: tracking
                .session_id
                .clone()
                .or_else(|| checkpoint.session_id.clone()),
            last_error: tracking
                .last_error
                .clone()
                .or_else(|| checkpoint.last_error.clone()),
            last_error_time: checkpoint.last_error_time,
            last_checkpoint_time: checkpoint.last_checkpoint_time,
            crash_attempts: checkpoint.crash_attempts,
            pending_checkpoint: checkpoint.pending_write,
            signal_quality: tracking.signal_quality,
            samples: samples.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn last_error_at(&self) -> Option<DateTime<Utc>> {
        self.last_error_time.and_then(DateTime::from_timestamp_millis)
    }

    pub fn last_checkpoint_at(&self) -> Option<DateTime<Utc>> {
        self.last_checkpoint_time
            .and_then(DateTime::from_timestamp_millis)
    }

    /// Save snapshot to file
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = fs::File::create(path)?;
        file.write_all(json.as_bytes())?;
        tracing::info!("Diagnostics saved to {}", path.display());
        Ok(())
    }

    /// Save snapshot to the default diagnostics directory
    pub fn save_default(&self) -> anyhow::Result<PathBuf> {
        let filename = format!(
            "runcoach_diagnostics_{}.json",
            self.generated_at.format("%Y%m%d_%H%M%S")
        );

        let path = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("runcoach")
            .join("diagnostics");

        fs::create_dir_all(&path)?;
        let full_path = path.join(filename);

        self.save_to_file(&full_path)?;
        Ok(full_path)
    }
}

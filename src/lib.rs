// Library interface for the RunCoach tracking core
// Integration tests and the CLI go through these modules

pub mod checkpoint;
pub mod coaching;
pub mod config;
pub mod controller;
pub mod database;
pub mod diagnostics;
pub mod error;
pub mod external;
pub mod filter;
pub mod host;
pub mod import;
pub mod logging;
pub mod metrics;
pub mod models;

// Re-export commonly used types for convenience
pub use models::*;
pub use checkpoint::{CheckpointSink, CheckpointStore, CoalescingCheckpointWriter, DirectCheckpointSink};
pub use coaching::{CoachingTriggerEngine, PaceZone};
pub use config::TrackerConfig;
pub use controller::{SessionController, TrackingSnapshot, TrackingState};
pub use database::{KeyValueStore, MemoryKeyValueStore, RunDatabase, SqliteKeyValueStore};
pub use diagnostics::DiagnosticsSnapshot;
pub use error::{Result, RunCoachError};
pub use filter::PositionFilter;
pub use host::{HostComponents, HostHandle, LaunchDirective, TrackingHost};
pub use logging::{LogConfig, LogFormat, LogLevel};
pub use metrics::MetricsCalculator;

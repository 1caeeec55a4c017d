//! Unified error hierarchy for RunCoach
//!
//! Every public operation in the tracking core returns one of these errors
//! instead of panicking across component boundaries. Observers only ever see
//! the `user_message()` rendering.

use thiserror::Error;

use crate::models::SessionStatus;

/// Top-level error type for all RunCoach operations
#[derive(Debug, Error)]
pub enum RunCoachError {
    /// Session lifecycle errors
    #[error("Tracking error: {0}")]
    Tracking(#[from] TrackingError),

    /// Checkpoint persistence and recovery errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Database operation errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Position source errors
    #[error("Position source error: {0}")]
    Source(#[from] SourceError),

    /// Track file import errors
    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Session lifecycle errors raised by the controller
#[derive(Debug, Error)]
pub enum TrackingError {
    /// A session is already running or paused
    #[error("A session is already in progress: {session_id}")]
    AlreadyActive { session_id: String },

    /// Operation requires a different lifecycle state
    #[error("Invalid state for {operation}: {state}")]
    InvalidState { operation: String, state: String },

    /// There is no session to operate on
    #[error("No session in progress")]
    NoSession,

    /// The position source cannot deliver samples
    #[error("Position source unavailable")]
    PositionSourceUnavailable,

    /// The keep-alive resource could not be acquired
    #[error("Keep-alive acquisition failed: {reason}")]
    KeepAlive { reason: String },
}

impl TrackingError {
    pub(crate) fn invalid_state(operation: &str, status: Option<SessionStatus>) -> Self {
        TrackingError::InvalidState {
            operation: operation.to_string(),
            state: status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "IDLE".to_string()),
        }
    }
}

/// Checkpoint adapter errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Underlying key/value store failed
    #[error("Storage failure: {0}")]
    Storage(#[from] DatabaseError),

    /// Snapshot payload could not be encoded or decoded
    #[error("Serialization failed for {key}: {reason}")]
    Serialization { key: String, reason: String },

    /// History slice could not be compressed or decompressed
    #[error("Compression failed: {0}")]
    Compression(#[from] std::io::Error),

    /// The checkpoint writer task has shut down
    #[error("Checkpoint writer closed")]
    WriterClosed,
}

/// Database operation errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// SQLite failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A connection lock was poisoned by a panicking writer
    #[error("Connection lock poisoned")]
    LockPoisoned,

    /// Record not found
    #[error("Record not found: {table}.{id}")]
    NotFound { table: String, id: String },

    /// Stored value could not be decoded
    #[error("Corrupt value for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Store rejected the write (used by test doubles and read-only stores)
    #[error("Write rejected: {reason}")]
    WriteRejected { reason: String },
}

/// Position source errors
#[derive(Debug, Error)]
pub enum SourceError {
    /// Capability missing (no permission, no hardware)
    #[error("Position source unavailable: {reason}")]
    Unavailable { reason: String },

    /// Source stopped delivering or reported a failure
    #[error("Position source failed: {reason}")]
    Failed { reason: String },

    /// Automatic restarts used up
    #[error("Position source restart budget exhausted after {attempts} attempts")]
    RestartsExhausted { attempts: u32 },
}

/// Track file import errors
#[derive(Debug, Error)]
pub enum ImportError {
    /// No importer handles this file
    #[error("Unsupported format: {format}")]
    UnsupportedFormat { format: String },

    /// Format-specific parsing error
    #[error("Parse error in {format}: {reason}")]
    Parse { format: String, reason: String },

    /// File contained no usable samples
    #[error("No track points found in {path}")]
    Empty { path: String },
}

/// Result type alias for RunCoach operations
pub type Result<T> = std::result::Result<T, RunCoachError>;

impl RunCoachError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RunCoachError::Database(DatabaseError::Sqlite(_))
                | RunCoachError::Checkpoint(CheckpointError::Storage(_))
                | RunCoachError::Source(SourceError::Failed { .. })
                | RunCoachError::Io(_)
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RunCoachError::Tracking(TrackingError::AlreadyActive { .. }) => ErrorSeverity::Warning,
            RunCoachError::Tracking(TrackingError::InvalidState { .. }) => ErrorSeverity::Warning,
            RunCoachError::Tracking(TrackingError::NoSession) => ErrorSeverity::Warning,
            RunCoachError::Tracking(_) => ErrorSeverity::Error,
            RunCoachError::Checkpoint(_) => ErrorSeverity::Warning,
            RunCoachError::Database(DatabaseError::NotFound { .. }) => ErrorSeverity::Warning,
            RunCoachError::Database(_) => ErrorSeverity::Error,
            RunCoachError::Source(SourceError::RestartsExhausted { .. }) => ErrorSeverity::Critical,
            RunCoachError::Source(_) => ErrorSeverity::Error,
            RunCoachError::Internal(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            RunCoachError::Tracking(TrackingError::AlreadyActive { .. }) => {
                "A run is already being tracked.".to_string()
            }
            RunCoachError::Tracking(TrackingError::PositionSourceUnavailable)
            | RunCoachError::Source(SourceError::Unavailable { .. }) => {
                "Location is unavailable. Check that location access is enabled.".to_string()
            }
            RunCoachError::Source(SourceError::Failed { .. }) => {
                "Lost the location signal. Trying to reconnect...".to_string()
            }
            RunCoachError::Source(SourceError::RestartsExhausted { .. }) => {
                "Location tracking stopped. Please restart your run.".to_string()
            }
            RunCoachError::Checkpoint(_) => {
                "Could not save run progress. Tracking continues.".to_string()
            }
            _ => self.to_string(),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical system error requiring immediate attention
    Critical,
    /// Error that prevents operation but system can continue
    Error,
    /// Warning that doesn't prevent operation
    Warning,
    /// Informational message
    Info,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Critical => tracing::Level::ERROR,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Warning => tracing::Level::WARN,
            ErrorSeverity::Info => tracing::Level::INFO,
        }
    }
}

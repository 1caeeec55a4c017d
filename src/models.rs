use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Milliseconds in one minute, used by the pace helpers
pub const MS_PER_MINUTE: f64 = 60_000.0;

/// One timestamped position reading delivered by the position source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    /// Latitude in decimal degrees
    pub latitude: f64,

    /// Longitude in decimal degrees
    pub longitude: f64,

    /// Altitude in meters above sea level
    pub altitude: Option<f64>,

    /// Horizontal accuracy radius in meters (lower is better)
    pub accuracy: f64,

    /// Instantaneous speed reported by the receiver, meters per second
    pub speed: Option<f64>,

    /// Bearing in degrees from true north
    pub bearing: Option<f64>,

    /// Wall-clock timestamp in milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl LocationSample {
    /// Create a sample with only the mandatory fields set
    pub fn new(latitude: f64, longitude: f64, accuracy: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
            accuracy,
            speed: None,
            bearing: None,
            timestamp,
        }
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = Some(altitude);
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_bearing(mut self, bearing: f64) -> Self {
        self.bearing = Some(bearing);
        self
    }

    /// True when both coordinates are finite and inside the WGS84 ranges
    pub fn has_valid_coordinates(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Lifecycle status of a run session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    Paused,
    Stopped,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "ACTIVE"),
            SessionStatus::Paused => write!(f, "PAUSED"),
            SessionStatus::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// A single run, owned by the session controller until it is stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSession {
    /// Unique identifier for the session
    pub id: String,

    /// Owning user identifier
    pub user_id: String,

    /// Start time in epoch milliseconds
    pub start_time: i64,

    /// End time in epoch milliseconds, None while the session is live
    pub end_time: Option<i64>,

    /// Moving duration in milliseconds (paused time excluded)
    pub duration_ms: u64,

    /// Cumulative distance in meters
    pub distance_meters: f64,

    /// Average pace in minutes per kilometer
    pub average_pace: f64,

    /// Current lifecycle status
    pub status: SessionStatus,
}

impl RunSession {
    /// Create a fresh active session
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, start_time: i64) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            start_time,
            end_time: None,
            duration_ms: 0,
            distance_meters: 0.0,
            average_pace: 0.0,
            status: SessionStatus::Active,
        }
    }

    /// Copy cumulative figures from the latest metrics
    pub fn apply_metrics(&mut self, metrics: &RunMetrics) {
        self.duration_ms = metrics.duration_ms;
        self.distance_meters = metrics.distance_meters;
        self.average_pace = metrics.average_pace;
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.start_time)
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.end_time.and_then(DateTime::from_timestamp_millis)
    }
}

/// Metrics derived from the accepted location history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Distance covered in meters
    pub distance_meters: f64,

    /// Moving duration in milliseconds
    pub duration_ms: u64,

    /// Average pace in minutes per kilometer (0 when no distance)
    pub average_pace: f64,

    /// Current pace in minutes per kilometer (0 when not moving)
    pub current_pace: f64,

    /// Average speed in meters per second
    pub average_speed: f64,

    /// Current speed in meters per second
    pub current_speed: f64,

    /// Total positive altitude change in meters
    pub elevation_gain: f64,

    /// Estimated energy expenditure in kilocalories
    pub calories: f64,

    /// Number of samples the metrics were derived from
    pub sample_count: usize,

    /// Timestamp of the computation in epoch milliseconds
    pub last_update_time: i64,
}

impl RunMetrics {
    pub fn duration_seconds(&self) -> u64 {
        self.duration_ms / 1000
    }

    pub fn duration_minutes(&self) -> f64 {
        self.duration_ms as f64 / MS_PER_MINUTE
    }

    pub fn distance_km(&self) -> f64 {
        self.distance_meters / 1000.0
    }
}

/// Durable partial state used to resume a session after abnormal termination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub session_id: String,
    pub user_id: String,
    /// Accepted history as of the last checkpoint
    pub locations: Vec<LocationSample>,
    /// Metrics as of the last checkpoint
    pub metrics: RunMetrics,
    /// Wall-clock time of the last checkpoint write
    pub last_update_time: i64,
    /// Recovery attempts made so far, including the one that produced this value
    pub crash_attempts: u32,
}

/// Kinds of coaching feedback the trigger engine can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerType {
    PaceTooFast,
    PaceTooSlow,
    PaceOptimal,
    DistanceMilestone,
    TimeMilestone,
    HeartRateHigh,
    PhaseChange,
}

impl TriggerType {
    /// Pace warnings share the short warning cooldown
    pub fn is_pace_warning(&self) -> bool {
        matches!(self, TriggerType::PaceTooFast | TriggerType::PaceTooSlow)
    }

    pub fn is_milestone(&self) -> bool {
        matches!(
            self,
            TriggerType::DistanceMilestone | TriggerType::TimeMilestone
        )
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerType::PaceTooFast => write!(f, "PACE_TOO_FAST"),
            TriggerType::PaceTooSlow => write!(f, "PACE_TOO_SLOW"),
            TriggerType::PaceOptimal => write!(f, "PACE_OPTIMAL"),
            TriggerType::DistanceMilestone => write!(f, "DISTANCE_MILESTONE"),
            TriggerType::TimeMilestone => write!(f, "TIME_MILESTONE"),
            TriggerType::HeartRateHigh => write!(f, "HEART_RATE_HIGH"),
            TriggerType::PhaseChange => write!(f, "PHASE_CHANGE"),
        }
    }
}

/// How strongly the runner should react to a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UrgencyLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Delivery ordering for the audio collaborator (Urgent sorts first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TriggerPriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// Ephemeral coaching instruction handed to the voice collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoachingTrigger {
    pub trigger_type: TriggerType,
    pub urgency: UrgencyLevel,
    pub priority: TriggerPriority,
    /// Text meant to be spoken to the runner
    pub message: String,
    /// Diagnostic context, never spoken
    pub context: String,
}

/// Coarse session stage; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CoachingPhase {
    Warmup,
    MainWorkout,
    Cooldown,
}

impl std::fmt::Display for CoachingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoachingPhase::Warmup => write!(f, "WARMUP"),
            CoachingPhase::MainWorkout => write!(f, "MAIN_WORKOUT"),
            CoachingPhase::Cooldown => write!(f, "COOLDOWN"),
        }
    }
}

/// Position signal classification, exposed for diagnostics only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Unknown,
}

impl SignalQuality {
    /// Classify a horizontal accuracy radius in meters
    pub fn from_accuracy(accuracy: f64) -> Self {
        if !accuracy.is_finite() || accuracy < 0.0 {
            SignalQuality::Unknown
        } else if accuracy <= 5.0 {
            SignalQuality::Excellent
        } else if accuracy <= 10.0 {
            SignalQuality::Good
        } else if accuracy <= 20.0 {
            SignalQuality::Fair
        } else {
            SignalQuality::Poor
        }
    }
}

impl std::fmt::Display for SignalQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalQuality::Excellent => write!(f, "excellent"),
            SignalQuality::Good => write!(f, "good"),
            SignalQuality::Fair => write!(f, "fair"),
            SignalQuality::Poor => write!(f, "poor"),
            SignalQuality::Unknown => write!(f, "unknown"),
        }
    }
}

/// Convert a speed in m/s to a pace in min/km (0 when not moving)
pub fn pace_from_speed(speed_mps: f64) -> f64 {
    if speed_mps > 0.0 && speed_mps.is_finite() {
        1000.0 / (speed_mps * 60.0)
    } else {
        0.0
    }
}

/// Render a pace in min/km as `m:ss`
pub fn format_pace(pace_min_per_km: f64) -> String {
    if pace_min_per_km <= 0.0 || !pace_min_per_km.is_finite() {
        return "--:--".to_string();
    }
    let total_seconds = (pace_min_per_km * 60.0).round() as u64;
    format!("{}:{:02}", total_seconds / 60, total_seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_quality_bands() {
        assert_eq!(SignalQuality::from_accuracy(3.0), SignalQuality::Excellent);
        assert_eq!(SignalQuality::from_accuracy(5.0), SignalQuality::Excellent);
        assert_eq!(SignalQuality::from_accuracy(9.9), SignalQuality::Good);
        assert_eq!(SignalQuality::from_accuracy(20.0), SignalQuality::Fair);
        assert_eq!(SignalQuality::from_accuracy(20.1), SignalQuality::Poor);
        assert_eq!(SignalQuality::from_accuracy(f64::NAN), SignalQuality::Unknown);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TriggerPriority::Urgent > TriggerPriority::High);
        assert!(TriggerPriority::High > TriggerPriority::Normal);
        assert!(TriggerPriority::Normal > TriggerPriority::Low);
    }

    #[test]
    fn test_phase_ordering() {
        assert!(CoachingPhase::Warmup < CoachingPhase::MainWorkout);
        assert!(CoachingPhase::MainWorkout < CoachingPhase::Cooldown);
    }

    #[test]
    fn test_pace_helpers() {
        // 3.333 m/s is 5:00/km
        let pace = pace_from_speed(1000.0 / 300.0);
        assert!((pace - 5.0).abs() < 1e-9);
        assert_eq!(format_pace(pace), "5:00");
        assert_eq!(format_pace(4.5), "4:30");
        assert_eq!(pace_from_speed(0.0), 0.0);
        assert_eq!(format_pace(0.0), "--:--");
    }

    #[test]
    fn test_coordinate_validation() {
        assert!(LocationSample::new(45.0, 7.0, 5.0, 0).has_valid_coordinates());
        assert!(!LocationSample::new(91.0, 7.0, 5.0, 0).has_valid_coordinates());
        assert!(!LocationSample::new(45.0, -180.5, 5.0, 0).has_valid_coordinates());
        assert!(!LocationSample::new(f64::NAN, 0.0, 5.0, 0).has_valid_coordinates());
    }
}

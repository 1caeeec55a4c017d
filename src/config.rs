use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::RunCoachError;
use crate::logging::LogConfig;

/// Main tracker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Configuration metadata
    pub metadata: ConfigMetadata,

    /// Parameters requested from the position source
    pub location: LocationRequest,

    /// Sample acceptance rules
    pub filter: FilterSettings,

    /// Coaching trigger thresholds and cooldowns
    pub coaching: CoachingSettings,

    /// Crash-recovery persistence
    pub checkpoint: CheckpointSettings,

    /// Background host behavior
    pub host: HostSettings,

    /// Logging output
    pub logging: LogConfig,
}

/// Configuration metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigMetadata {
    /// Configuration format version
    pub version: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

/// Delivery parameters requested from the position source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationRequest {
    /// Nominal delivery interval in milliseconds
    pub interval_ms: u64,

    /// Fastest interval the source may deliver at
    pub fastest_interval_ms: u64,

    /// Minimum displacement in meters between deliveries
    pub min_displacement_m: f64,
}

/// Position filter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// Worst horizontal accuracy accepted into history, meters
    pub max_accuracy_m: f64,

    /// Number of raw samples averaged for the signal-quality reading
    pub quality_window: usize,
}

/// Coaching trigger engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoachingSettings {
    /// Target pace in minutes per kilometer (no pace coaching when unset)
    pub target_pace: Option<f64>,

    /// Heart rate ceiling in bpm (no heart-rate coaching when unset)
    pub max_heart_rate: Option<u16>,

    /// Consecutive evaluations a zone must hold before it is announced
    pub stability_threshold: u32,

    /// Pace readings in the moving average
    pub pace_window: usize,

    /// Heart rate readings in the moving average
    pub heart_rate_window: usize,

    /// Deviation from target (min/km) still considered optimal
    pub optimal_band: f64,

    /// Absolute deviation (min/km) that flags a pace warning
    pub absolute_deviation: f64,

    /// Relative deviation that flags a pace warning
    pub relative_deviation: f64,

    /// Relative deviation that escalates a pace warning to urgent
    pub urgent_relative_deviation: f64,

    pub pace_warning_cooldown_secs: u64,
    pub motivation_cooldown_secs: u64,
    pub milestone_cooldown_secs: u64,

    /// Distance milestones in kilometers
    pub distance_milestones_km: Vec<f64>,

    /// Time milestones in minutes
    pub time_milestones_min: Vec<u64>,

    /// Band above a distance milestone in which it may still fire, meters
    pub distance_tolerance_m: f64,

    /// Band above a time milestone in which it may still fire, seconds
    pub time_tolerance_secs: u64,

    /// Warmup lasts at least this long
    pub warmup_min_duration_secs: u64,

    /// Warmup lasts at least this far
    pub warmup_min_distance_m: f64,

    /// Cooldown starts after this much moving time
    pub cooldown_after_secs: u64,
}

/// Checkpoint store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    /// SQLite database holding checkpoints and finished runs
    pub database_path: PathBuf,

    /// Accepted samples between checkpoint writes
    pub interval_samples: u32,

    /// Snapshots older than this are never recovered
    pub max_age_hours: u64,

    /// Recovery attempts allowed per snapshot
    pub max_crash_attempts: u32,

    /// Sync passes a failed write survives before it is dropped
    pub max_sync_retries: u32,

    /// Period of the background sync pass
    pub sync_interval_secs: u64,

    /// Period of the stale snapshot cleanup pass
    pub cleanup_interval_secs: u64,
}

/// Continuous execution host settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Fixed delay before restarting a failed position source
    pub source_restart_delay_secs: u64,

    /// Restarts allowed per session before tracking is failed
    pub max_source_restarts: u32,

    /// Capacity of the sample channel
    pub sample_buffer: usize,

    /// Capacity of the command channel
    pub command_buffer: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        let now = Utc::now();

        TrackerConfig {
            metadata: ConfigMetadata {
                version: "1.0".to_string(),
                created_at: now,
                updated_at: now,
            },
            location: LocationRequest::default(),
            filter: FilterSettings::default(),
            coaching: CoachingSettings::default(),
            checkpoint: CheckpointSettings::default(),
            host: HostSettings::default(),
            logging: LogConfig::default(),
        }
    }
}

impl Default for ConfigMetadata {
    fn default() -> Self {
        let now = Utc::now();
        ConfigMetadata {
            version: "1.0".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for LocationRequest {
    fn default() -> Self {
        LocationRequest {
            interval_ms: 1000,
            fastest_interval_ms: 500,
            min_displacement_m: 1.0,
        }
    }
}

impl Default for FilterSettings {
    fn default() -> Self {
        FilterSettings {
            max_accuracy_m: 20.0,
            quality_window: 5,
        }
    }
}

impl Default for CoachingSettings {
    fn default() -> Self {
        CoachingSettings {
            target_pace: None,
            max_heart_rate: None,
            stability_threshold: 3,
            pace_window: 10,
            heart_rate_window: 5,
            optimal_band: 0.2,
            absolute_deviation: 0.5,
            relative_deviation: 0.15,
            urgent_relative_deviation: 0.25,
            pace_warning_cooldown_secs: 45,
            motivation_cooldown_secs: 120,
            milestone_cooldown_secs: 10,
            distance_milestones_km: vec![1.0, 2.0, 3.0, 5.0, 10.0, 15.0, 20.0],
            time_milestones_min: vec![10, 20, 30, 45, 60],
            distance_tolerance_m: 50.0,
            time_tolerance_secs: 30,
            warmup_min_duration_secs: 5 * 60,
            warmup_min_distance_m: 500.0,
            cooldown_after_secs: 30 * 60,
        }
    }
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        CheckpointSettings {
            database_path: default_data_dir().join("runcoach.db"),
            interval_samples: 10,
            max_age_hours: 24,
            max_crash_attempts: 3,
            max_sync_retries: 3,
            sync_interval_secs: 15 * 60,
            cleanup_interval_secs: 24 * 60 * 60,
        }
    }
}

impl Default for HostSettings {
    fn default() -> Self {
        HostSettings {
            source_restart_delay_secs: 5,
            max_source_restarts: 3,
            sample_buffer: 256,
            command_buffer: 32,
        }
    }
}

impl CoachingSettings {
    /// Builder-style override used by the CLI and tests
    pub fn with_target_pace(mut self, pace_min_per_km: f64) -> Self {
        self.target_pace = Some(pace_min_per_km);
        self
    }
}

impl CheckpointSettings {
    pub fn max_age_ms(&self) -> i64 {
        (self.max_age_hours as i64) * 60 * 60 * 1000
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runcoach")
}

/// Configuration management implementation
impl TrackerConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: TrackerConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.metadata.updated_at = Utc::now();

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml_content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize configuration to TOML")?;

        fs::write(&path, toml_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".runcoach")
            .join("config.toml")
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default() -> Self {
        let config_path = Self::default_config_path();

        match Self::load_from_file(&config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    path = %config_path.display(),
                    error = %e,
                    "Config file not usable, using defaults"
                );
                Self::default()
            }
        }
    }

    /// Reject settings the tracking core cannot run with
    pub fn validate(&self) -> std::result::Result<(), RunCoachError> {
        let invalid = |msg: &str| Err(RunCoachError::Configuration(msg.to_string()));

        if !(self.filter.max_accuracy_m > 0.0) {
            return invalid("filter.max_accuracy_m must be positive");
        }
        if self.filter.quality_window == 0 {
            return invalid("filter.quality_window must be at least 1");
        }
        if let Some(pace) = self.coaching.target_pace {
            if !(pace > 0.0) || !pace.is_finite() {
                return invalid("coaching.target_pace must be a positive number of min/km");
            }
        }
        if self.coaching.stability_threshold == 0 {
            return invalid("coaching.stability_threshold must be at least 1");
        }
        if self.coaching.pace_window == 0 || self.coaching.heart_rate_window == 0 {
            return invalid("coaching smoothing windows must hold at least one reading");
        }
        if self.checkpoint.interval_samples == 0 {
            return invalid("checkpoint.interval_samples must be at least 1");
        }
        if self.checkpoint.max_crash_attempts == 0 {
            return invalid("checkpoint.max_crash_attempts must be at least 1");
        }
        if self.checkpoint.sync_interval_secs == 0 || self.checkpoint.cleanup_interval_secs == 0 {
            return invalid("checkpoint pass intervals must be at least one second");
        }
        if self.host.sample_buffer == 0 || self.host.command_buffer == 0 {
            return invalid("host channel buffers must be non-zero");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_serialization() {
        let config = TrackerConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: TrackerConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.metadata.version, deserialized.metadata.version);
        assert_eq!(config.coaching, deserialized.coaching);
        assert_eq!(config.checkpoint, deserialized.checkpoint);
    }

    #[test]
    fn test_defaults_match_tracking_rules() {
        let config = TrackerConfig::default();
        assert_eq!(config.filter.max_accuracy_m, 20.0);
        assert_eq!(config.location.interval_ms, 1000);
        assert_eq!(config.location.fastest_interval_ms, 500);
        assert_eq!(config.coaching.stability_threshold, 3);
        assert_eq!(config.coaching.pace_warning_cooldown_secs, 45);
        assert_eq!(config.checkpoint.interval_samples, 10);
        assert_eq!(config.checkpoint.max_crash_attempts, 3);
        assert_eq!(config.checkpoint.max_age_ms(), 24 * 3_600_000);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let toml_str = r#"
            [coaching]
            target_pace = 5.5
        "#;
        let config: TrackerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.coaching.target_pace, Some(5.5));
        assert_eq!(config.coaching.pace_window, 10);
        assert_eq!(config.host.max_source_restarts, 3);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = TrackerConfig::default();
        config.coaching.target_pace = Some(-1.0);
        assert!(config.validate().is_err());

        let mut config = TrackerConfig::default();
        config.checkpoint.interval_samples = 0;
        assert!(config.validate().is_err());

        assert!(TrackerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_file_io() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = TrackerConfig::default();
        original.coaching.target_pace = Some(4.75);
        original.save_to_file(&config_path).unwrap();

        let loaded = TrackerConfig::load_from_file(&config_path).unwrap();
        assert_eq!(loaded.coaching.target_pace, Some(4.75));
    }
}

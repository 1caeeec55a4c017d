//! Live run metrics
//!
//! `MetricsCalculator::calculate` is a pure function of the accepted history:
//! the same history, paused time and timestamp always produce bit-identical
//! metrics, so the controller can recompute after every sample and after a
//! restore without drift.

use crate::models::{pace_from_speed, LocationSample, RunMetrics, MS_PER_MINUTE};

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Energy estimate per kilometer, independent of runner mass
pub const KCAL_PER_KM: f64 = 60.0;

/// Great-circle distance between two coordinates in meters
///
/// The haversine term is clamped to [0, 1] so rounding on near-antipodal or
/// identical points never produces NaN.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);

    let c = 2.0 * a.clamp(0.0, 1.0).sqrt().asin();

    EARTH_RADIUS_M * c
}

/// Distance between two samples in meters
pub fn sample_distance(a: &LocationSample, b: &LocationSample) -> f64 {
    haversine_distance(a.latitude, a.longitude, b.latitude, b.longitude)
}

/// Stateless calculator for `RunMetrics`
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCalculator;

impl MetricsCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Derive metrics from an ordered history
    ///
    /// * `paused_ms` - wall time spent paused, excluded from duration
    /// * `now_ms` - timestamp recorded as the metrics' update time
    pub fn calculate(&self, history: &[LocationSample], paused_ms: u64, now_ms: i64) -> RunMetrics {
        let distance_meters = Self::total_distance(history);
        let duration_ms = Self::moving_duration(history, paused_ms);
        let elevation_gain = Self::elevation_gain(history);

        let average_pace = if distance_meters > 0.0 {
            (duration_ms as f64 / MS_PER_MINUTE) / (distance_meters / 1000.0)
        } else {
            0.0
        };

        let average_speed = if duration_ms > 0 {
            distance_meters / (duration_ms as f64 / 1000.0)
        } else {
            0.0
        };

        let current_speed = Self::current_speed(history);

        RunMetrics {
            distance_meters,
            duration_ms,
            average_pace,
            current_pace: pace_from_speed(current_speed),
            average_speed,
            current_speed,
            elevation_gain,
            calories: Self::estimate_calories(distance_meters),
            sample_count: history.len(),
            last_update_time: now_ms,
        }
    }

    /// Sum of consecutive great-circle distances
    pub fn total_distance(history: &[LocationSample]) -> f64 {
        if history.len() < 2 {
            return 0.0;
        }

        history
            .windows(2)
            .map(|w| sample_distance(&w[0], &w[1]))
            .sum()
    }

    /// Time between first and last sample minus paused time
    pub fn moving_duration(history: &[LocationSample], paused_ms: u64) -> u64 {
        match (history.first(), history.last()) {
            (Some(first), Some(last)) => {
                let span = last.timestamp.saturating_sub(first.timestamp).max(0) as u64;
                span.saturating_sub(paused_ms)
            }
            _ => 0,
        }
    }

    /// Total positive altitude change; losses are ignored
    pub fn elevation_gain(history: &[LocationSample]) -> f64 {
        history
            .windows(2)
            .filter_map(|w| match (w[0].altitude, w[1].altitude) {
                (Some(prev), Some(curr)) if curr > prev => Some(curr - prev),
                _ => None,
            })
            .sum()
    }

    /// Latest receiver speed, else derived from the last two samples
    pub fn current_speed(history: &[LocationSample]) -> f64 {
        let Some(last) = history.last() else {
            return 0.0;
        };

        if let Some(speed) = last.speed.filter(|s| s.is_finite() && *s >= 0.0) {
            return speed;
        }

        if history.len() < 2 {
            return 0.0;
        }

        let prev = &history[history.len() - 2];
        let dt_ms = last.timestamp - prev.timestamp;
        if dt_ms <= 0 {
            return 0.0;
        }

        sample_distance(prev, last) / (dt_ms as f64 / 1000.0)
    }

    /// Rough energy estimate from distance alone
    pub fn estimate_calories(distance_meters: f64) -> f64 {
        (distance_meters / 1000.0) * KCAL_PER_KM
    }
}

//! Position sample validation
//!
//! The filter decides whether a raw sample may enter the accepted history.
//! Rejections are silent for the caller apart from the per-reason counters,
//! which feed the diagnostics surface.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::trace;

use crate::config::FilterSettings;
use crate::models::{LocationSample, SignalQuality};

/// Why a sample was kept out of the history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// Accuracy radius above the configured ceiling, or not a finite number
    LowAccuracy,
    /// Latitude/longitude outside the valid ranges
    InvalidCoordinates,
    /// Timestamp earlier than the last accepted sample
    OutOfOrder,
}

/// Outcome of running one sample through the filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Accepted,
    Rejected(RejectReason),
}

impl FilterDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FilterDecision::Accepted)
    }
}

/// Counters exposed to diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStats {
    pub accepted: u64,
    pub rejected_accuracy: u64,
    pub rejected_coordinates: u64,
    pub rejected_out_of_order: u64,
}

impl FilterStats {
    pub fn rejected(&self) -> u64 {
        self.rejected_accuracy + self.rejected_coordinates + self.rejected_out_of_order
    }
}

/// Accuracy and range gate in front of the accepted history
#[derive(Debug, Clone)]
pub struct PositionFilter {
    max_accuracy_m: f64,
    quality_window: usize,
    recent_accuracy: VecDeque<f64>,
    last_accepted_timestamp: Option<i64>,
    stats: FilterStats,
}

impl PositionFilter {
    pub fn new(settings: &FilterSettings) -> Self {
        Self {
            max_accuracy_m: settings.max_accuracy_m,
            quality_window: settings.quality_window.max(1),
            recent_accuracy: VecDeque::with_capacity(settings.quality_window.max(1)),
            last_accepted_timestamp: None,
            stats: FilterStats::default(),
        }
    }

    /// Evaluate a raw sample. Every sample, accepted or not, updates the
    /// signal-quality window.
    pub fn evaluate(&mut self, sample: &LocationSample) -> FilterDecision {
        self.observe_accuracy(sample.accuracy);

        let decision = self.classify(sample);
        match decision {
            FilterDecision::Accepted => {
                self.stats.accepted += 1;
                self.last_accepted_timestamp = Some(sample.timestamp);
            }
            FilterDecision::Rejected(reason) => {
                match reason {
                    RejectReason::LowAccuracy => self.stats.rejected_accuracy += 1,
                    RejectReason::InvalidCoordinates => self.stats.rejected_coordinates += 1,
                    RejectReason::OutOfOrder => self.stats.rejected_out_of_order += 1,
                }
                trace!(?reason, accuracy = sample.accuracy, "Sample rejected");
            }
        }

        decision
    }

    fn classify(&self, sample: &LocationSample) -> FilterDecision {
        if !sample.accuracy.is_finite()
            || sample.accuracy < 0.0
            || sample.accuracy > self.max_accuracy_m
        {
            return FilterDecision::Rejected(RejectReason::LowAccuracy);
        }
        if !sample.has_valid_coordinates() {
            return FilterDecision::Rejected(RejectReason::InvalidCoordinates);
        }
        if let Some(last) = self.last_accepted_timestamp {
            if sample.timestamp < last {
                return FilterDecision::Rejected(RejectReason::OutOfOrder);
            }
        }
        FilterDecision::Accepted
    }

    fn observe_accuracy(&mut self, accuracy: f64) {
        if self.recent_accuracy.len() == self.quality_window {
            self.recent_accuracy.pop_front();
        }
        self.recent_accuracy.push_back(accuracy);
    }

    /// Rolling signal classification over the last few raw samples
    pub fn signal_quality(&self) -> SignalQuality {
        if self.recent_accuracy.is_empty() {
            return SignalQuality::Unknown;
        }
        let mean =
            self.recent_accuracy.iter().sum::<f64>() / self.recent_accuracy.len() as f64;
        SignalQuality::from_accuracy(mean)
    }

    pub fn stats(&self) -> &FilterStats {
        &self.stats
    }

    /// Continue after a restored history; older samples stay out of order
    pub fn resume_after(&mut self, last_timestamp: Option<i64>) {
        self.last_accepted_timestamp = last_timestamp;
    }

    /// Forget everything, used when a new session starts
    pub fn reset(&mut self) {
        self.recent_accuracy.clear();
        self.last_accepted_timestamp = None;
        self.stats = FilterStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn filter() -> PositionFilter {
        PositionFilter::new(&FilterSettings::default())
    }

    #[test]
    fn test_accepts_accurate_sample() {
        let mut f = filter();
        let decision = f.evaluate(&LocationSample::new(51.5, -0.12, 5.0, 1_000));
        assert_eq!(decision, FilterDecision::Accepted);
        assert_eq!(f.stats().accepted, 1);
    }

    #[test]
    fn test_accuracy_boundary_is_inclusive() {
        let mut f = filter();
        assert!(f.evaluate(&LocationSample::new(51.5, -0.12, 20.0, 1)).is_accepted());
        assert_eq!(
            f.evaluate(&LocationSample::new(51.5, -0.12, 20.01, 2)),
            FilterDecision::Rejected(RejectReason::LowAccuracy)
        );
    }

    #[test]
    fn test_rejects_out_of_range_coordinates() {
        let mut f = filter();
        assert_eq!(
            f.evaluate(&LocationSample::new(90.5, 0.0, 3.0, 1)),
            FilterDecision::Rejected(RejectReason::InvalidCoordinates)
        );
        assert_eq!(
            f.evaluate(&LocationSample::new(0.0, 181.0, 3.0, 2)),
            FilterDecision::Rejected(RejectReason::InvalidCoordinates)
        );
        assert_eq!(f.stats().rejected_coordinates, 2);
    }

    #[test]
    fn test_rejects_out_of_order_timestamp() {
        let mut f = filter();
        assert!(f.evaluate(&LocationSample::new(0.0, 0.0, 3.0, 2_000)).is_accepted());
        assert_eq!(
            f.evaluate(&LocationSample::new(0.0, 0.0, 3.0, 1_000)),
            FilterDecision::Rejected(RejectReason::OutOfOrder)
        );
        // Equal timestamps are allowed
        assert!(f.evaluate(&LocationSample::new(0.0, 0.0, 3.0, 2_000)).is_accepted());
    }

    #[test]
    fn test_signal_quality_rolls() {
        let mut f = filter();
        assert_eq!(f.signal_quality(), SignalQuality::Unknown);

        for ts in 0..5 {
            f.evaluate(&LocationSample::new(0.0, 0.0, 4.0, ts));
        }
        assert_eq!(f.signal_quality(), SignalQuality::Excellent);

        // Rejected samples still degrade the reading
        for ts in 5..10 {
            f.evaluate(&LocationSample::new(0.0, 0.0, 40.0, ts));
        }
        assert_eq!(f.signal_quality(), SignalQuality::Poor);
    }

    proptest! {
        #[test]
        fn test_low_accuracy_never_accepted(
            accuracy in 20.0001f64..10_000.0,
            lat in -90.0f64..90.0,
            lon in -180.0f64..180.0,
        ) {
            let mut f = filter();
            let decision = f.evaluate(&LocationSample::new(lat, lon, accuracy, 0));
            prop_assert_eq!(decision, FilterDecision::Rejected(RejectReason::LowAccuracy));
            prop_assert_eq!(f.stats().accepted, 0);
        }
    }
}

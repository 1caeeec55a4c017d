//! Coaching trigger engine
//!
//! Turns successive metrics snapshots into a prioritized list of coaching
//! triggers. The engine is driven synchronously by the session controller and
//! owns all of its hysteresis state:
//!
//! - moving averages over recent pace and heart-rate readings
//! - a stability counter so a zone must hold before it is announced
//! - per-trigger-type cooldown timestamps
//! - the set of milestones already announced this session
//!
//! All times are taken from `RunMetrics::last_update_time`, which makes the
//! engine deterministic for a given sequence of snapshots.

use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

use crate::config::CoachingSettings;
use crate::models::{
    format_pace, CoachingPhase, CoachingTrigger, RunMetrics, TriggerPriority, TriggerType,
    UrgencyLevel,
};

/// Effort relative to the target pace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaceZone {
    TooFast,
    Optimal,
    Acceptable,
    TooSlow,
}

// Pace arithmetic in min/km lands a few ulps off the band edges
const ZONE_EPSILON: f64 = 1e-9;

/// Classify a pace against a target, both in min/km
///
/// The optimal band is checked first. Outside it a warning needs either the
/// absolute or the relative deviation to be exceeded.
pub fn classify_pace(pace: f64, target: f64, settings: &CoachingSettings) -> PaceZone {
    let deviation = pace - target;
    let magnitude = deviation.abs();
    let relative = magnitude / target;
    let outside = magnitude > settings.absolute_deviation + ZONE_EPSILON
        || relative > settings.relative_deviation + ZONE_EPSILON;

    if magnitude <= settings.optimal_band + ZONE_EPSILON {
        PaceZone::Optimal
    } else if deviation > 0.0 && outside {
        PaceZone::TooSlow
    } else if deviation < 0.0 && outside {
        PaceZone::TooFast
    } else {
        PaceZone::Acceptable
    }
}

/// Advance the coaching phase; never moves backwards
pub fn next_phase(
    current: CoachingPhase,
    metrics: &RunMetrics,
    settings: &CoachingSettings,
) -> CoachingPhase {
    let computed = if metrics.duration_ms > settings.cooldown_after_secs * 1000 {
        CoachingPhase::Cooldown
    } else if metrics.duration_ms < settings.warmup_min_duration_secs * 1000
        || metrics.distance_meters < settings.warmup_min_distance_m
    {
        CoachingPhase::Warmup
    } else {
        CoachingPhase::MainWorkout
    };

    current.max(computed)
}

/// Counts consecutive identical observations
#[derive(Debug, Clone)]
struct StabilityCounter<T> {
    candidate: Option<T>,
    count: u32,
}

impl<T: PartialEq + Copy> StabilityCounter<T> {
    fn new() -> Self {
        Self {
            candidate: None,
            count: 0,
        }
    }

    fn observe(&mut self, value: T) -> u32 {
        if self.candidate == Some(value) {
            self.count = self.count.saturating_add(1);
        } else {
            self.candidate = Some(value);
            self.count = 1;
        }
        self.count
    }

    fn reset(&mut self) {
        self.candidate = None;
        self.count = 0;
    }
}

/// Stateful trigger engine, one per session
#[derive(Debug, Clone)]
pub struct CoachingTriggerEngine {
    settings: CoachingSettings,
    pace_readings: VecDeque<f64>,
    heart_rate_readings: VecDeque<u16>,
    heart_rate_fresh: bool,
    pace_stability: StabilityCounter<PaceZone>,
    heart_rate_stability: StabilityCounter<bool>,
    last_fired: HashMap<TriggerType, i64>,
    announced_distance: HashSet<u64>,
    announced_time: HashSet<u64>,
    last_distance: Option<f64>,
    last_duration_ms: Option<u64>,
    last_phase: Option<CoachingPhase>,
}

impl CoachingTriggerEngine {
    pub fn new(settings: CoachingSettings) -> Self {
        Self {
            pace_readings: VecDeque::with_capacity(settings.pace_window),
            heart_rate_readings: VecDeque::with_capacity(settings.heart_rate_window),
            settings,
            heart_rate_fresh: false,
            pace_stability: StabilityCounter::new(),
            heart_rate_stability: StabilityCounter::new(),
            last_fired: HashMap::new(),
            announced_distance: HashSet::new(),
            announced_time: HashSet::new(),
            last_distance: None,
            last_duration_ms: None,
            last_phase: None,
        }
    }

    pub fn settings(&self) -> &CoachingSettings {
        &self.settings
    }

    /// Change the target pace mid-session; zone stability restarts
    pub fn set_target_pace(&mut self, target: Option<f64>) {
        self.settings.target_pace = target;
        self.pace_stability.reset();
    }

    /// Record an external heart-rate reading
    pub fn record_heart_rate(&mut self, bpm: u16) {
        if self.heart_rate_readings.len() >= self.settings.heart_rate_window.max(1) {
            self.heart_rate_readings.pop_front();
        }
        self.heart_rate_readings.push_back(bpm);
        self.heart_rate_fresh = true;
    }

    pub fn smoothed_pace(&self) -> Option<f64> {
        if self.pace_readings.is_empty() {
            return None;
        }
        Some(self.pace_readings.iter().sum::<f64>() / self.pace_readings.len() as f64)
    }

    pub fn smoothed_heart_rate(&self) -> Option<f64> {
        if self.heart_rate_readings.is_empty() {
            return None;
        }
        let sum: u32 = self.heart_rate_readings.iter().map(|&hr| hr as u32).sum();
        Some(sum as f64 / self.heart_rate_readings.len() as f64)
    }

    /// Clear all session state
    pub fn reset(&mut self) {
        *self = Self::new(self.settings.clone());
    }

    /// Seed the engine from recovered metrics so milestones already behind
    /// the runner are not announced again
    pub fn resume_from(&mut self, metrics: &RunMetrics, phase: CoachingPhase) {
        self.reset();

        for km in &self.settings.distance_milestones_km {
            let meters = milestone_meters(*km);
            if metrics.distance_meters >= meters as f64 {
                self.announced_distance.insert(meters);
            }
        }
        for minutes in &self.settings.time_milestones_min {
            let ms = minutes * 60_000;
            if metrics.duration_ms >= ms {
                self.announced_time.insert(*minutes);
            }
        }

        self.last_distance = Some(metrics.distance_meters);
        self.last_duration_ms = Some(metrics.duration_ms);
        self.last_phase = Some(phase);
    }

    /// Run one evaluation pass over the latest metrics
    ///
    /// Triggers are returned by descending priority; equal priorities keep
    /// detection order.
    pub fn evaluate(&mut self, metrics: &RunMetrics, phase: CoachingPhase) -> Vec<CoachingTrigger> {
        let now = metrics.last_update_time;
        let mut triggers = Vec::new();

        self.evaluate_phase(phase, &mut triggers);
        self.evaluate_pace(metrics, phase, now, &mut triggers);
        self.evaluate_heart_rate(now, &mut triggers);
        self.evaluate_distance_milestones(metrics, now, &mut triggers);
        self.evaluate_time_milestones(metrics, now, &mut triggers);

        self.last_distance = Some(metrics.distance_meters);
        self.last_duration_ms = Some(metrics.duration_ms);

        // sort_by is stable, so ties keep detection order
        triggers.sort_by(|a, b| b.priority.cmp(&a.priority));

        if !triggers.is_empty() {
            debug!(
                count = triggers.len(),
                first = %triggers[0].trigger_type,
                "Coaching triggers emitted"
            );
        }

        triggers
    }

    fn evaluate_phase(&mut self, phase: CoachingPhase, triggers: &mut Vec<CoachingTrigger>) {
        let previous = self.last_phase.replace(phase);
        let Some(previous) = previous else {
            return;
        };
        if phase <= previous {
            return;
        }

        let message = match phase {
            CoachingPhase::MainWorkout => "Warmup complete. Settle into your target pace.",
            CoachingPhase::Cooldown => "Time to cool down. Ease into an easy jog.",
            CoachingPhase::Warmup => return,
        };

        triggers.push(CoachingTrigger {
            trigger_type: TriggerType::PhaseChange,
            urgency: UrgencyLevel::Medium,
            priority: TriggerPriority::Normal,
            message: message.to_string(),
            context: format!("phase {} -> {}", previous, phase),
        });
    }

    fn evaluate_pace(
        &mut self,
        metrics: &RunMetrics,
        phase: CoachingPhase,
        now: i64,
        triggers: &mut Vec<CoachingTrigger>,
    ) {
        // Standing still produces no pace reading
        if !(metrics.current_pace.is_finite() && metrics.current_pace > 0.0) {
            return;
        }

        if self.pace_readings.len() >= self.settings.pace_window.max(1) {
            self.pace_readings.pop_front();
        }
        self.pace_readings.push_back(metrics.current_pace);

        let (Some(target), Some(smoothed)) = (self.settings.target_pace, self.smoothed_pace())
        else {
            return;
        };

        let zone = classify_pace(smoothed, target, &self.settings);
        let stable_for = self.pace_stability.observe(zone);
        if stable_for < self.settings.stability_threshold {
            return;
        }

        let deviation = smoothed - target;
        let relative = deviation.abs() / target;
        let context = format!(
            "smoothed_pace={:.2} target={:.2} deviation={:+.2} zone={:?} stable_for={}",
            smoothed, target, deviation, zone, stable_for
        );

        let trigger = match zone {
            PaceZone::TooFast => {
                let (urgency, priority) = self.warning_level(relative);
                Some(CoachingTrigger {
                    trigger_type: TriggerType::PaceTooFast,
                    urgency,
                    priority,
                    message: format!(
                        "Slow down a little. You're at {} per kilometer, target is {}.",
                        format_pace(smoothed),
                        format_pace(target)
                    ),
                    context,
                })
            }
            PaceZone::TooSlow if phase == CoachingPhase::MainWorkout => {
                let (urgency, priority) = self.warning_level(relative);
                Some(CoachingTrigger {
                    trigger_type: TriggerType::PaceTooSlow,
                    urgency,
                    priority,
                    message: format!(
                        "Pick up the pace. You're at {} per kilometer, target is {}.",
                        format_pace(smoothed),
                        format_pace(target)
                    ),
                    context,
                })
            }
            PaceZone::Optimal if phase != CoachingPhase::Warmup => Some(CoachingTrigger {
                trigger_type: TriggerType::PaceOptimal,
                urgency: UrgencyLevel::Low,
                priority: TriggerPriority::Low,
                message: format!(
                    "Great pace! You're holding {} per kilometer.",
                    format_pace(smoothed)
                ),
                context,
            }),
            _ => None,
        };

        if let Some(trigger) = trigger {
            if self.try_fire(trigger.trigger_type, now) {
                triggers.push(trigger);
            }
        }
    }

    fn warning_level(&self, relative_deviation: f64) -> (UrgencyLevel, TriggerPriority) {
        if relative_deviation > self.settings.urgent_relative_deviation + ZONE_EPSILON {
            (UrgencyLevel::High, TriggerPriority::Urgent)
        } else {
            (UrgencyLevel::Medium, TriggerPriority::High)
        }
    }

    fn evaluate_heart_rate(&mut self, now: i64, triggers: &mut Vec<CoachingTrigger>) {
        if !std::mem::take(&mut self.heart_rate_fresh) {
            return;
        }
        let (Some(ceiling), Some(smoothed)) =
            (self.settings.max_heart_rate, self.smoothed_heart_rate())
        else {
            return;
        };

        let above = smoothed > ceiling as f64;
        let stable_for = self.heart_rate_stability.observe(above);
        if !above || stable_for < self.settings.stability_threshold {
            return;
        }

        if self.try_fire(TriggerType::HeartRateHigh, now) {
            triggers.push(CoachingTrigger {
                trigger_type: TriggerType::HeartRateHigh,
                urgency: UrgencyLevel::High,
                priority: TriggerPriority::Urgent,
                message: format!(
                    "Heart rate is high at {:.0} beats per minute. Ease off.",
                    smoothed
                ),
                context: format!(
                    "smoothed_hr={:.1} ceiling={} stable_for={}",
                    smoothed, ceiling, stable_for
                ),
            });
        }
    }

    fn evaluate_distance_milestones(
        &mut self,
        metrics: &RunMetrics,
        now: i64,
        triggers: &mut Vec<CoachingTrigger>,
    ) {
        let distance = metrics.distance_meters;
        let milestones = self.settings.distance_milestones_km.clone();

        for km in milestones {
            let meters = milestone_meters(km);
            if self.announced_distance.contains(&meters) {
                continue;
            }

            let threshold = meters as f64;
            let crossed = self.last_distance.is_some_and(|prev| prev < threshold)
                && distance >= threshold;
            let in_band =
                distance >= threshold && distance <= threshold + self.settings.distance_tolerance_m;
            if !(crossed || in_band) {
                continue;
            }

            if !self.try_fire(TriggerType::DistanceMilestone, now) {
                continue;
            }
            self.announced_distance.insert(meters);

            let label = if km == 1.0 {
                "1 kilometer".to_string()
            } else {
                format!("{} kilometers", format_km(km))
            };
            triggers.push(CoachingTrigger {
                trigger_type: TriggerType::DistanceMilestone,
                urgency: UrgencyLevel::Low,
                priority: TriggerPriority::Normal,
                message: format!(
                    "{} done. Average pace {} per kilometer.",
                    label,
                    format_pace(metrics.average_pace)
                ),
                context: format!("milestone_m={} distance_m={:.1}", meters, distance),
            });
        }
    }

    fn evaluate_time_milestones(
        &mut self,
        metrics: &RunMetrics,
        now: i64,
        triggers: &mut Vec<CoachingTrigger>,
    ) {
        let duration = metrics.duration_ms;
        let tolerance_ms = self.settings.time_tolerance_secs * 1000;
        let milestones = self.settings.time_milestones_min.clone();

        for minutes in milestones {
            if self.announced_time.contains(&minutes) {
                continue;
            }

            let threshold = minutes * 60_000;
            let crossed = self.last_duration_ms.is_some_and(|prev| prev < threshold)
                && duration >= threshold;
            let in_band = duration >= threshold && duration <= threshold + tolerance_ms;
            if !(crossed || in_band) {
                continue;
            }

            if !self.try_fire(TriggerType::TimeMilestone, now) {
                continue;
            }
            self.announced_time.insert(minutes);

            triggers.push(CoachingTrigger {
                trigger_type: TriggerType::TimeMilestone,
                urgency: UrgencyLevel::Low,
                priority: TriggerPriority::Normal,
                message: format!(
                    "{} minutes in. {:.2} kilometers so far.",
                    minutes,
                    metrics.distance_km()
                ),
                context: format!("milestone_min={} duration_ms={}", minutes, duration),
            });
        }
    }

    fn cooldown_ms(&self, trigger_type: TriggerType) -> i64 {
        let secs = match trigger_type {
            TriggerType::PaceTooFast | TriggerType::PaceTooSlow | TriggerType::HeartRateHigh => {
                self.settings.pace_warning_cooldown_secs
            }
            TriggerType::PaceOptimal => self.settings.motivation_cooldown_secs,
            TriggerType::DistanceMilestone | TriggerType::TimeMilestone => {
                self.settings.milestone_cooldown_secs
            }
            TriggerType::PhaseChange => 0,
        };
        (secs as i64) * 1000
    }

    /// Record a firing unless the type is still cooling down
    fn try_fire(&mut self, trigger_type: TriggerType, now: i64) -> bool {
        let cooldown = self.cooldown_ms(trigger_type);
        if let Some(&last) = self.last_fired.get(&trigger_type) {
            if now - last < cooldown {
                debug!(%trigger_type, remaining_ms = cooldown - (now - last), "Trigger cooling down");
                return false;
            }
        }
        self.last_fired.insert(trigger_type, now);
        true
    }
}

fn milestone_meters(km: f64) -> u64 {
    (km * 1000.0).round() as u64
}

fn format_km(km: f64) -> String {
    if km.fract() == 0.0 {
        format!("{:.0}", km)
    } else {
        format!("{}", km)
    }
}

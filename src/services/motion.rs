//! Motion state machine
//!
//! Classifies the device as MOVING or STATIONARY from displacement over a
//! sliding time window. Owned by the location processor, which is the only
//! writer.
//!
//! Transitions:
//! - UNKNOWN until two samples have been seen
//! - MOVING when path length across the window exceeds the motion threshold
//! - STATIONARY after the dwell period passes with no qualifying displacement
//!
//! Displacement is checked before the dwell timeout, so a sample satisfying
//! both keeps the device MOVING.

use crate::domain::event::{ActivityChangePayload, MotionChangePayload};
use crate::domain::types::{ActivityType, LocationSample, MotionState};
use crate::infra::config::Config;
use std::collections::VecDeque;
use tracing::{debug, info};

/// Motion classifier tuning
#[derive(Debug, Clone, Copy)]
pub struct MotionSettings {
    pub window_ms: u64,
    pub threshold_m: f64,
    pub stationary_timeout_ms: u64,
}

impl MotionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            window_ms: config.motion_window().as_millis() as u64,
            threshold_m: config.motion_threshold_m(),
            stationary_timeout_ms: config.stationary_timeout().as_millis() as u64,
        }
    }
}

/// Changes produced by one evaluation
#[derive(Debug, Default, PartialEq)]
pub struct MotionOutput {
    pub motion_change: Option<MotionChangePayload>,
    pub activity_change: Option<ActivityChangePayload>,
}

pub struct MotionStateMachine {
    settings: MotionSettings,
    state: MotionState,
    activity: ActivityType,
    /// In-order samples inside the window plus one anchor, oldest first
    window: VecDeque<LocationSample>,
    samples_seen: u64,
    /// Timestamp of the last sample with qualifying displacement
    last_qualifying_at: Option<u64>,
    odometer_m: f64,
}

impl MotionStateMachine {
    pub fn new(settings: MotionSettings) -> Self {
        Self {
            settings,
            state: MotionState::Unknown,
            activity: ActivityType::Unknown,
            window: VecDeque::new(),
            samples_seen: 0,
            last_qualifying_at: None,
            odometer_m: 0.0,
        }
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn activity(&self) -> ActivityType {
        self.activity
    }

    /// Distance travelled across in-order samples (meters)
    pub fn odometer(&self) -> f64 {
        self.odometer_m
    }

    /// Newest sample accepted by the classifier
    pub fn newest(&self) -> Option<&LocationSample> {
        self.window.back()
    }

    /// Feed one emitted sample
    pub fn evaluate(&mut self, sample: &LocationSample) -> MotionOutput {
        let mut output = MotionOutput::default();

        if let Some(newest) = self.window.back() {
            if sample.timestamp < newest.timestamp {
                debug!(ts = %sample.timestamp, newest = %newest.timestamp, "motion_sample_out_of_order");
                return output;
            }
            self.odometer_m += newest.distance_to(sample);
        }

        self.window.push_back(*sample);
        self.samples_seen += 1;
        let cutoff = sample.timestamp.saturating_sub(self.settings.window_ms);
        // Keep the last sample at or before the cutoff as the window anchor
        while self.window.get(1).is_some_and(|s| s.timestamp <= cutoff) {
            self.window.pop_front();
        }

        output.activity_change = self.classify_activity(sample);

        if self.samples_seen < 2 {
            return output;
        }

        let displacement = self.window_displacement();
        let next = if displacement > self.settings.threshold_m {
            self.last_qualifying_at = Some(sample.timestamp);
            MotionState::Moving
        } else {
            match self.state {
                MotionState::Unknown => MotionState::Stationary,
                MotionState::Moving if self.dwell_elapsed(sample.timestamp) => MotionState::Stationary,
                current => current,
            }
        };

        output.motion_change = self.transition(next, *sample);
        output
    }

    /// Periodic dwell check for when samples stop arriving
    pub fn tick(&mut self, now_ms: u64) -> Option<MotionChangePayload> {
        if !self.state.is_moving() || !self.dwell_elapsed(now_ms) {
            return None;
        }
        let sample = *self.window.back()?;
        self.transition(MotionState::Stationary, sample)
    }

    fn dwell_elapsed(&self, now_ms: u64) -> bool {
        self.last_qualifying_at
            .is_some_and(|t| now_ms.saturating_sub(t) >= self.settings.stationary_timeout_ms)
    }

    /// Path length across the window
    fn window_displacement(&self) -> f64 {
        self.window
            .iter()
            .zip(self.window.iter().skip(1))
            .map(|(a, b)| a.distance_to(b))
            .sum()
    }

    fn transition(&mut self, next: MotionState, sample: LocationSample) -> Option<MotionChangePayload> {
        if next == self.state {
            return None;
        }
        info!(from = %self.state.as_str(), to = %next.as_str(), ts = %sample.timestamp, "motion_changed");
        self.state = next;
        Some(MotionChangePayload { state: next, sample })
    }

    fn classify_activity(&mut self, sample: &LocationSample) -> Option<ActivityChangePayload> {
        let activity = ActivityType::from_speed(sample.known_speed());
        if activity == self.activity || activity == ActivityType::Unknown {
            return None;
        }
        let previous = std::mem::replace(&mut self.activity, activity);
        debug!(from = %previous.as_str(), to = %activity.as_str(), "activity_changed");
        Some(ActivityChangePayload { activity, previous })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geo::Coordinate;

    const T0: u64 = 1_700_000_000_000;

    fn settings() -> MotionSettings {
        MotionSettings { window_ms: 60_000, threshold_m: 50.0, stationary_timeout_ms: 300_000 }
    }

    fn at(ts_secs: u64, north_m: f64) -> LocationSample {
        let c = Coordinate::new(0.0, 0.0).offset_m(north_m, 0.0);
        LocationSample::new(T0 + ts_secs * 1000, c.latitude, c.longitude)
    }

    #[test]
    fn test_unknown_until_two_samples() {
        let mut m = MotionStateMachine::new(settings());
        assert!(m.evaluate(&at(0, 0.0)).motion_change.is_none());
        assert_eq!(m.state(), MotionState::Unknown);

        let change = m.evaluate(&at(10, 5.0)).motion_change.unwrap();
        assert_eq!(change.state, MotionState::Stationary);
    }

    #[test]
    fn test_moving_then_stationary_after_dwell() {
        let mut m = MotionStateMachine::new(settings());
        m.evaluate(&at(0, 0.0));
        let change = m.evaluate(&at(10, 80.0)).motion_change.unwrap();
        assert_eq!(change.state, MotionState::Moving);

        // Still inside dwell period
        assert!(m.evaluate(&at(200, 81.0)).motion_change.is_none());
        assert_eq!(m.state(), MotionState::Moving);

        let change = m.evaluate(&at(310, 82.0)).motion_change.unwrap();
        assert_eq!(change.state, MotionState::Stationary);
    }

    #[test]
    fn test_tick_applies_dwell_without_samples() {
        let mut m = MotionStateMachine::new(settings());
        m.evaluate(&at(0, 0.0));
        m.evaluate(&at(10, 80.0));

        assert!(m.tick(T0 + 100_000).is_none());
        let change = m.tick(T0 + 310_000).unwrap();
        assert_eq!(change.state, MotionState::Stationary);
        assert_eq!(change.sample, at(10, 80.0));
        assert!(m.tick(T0 + 400_000).is_none());
    }

    #[test]
    fn test_displacement_wins_over_timeout() {
        let mut m = MotionStateMachine::new(settings());
        m.evaluate(&at(0, 0.0));
        m.evaluate(&at(10, 80.0));
        // Dwell elapsed but this sample moves far again
        assert!(m.evaluate(&at(400, 200.0)).motion_change.is_none());
        assert_eq!(m.state(), MotionState::Moving);
    }

    #[test]
    fn test_out_of_order_ignored() {
        let mut m = MotionStateMachine::new(settings());
        m.evaluate(&at(0, 0.0));
        m.evaluate(&at(20, 10.0));
        let out = m.evaluate(&at(10, 500.0));
        assert_eq!(out, MotionOutput::default());
        assert_eq!(m.state(), MotionState::Stationary);
        assert!((m.odometer() - 10.0).abs() < 0.1);
    }

    #[test]
    fn test_activity_change_suppressed_when_unchanged() {
        let mut m = MotionStateMachine::new(settings());
        let first = m.evaluate(&at(0, 0.0).with_speed(1.2)).activity_change.unwrap();
        assert_eq!(first.activity, ActivityType::OnFoot);
        assert_eq!(first.previous, ActivityType::Unknown);
        assert!(m.evaluate(&at(1, 1.0).with_speed(1.5)).activity_change.is_none());
        let next = m.evaluate(&at(2, 30.0).with_speed(15.0)).activity_change.unwrap();
        assert_eq!(next.activity, ActivityType::InVehicle);
    }

    /// Deterministic pseudo-random walk: no two consecutive identical emissions
    #[test]
    fn test_never_emits_same_state_twice() {
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
            seed >> 33
        };

        for _ in 0..50 {
            let mut m = MotionStateMachine::new(settings());
            let mut emitted = Vec::new();
            let mut ts = 0u64;
            let mut north = 0.0;
            for _ in 0..200 {
                // Mostly forward in time, sometimes backwards
                if next() % 10 == 0 {
                    ts = ts.saturating_sub(next() % 30);
                } else {
                    ts += next() % 120;
                }
                north += (next() % 100) as f64 - 40.0;
                if let Some(c) = m.evaluate(&at(ts, north)).motion_change {
                    emitted.push(c.state);
                }
                if next() % 7 == 0 {
                    if let Some(c) = m.tick(T0 + (ts + next() % 600) * 1000) {
                        emitted.push(c.state);
                    }
                }
            }
            for pair in emitted.windows(2) {
                assert_ne!(pair[0], pair[1]);
            }
        }
    }
}

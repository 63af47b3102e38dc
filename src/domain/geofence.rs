//! Circular geofence definitions

use crate::domain::geo::{haversine_m, Coordinate};
use crate::domain::types::LocationSample;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Geofence transition kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GeofenceAction {
    Enter,
    Exit,
    Dwell,
}

impl GeofenceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeofenceAction::Enter => "ENTER",
            GeofenceAction::Exit => "EXIT",
            GeofenceAction::Dwell => "DWELL",
        }
    }
}

/// Rejected geofence registration
#[derive(Debug, Error, PartialEq)]
pub enum GeofenceError {
    #[error("geofence identifier must not be empty")]
    EmptyIdentifier,
    #[error("geofence {id}: radius must be positive, got {radius}")]
    InvalidRadius { id: String, radius: f64 },
    #[error("geofence {id}: center ({latitude}, {longitude}) is not a valid coordinate")]
    InvalidCenter { id: String, latitude: f64, longitude: f64 },
    #[error("geofence {id}: no transitions to monitor")]
    NoTransitions { id: String },
}

/// A registered circular region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub identifier: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Radius in meters
    pub radius: f64,
    #[serde(default = "default_notify_on_entry")]
    pub notify_on_entry: bool,
    #[serde(default = "default_notify_on_exit")]
    pub notify_on_exit: bool,
    #[serde(default)]
    pub notify_on_dwell: bool,
    /// Time inside before DWELL fires (ms)
    #[serde(default)]
    pub loitering_delay_ms: u64,
}

fn default_notify_on_entry() -> bool {
    true
}

fn default_notify_on_exit() -> bool {
    true
}

impl Geofence {
    /// Geofence monitoring ENTER and EXIT
    pub fn new(identifier: impl Into<String>, center: Coordinate, radius: f64) -> Self {
        Self {
            identifier: identifier.into(),
            latitude: center.latitude,
            longitude: center.longitude,
            radius,
            notify_on_entry: true,
            notify_on_exit: true,
            notify_on_dwell: false,
            loitering_delay_ms: 0,
        }
    }

    /// Replace the active transition set
    pub fn with_transitions(mut self, actions: &[GeofenceAction]) -> Self {
        self.notify_on_entry = actions.contains(&GeofenceAction::Enter);
        self.notify_on_exit = actions.contains(&GeofenceAction::Exit);
        self.notify_on_dwell = actions.contains(&GeofenceAction::Dwell);
        self
    }

    pub fn with_loitering_delay_ms(mut self, ms: u64) -> Self {
        self.loitering_delay_ms = ms;
        self
    }

    #[inline]
    pub fn center(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    /// Whether `action` is in the active transition set
    pub fn monitors(&self, action: GeofenceAction) -> bool {
        match action {
            GeofenceAction::Enter => self.notify_on_entry,
            GeofenceAction::Exit => self.notify_on_exit,
            GeofenceAction::Dwell => self.notify_on_dwell,
        }
    }

    /// Point-in-circle test
    pub fn contains(&self, sample: &LocationSample) -> bool {
        haversine_m(self.center(), sample.coordinate()) <= self.radius
    }

    pub fn validate(&self) -> Result<(), GeofenceError> {
        if self.identifier.trim().is_empty() {
            return Err(GeofenceError::EmptyIdentifier);
        }
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(GeofenceError::InvalidRadius {
                id: self.identifier.clone(),
                radius: self.radius,
            });
        }
        if !self.center().is_valid() {
            return Err(GeofenceError::InvalidCenter {
                id: self.identifier.clone(),
                latitude: self.latitude,
                longitude: self.longitude,
            });
        }
        if !(self.notify_on_entry || self.notify_on_exit || self.notify_on_dwell) {
            return Err(GeofenceError::NoTransitions { id: self.identifier.clone() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home() -> Geofence {
        Geofence::new("home", Coordinate::new(0.0, 0.0), 100.0)
    }

    #[test]
    fn test_contains_boundary() {
        let fence = home();
        let inside = Coordinate::new(0.0, 0.0).offset_m(99.0, 0.0);
        let outside = Coordinate::new(0.0, 0.0).offset_m(101.0, 0.0);
        assert!(fence.contains(&LocationSample::new(0, inside.latitude, inside.longitude)));
        assert!(!fence.contains(&LocationSample::new(0, outside.latitude, outside.longitude)));
    }

    #[test]
    fn test_transition_set() {
        let fence = home().with_transitions(&[GeofenceAction::Exit, GeofenceAction::Dwell]);
        assert!(!fence.monitors(GeofenceAction::Enter));
        assert!(fence.monitors(GeofenceAction::Exit));
        assert!(fence.monitors(GeofenceAction::Dwell));
    }

    #[test]
    fn test_validate() {
        assert!(home().validate().is_ok());
        assert_eq!(
            Geofence::new("", Coordinate::new(0.0, 0.0), 10.0).validate(),
            Err(GeofenceError::EmptyIdentifier)
        );
        assert!(matches!(
            Geofence::new("a", Coordinate::new(0.0, 0.0), 0.0).validate(),
            Err(GeofenceError::InvalidRadius { .. })
        ));
        assert!(matches!(
            Geofence::new("a", Coordinate::new(95.0, 0.0), 10.0).validate(),
            Err(GeofenceError::InvalidCenter { .. })
        ));
        assert!(matches!(
            home().with_transitions(&[]).validate(),
            Err(GeofenceError::NoTransitions { .. })
        ));
    }

    #[test]
    fn test_deserialize_defaults() {
        let fence: Geofence = toml::from_str(
            r#"
identifier = "office"
latitude = 64.14
longitude = -21.94
radius = 200.0
"#,
        )
        .unwrap();
        assert!(fence.notify_on_entry && fence.notify_on_exit && !fence.notify_on_dwell);
        assert_eq!(fence.loitering_delay_ms, 0);
    }
}

//! Shared types for the location pipeline

use serde::{Deserialize, Deserializer, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::domain::geo::{haversine_m, Coordinate};

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// A single location fix
///
/// Value type: once built it is only ever copied, never mutated in place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    /// Fix time (epoch ms). Accepts an ISO 8601 string or an integer on input.
    #[serde(rename = "ts", deserialize_with = "deserialize_timestamp")]
    pub timestamp: u64,
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lon")]
    pub longitude: f64,
    /// Horizontal accuracy in meters
    #[serde(rename = "acc", default)]
    pub accuracy: f64,
    /// Ground speed in m/s (negative when unknown)
    #[serde(rename = "spd", default = "unknown_f64")]
    pub speed: f64,
    /// Course over ground in degrees (negative when unknown)
    #[serde(rename = "hdg", default = "unknown_f64")]
    pub heading: f64,
}

fn unknown_f64() -> f64 {
    -1.0
}

impl LocationSample {
    pub fn new(timestamp: u64, latitude: f64, longitude: f64) -> Self {
        Self { timestamp, latitude, longitude, accuracy: 0.0, speed: -1.0, heading: -1.0 }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    #[inline]
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    /// Great-circle distance to another sample in meters
    #[inline]
    pub fn distance_to(&self, other: &LocationSample) -> f64 {
        haversine_m(self.coordinate(), other.coordinate())
    }

    /// Speed if the provider reported one
    pub fn known_speed(&self) -> Option<f64> {
        (self.speed >= 0.0 && self.speed.is_finite()).then_some(self.speed)
    }
}

/// Device motion classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionState {
    Unknown,
    Stationary,
    Moving,
}

impl MotionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MotionState::Unknown => "unknown",
            MotionState::Stationary => "stationary",
            MotionState::Moving => "moving",
        }
    }

    #[inline]
    pub fn is_moving(&self) -> bool {
        matches!(self, MotionState::Moving)
    }
}

/// Coarse activity derived from ground speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Unknown,
    Still,
    OnFoot,
    InVehicle,
}

/// Below this speed the device is considered still (m/s)
const STILL_MAX_SPEED: f64 = 0.5;
/// Walking/running upper bound (m/s)
const ON_FOOT_MAX_SPEED: f64 = 3.0;

impl ActivityType {
    pub fn from_speed(speed: Option<f64>) -> Self {
        match speed {
            None => ActivityType::Unknown,
            Some(s) if s < STILL_MAX_SPEED => ActivityType::Still,
            Some(s) if s < ON_FOOT_MAX_SPEED => ActivityType::OnFoot,
            Some(_) => ActivityType::InVehicle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Unknown => "unknown",
            ActivityType::Still => "still",
            ActivityType::OnFoot => "on_foot",
            ActivityType::InVehicle => "in_vehicle",
        }
    }
}

/// Status report from the location provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatus {
    /// Location services switched on at the OS level
    pub enabled: bool,
    /// Authorization granted to this app
    #[serde(default = "default_true")]
    pub authorized: bool,
    #[serde(default = "default_true")]
    pub gps: bool,
    #[serde(default)]
    pub network: bool,
}

fn default_true() -> bool {
    true
}

/// Update pushed by the location provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderUpdate {
    Fix(LocationSample),
    Status(ProviderStatus),
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an RFC 3339 string or epoch milliseconds")
        }

        fn visit_str<E>(self, value: &str) -> Result<u64, E>
        where
            E: de::Error,
        {
            let parsed = chrono::DateTime::parse_from_rfc3339(value).map_err(E::custom)?;
            u64::try_from(parsed.timestamp_millis()).map_err(E::custom)
        }

        fn visit_u64<E>(self, value: u64) -> Result<u64, E>
        where
            E: de::Error,
        {
            Ok(value)
        }

        fn visit_i64<E>(self, value: i64) -> Result<u64, E>
        where
            E: de::Error,
        {
            // Negative epochs clamp to zero
            Ok(u64::try_from(value).unwrap_or(0))
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_deserialize_epoch_ms() {
        let s: LocationSample =
            serde_json::from_str(r#"{"ts":1700000000000,"lat":64.1,"lon":-21.9,"acc":5.0}"#)
                .unwrap();
        assert_eq!(s.timestamp, 1_700_000_000_000);
        assert_eq!(s.accuracy, 5.0);
        assert_eq!(s.known_speed(), None);
    }

    #[test]
    fn test_sample_deserialize_iso_timestamp() {
        let s: LocationSample =
            serde_json::from_str(r#"{"ts":"2024-01-01T00:00:01Z","lat":0.0,"lon":0.0,"spd":1.5}"#)
                .unwrap();
        assert_eq!(s.timestamp, 1_704_067_201_000);
        assert_eq!(s.known_speed(), Some(1.5));
    }

    #[test]
    fn test_provider_update_tagged() {
        let u: ProviderUpdate =
            serde_json::from_str(r#"{"type":"status","enabled":false}"#).unwrap();
        assert_eq!(
            u,
            ProviderUpdate::Status(ProviderStatus {
                enabled: false,
                authorized: true,
                gps: true,
                network: false
            })
        );
    }

    #[test]
    fn test_activity_from_speed() {
        assert_eq!(ActivityType::from_speed(None), ActivityType::Unknown);
        assert_eq!(ActivityType::from_speed(Some(0.1)), ActivityType::Still);
        assert_eq!(ActivityType::from_speed(Some(1.4)), ActivityType::OnFoot);
        assert_eq!(ActivityType::from_speed(Some(13.0)), ActivityType::InVehicle);
    }
}

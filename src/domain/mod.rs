//! Domain models - core data types for the location pipeline
//!
//! This module contains the canonical data types used throughout the system:
//! - `LocationSample` - an immutable location fix
//! - `MotionState` / `ActivityType` - device motion classification
//! - `Geofence` - a registered circular region
//! - `Event` / `EventPayload` - typed events carried by the bus and outbox
//! - `OutboxEntry` - a persisted event awaiting upload
//! - `geo` - haversine distance and coordinate helpers

pub mod event;
pub mod geo;
pub mod geofence;
pub mod outbox;
pub mod types;

// Re-export commonly used types at module level
pub use event::{Event, EventKind, EventPayload};
pub use geo::{haversine_m, Coordinate};
pub use geofence::{Geofence, GeofenceAction, GeofenceError};
pub use outbox::{DeliveryStatus, OutboxEntry};
pub use types::{epoch_ms, LocationSample, MotionState, ProviderUpdate};

//! geotrack library
//!
//! Motion and location event pipeline: sampler, motion state machine,
//! geofence evaluator, event bus and persistent outbox. Exposes modules for
//! integration testing and binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;

//! Services - pipeline components and orchestration
//!
//! This module contains the core pipeline services:
//! - `sampler` - Distance filter and provider health
//! - `motion` - MOVING / STATIONARY state machine
//! - `geofence` - ENTER / EXIT / DWELL evaluation
//! - `processor` - Location processor task (owns motion and geofence state)
//! - `event_bus` - Typed publish/subscribe with a dispatch loop
//! - `outbox` - Persistent upload queue with retry and eviction
//! - `pipeline` - Wires the components and owns their lifecycle

pub mod event_bus;
pub mod geofence;
pub mod motion;
pub mod outbox;
pub mod pipeline;
pub mod processor;
pub mod sampler;

// Re-export commonly used types
pub use event_bus::{BusError, EventBus, Handler, SubscriptionId};
pub use outbox::{Outbox, SyncReport, UploadRecord, UploadResponse, Uploader};
pub use pipeline::{Pipeline, PipelineError, State};
pub use sampler::{Sampler, SamplerError};

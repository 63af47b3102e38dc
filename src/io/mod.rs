//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `outbox_store` - Outbox journal (JSONL) and its writer thread
//! - `state_store` - Persisted enabled flag and next event seq
//! - `http_uploader` - HTTP sync target for the outbox
//! - `replay` - Location provider fed from JSONL
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod http_uploader;
pub mod outbox_store;
pub mod prometheus;
pub mod replay;
pub mod state_store;

// Re-export commonly used types
pub use http_uploader::HttpUploader;
pub use outbox_store::{OutboxStore, StoreHandle};
pub use state_store::{PersistedState, StateStore};

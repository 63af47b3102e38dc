//! Geofence evaluator - ENTER / EXIT / DWELL transitions per registered region
//!
//! Containment starts as "outside" for every new geofence, so a first sample
//! outside emits nothing. Samples older than the newest sample a geofence has
//! already evaluated never change its containment, so emitted transitions stay
//! monotonic in time.

use crate::domain::event::GeofencePayload;
use crate::domain::geofence::{Geofence, GeofenceAction, GeofenceError};
use crate::domain::types::LocationSample;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, info};

#[derive(Debug, Default, Clone)]
struct FenceState {
    inside: bool,
    /// Newest sample time evaluated against this geofence
    last_evaluated_at: Option<u64>,
    entered_at: Option<u64>,
    dwell_emitted: bool,
}

#[derive(Debug, Default)]
pub struct GeofenceEvaluator {
    /// Registration order is evaluation order
    fences: Vec<Geofence>,
    states: FxHashMap<String, FenceState>,
}

impl GeofenceEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a geofence; replacing resets its containment state
    pub fn register(&mut self, fence: Geofence) -> Result<(), GeofenceError> {
        fence.validate()?;
        self.states.insert(fence.identifier.clone(), FenceState::default());
        match self.fences.iter_mut().find(|f| f.identifier == fence.identifier) {
            Some(existing) => {
                info!(id = %fence.identifier, radius = %fence.radius, "geofence_replaced");
                *existing = fence;
            }
            None => {
                info!(id = %fence.identifier, radius = %fence.radius, "geofence_registered");
                self.fences.push(fence);
            }
        }
        Ok(())
    }

    /// Returns false if no geofence had this id
    pub fn remove(&mut self, identifier: &str) -> bool {
        let before = self.fences.len();
        self.fences.retain(|f| f.identifier != identifier);
        self.states.remove(identifier);
        let removed = self.fences.len() != before;
        if removed {
            info!(id = %identifier, "geofence_removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }

    pub fn geofences(&self) -> &[Geofence] {
        &self.fences
    }

    pub fn is_inside(&self, identifier: &str) -> bool {
        self.states.get(identifier).is_some_and(|s| s.inside)
    }

    /// Evaluate one sample against every registered geofence
    pub fn evaluate(&mut self, sample: &LocationSample) -> SmallVec<[GeofencePayload; 4]> {
        let mut transitions: SmallVec<[GeofencePayload; 4]> = SmallVec::new();

        for fence in &self.fences {
            let state = self.states.entry(fence.identifier.clone()).or_default();

            if let Some(last) = state.last_evaluated_at.filter(|last| sample.timestamp < *last) {
                debug!(
                    id = %fence.identifier,
                    ts = %sample.timestamp,
                    last_evaluated = %last,
                    inside = %fence.contains(sample),
                    "geofence_sample_stale"
                );
                continue;
            }
            state.last_evaluated_at = Some(sample.timestamp);

            let inside = fence.contains(sample);
            if inside != state.inside {
                state.inside = inside;
                let action = if inside {
                    state.entered_at = Some(sample.timestamp);
                    state.dwell_emitted = false;
                    GeofenceAction::Enter
                } else {
                    state.entered_at = None;
                    GeofenceAction::Exit
                };
                if fence.monitors(action) {
                    transitions.push(payload(fence, action, sample));
                }
            }

            let dwell_due = state.entered_at.is_some_and(|t| {
                sample.timestamp.saturating_sub(t) >= fence.loitering_delay_ms
            });
            if inside && fence.notify_on_dwell && !state.dwell_emitted && dwell_due {
                state.dwell_emitted = true;
                transitions.push(payload(fence, GeofenceAction::Dwell, sample));
            }
        }

        for t in &transitions {
            info!(id = %t.identifier, action = %t.action.as_str(), ts = %t.sample.timestamp, "geofence_transition");
        }
        transitions
    }
}

#[inline]
fn payload(fence: &Geofence, action: GeofenceAction, sample: &LocationSample) -> GeofencePayload {
    GeofencePayload { identifier: fence.identifier.clone(), action, sample: *sample }
}

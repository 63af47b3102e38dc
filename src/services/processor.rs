//! Location processor - sole owner of motion and geofence state
//!
//! Consumes emitted samples from the sampler, runs them through the motion
//! state machine and the geofence evaluator, and publishes the resulting
//! events. Geofence registration arrives over a command channel so state is
//! only ever touched from this task.

use crate::domain::event::{EventPayload, HeartbeatPayload};
use crate::domain::geofence::{Geofence, GeofenceError};
use crate::domain::types::{ActivityType, LocationSample, MotionState};
use crate::infra::metrics::Metrics;
use crate::services::event_bus::EventBus;
use crate::services::geofence::GeofenceEvaluator;
use crate::services::motion::{MotionSettings, MotionStateMachine};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Sampler to processor messages
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerOutput {
    Sample(LocationSample),
    /// Periodic wake (`minimum_fetch_interval`)
    Wake,
}

pub enum ProcessorCommand {
    RegisterGeofence {
        fence: Geofence,
        reply: oneshot::Sender<Result<(), GeofenceError>>,
    },
    RemoveGeofence {
        identifier: String,
        reply: oneshot::Sender<bool>,
    },
}

/// Read-only view of processor state
#[derive(Debug, Clone, Serialize)]
pub struct TrackingSnapshot {
    pub motion: MotionState,
    pub activity: ActivityType,
    pub odometer_m: f64,
    pub last_location: Option<LocationSample>,
    pub geofences: Vec<String>,
    pub inside: Vec<String>,
}

impl Default for TrackingSnapshot {
    fn default() -> Self {
        Self {
            motion: MotionState::Unknown,
            activity: ActivityType::Unknown,
            odometer_m: 0.0,
            last_location: None,
            geofences: Vec::new(),
            inside: Vec::new(),
        }
    }
}

pub type SharedSnapshot = Arc<RwLock<TrackingSnapshot>>;

pub struct LocationProcessor {
    motion: MotionStateMachine,
    geofences: GeofenceEvaluator,
    bus: EventBus,
    metrics: Arc<Metrics>,
    snapshot: SharedSnapshot,
    last_location: Option<LocationSample>,
    /// Sample time of the newest sample and when it was processed
    clock_anchor: Option<(u64, Instant)>,
}

impl LocationProcessor {
    pub fn new(
        motion: MotionSettings,
        bus: EventBus,
        metrics: Arc<Metrics>,
        snapshot: SharedSnapshot,
    ) -> Self {
        Self {
            motion: MotionStateMachine::new(motion),
            geofences: GeofenceEvaluator::new(),
            bus,
            metrics,
            snapshot,
            last_location: None,
            clock_anchor: None,
        }
    }

    pub fn register_geofence(&mut self, fence: Geofence) -> Result<(), GeofenceError> {
        self.geofences.register(fence)?;
        self.refresh_snapshot();
        Ok(())
    }

    pub fn remove_geofence(&mut self, identifier: &str) -> bool {
        let removed = self.geofences.remove(identifier);
        self.refresh_snapshot();
        removed
    }

    /// Process one emitted sample
    pub fn process_sample(&mut self, sample: LocationSample) {
        self.publish(EventPayload::Location(sample));

        let output = self.motion.evaluate(&sample);
        if let Some(change) = output.activity_change {
            self.publish(EventPayload::ActivityChange(change));
        }
        if let Some(change) = output.motion_change {
            self.metrics.record_motion_change();
            self.publish(EventPayload::MotionChange(change));
        }

        for transition in self.geofences.evaluate(&sample) {
            self.metrics.record_geofence_transition();
            self.publish(EventPayload::Geofence(transition));
        }

        if self.last_location.map_or(true, |l| sample.timestamp >= l.timestamp) {
            self.last_location = Some(sample);
            self.clock_anchor = Some((sample.timestamp, Instant::now()));
        }
        self.refresh_snapshot();
    }

    /// Sample-time clock: newest sample time plus wall time since it arrived
    fn pipeline_now(&self) -> Option<u64> {
        self.clock_anchor
            .map(|(ts, at)| ts + at.elapsed().as_millis() as u64)
    }

    /// Dwell check between samples
    pub fn tick(&mut self) {
        let Some(now) = self.pipeline_now() else {
            return;
        };
        if let Some(change) = self.motion.tick(now) {
            self.metrics.record_motion_change();
            self.publish(EventPayload::MotionChange(change));
            self.refresh_snapshot();
        }
    }

    pub fn heartbeat(&mut self) {
        let payload = HeartbeatPayload { last_location: self.last_location, motion: self.motion.state() };
        debug!(motion = %payload.motion.as_str(), "heartbeat");
        self.publish(EventPayload::Heartbeat(payload));
    }

    fn handle_command(&mut self, command: ProcessorCommand) {
        match command {
            ProcessorCommand::RegisterGeofence { fence, reply } => {
                let result = self.register_geofence(fence);
                let _ = reply.send(result);
            }
            ProcessorCommand::RemoveGeofence { identifier, reply } => {
                let removed = self.remove_geofence(&identifier);
                let _ = reply.send(removed);
            }
        }
    }

    fn handle_output(&mut self, output: SamplerOutput) {
        match output {
            SamplerOutput::Sample(sample) => self.process_sample(sample),
            SamplerOutput::Wake => self.heartbeat(),
        }
    }

    #[inline]
    fn publish(&self, payload: EventPayload) {
        if let Err(e) = self.bus.publish(payload) {
            warn!(error = %e, "processor_publish_failed");
        }
    }

    fn refresh_snapshot(&self) {
        let mut snapshot = self.snapshot.write();
        snapshot.motion = self.motion.state();
        snapshot.activity = self.motion.activity();
        snapshot.odometer_m = self.motion.odometer();
        snapshot.last_location = self.last_location;
        snapshot.geofences = self.geofences.geofences().iter().map(|f| f.identifier.clone()).collect();
        snapshot.inside = self
            .geofences
            .geofences()
            .iter()
            .filter(|f| self.geofences.is_inside(&f.identifier))
            .map(|f| f.identifier.clone())
            .collect();
    }

    /// Run until shutdown; samples queued at shutdown are still processed
    pub async fn run(
        mut self,
        mut samples: mpsc::Receiver<SamplerOutput>,
        mut commands: mpsc::Receiver<ProcessorCommand>,
        mut shutdown: watch::Receiver<bool>,
        tick_interval: Duration,
    ) {
        let mut tick = tokio::time::interval(tick_interval);
        info!(geofences = %self.geofences.len(), "processor_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                Some(command) = commands.recv() => {
                    self.handle_command(command);
                }
                Some(output) = samples.recv() => {
                    self.handle_output(output);
                }
                _ = tick.tick() => {
                    self.tick();
                }
            }
        }

        let mut drained = 0usize;
        while let Ok(output) = samples.try_recv() {
            self.handle_output(output);
            drained += 1;
        }
        while let Ok(command) = commands.try_recv() {
            self.handle_command(command);
        }

        info!(
            drained = %drained,
            motion = %self.motion.state().as_str(),
            odometer_m = %format!("{:.1}", self.motion.odometer()),
            "processor_stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::{Event, EventKind};
    use crate::domain::geo::Coordinate;
    use crate::domain::geofence::GeofenceAction;
    use parking_lot::Mutex;

    fn settings() -> MotionSettings {
        MotionSettings { window_ms: 60_000, threshold_m: 50.0, stationary_timeout_ms: 300_000 }
    }

    fn at(ts: u64, north_m: f64) -> LocationSample {
        let c = Coordinate::new(0.0, 0.0).offset_m(north_m, 0.0);
        LocationSample::new(ts, c.latitude, c.longitude)
    }

    fn capture(bus: &EventBus) -> Arc<Mutex<Vec<Event>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let e = events.clone();
            bus.subscribe(kind, move |event| {
                e.lock().push(event.clone());
                Ok(())
            });
        }
        events
    }

    #[tokio::test]
    async fn test_sample_publishes_location_motion_and_geofence() {
        let metrics = Arc::new(Metrics::new());
        let (bus, dispatcher) = EventBus::new(metrics.clone());
        let handle = dispatcher.spawn();
        let events = capture(&bus);

        let snapshot = SharedSnapshot::default();
        let mut processor = LocationProcessor::new(settings(), bus.clone(), metrics, snapshot.clone());
        processor
            .register_geofence(Geofence::new("home", Coordinate::new(0.0, 0.0), 100.0))
            .unwrap();

        processor.process_sample(at(0, 150.0));
        processor.process_sample(at(10_000, 50.0));
        processor.heartbeat();

        bus.shutdown();
        handle.await.unwrap();

        let kinds: Vec<_> = events.lock().iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Location,
                EventKind::Location,
                EventKind::MotionChange,
                EventKind::Geofence,
                EventKind::Heartbeat,
            ]
        );
        let events = events.lock();
        match &events[3].payload {
            EventPayload::Geofence(g) => assert_eq!(g.action, GeofenceAction::Enter),
            other => panic!("unexpected payload {other:?}"),
        }

        let snap = snapshot.read();
        assert_eq!(snap.motion, MotionState::Moving);
        assert_eq!(snap.inside, vec!["home".to_string()]);
        assert_eq!(snap.last_location, Some(at(10_000, 50.0)));
    }

    #[tokio::test]
    async fn test_commands_served_by_run_loop() {
        let metrics = Arc::new(Metrics::new());
        let (bus, _dispatcher) = EventBus::new(metrics.clone());
        let snapshot = SharedSnapshot::default();
        let processor = LocationProcessor::new(settings(), bus, metrics, snapshot.clone());

        let (sample_tx, sample_rx) = mpsc::channel(8);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(processor.run(sample_rx, cmd_rx, shutdown_rx, Duration::from_millis(100)));

        let (reply, rx) = oneshot::channel();
        let fence = Geofence::new("work", Coordinate::new(0.0, 0.0), 0.0);
        cmd_tx.send(ProcessorCommand::RegisterGeofence { fence, reply }).await.unwrap();
        assert!(rx.await.unwrap().is_err());

        let (reply, rx) = oneshot::channel();
        let fence = Geofence::new("work", Coordinate::new(0.0, 0.0), 50.0);
        cmd_tx.send(ProcessorCommand::RegisterGeofence { fence, reply }).await.unwrap();
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(snapshot.read().geofences, vec!["work".to_string()]);

        sample_tx.send(SamplerOutput::Sample(at(0, 10.0))).await.unwrap();
        let (reply, rx) = oneshot::channel();
        cmd_tx
            .send(ProcessorCommand::RemoveGeofence { identifier: "work".into(), reply })
            .await
            .unwrap();
        assert!(rx.await.unwrap());

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        let snap = snapshot.read();
        assert!(snap.geofences.is_empty());
        assert_eq!(snap.last_location, Some(at(0, 10.0)));
    }
}

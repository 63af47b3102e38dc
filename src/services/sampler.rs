//! Location sampler - distance filtering and provider health
//!
//! Receives raw fixes from the location provider and emits only those that
//! moved more than `distance_filter` meters from the last emitted sample, or
//! arrived after `max_interval` without an emission. Tracks provider silence
//! and reports `ProviderUnavailable` upward; it never restarts the provider.

use crate::domain::event::{EventPayload, ProviderChangePayload, ProviderChangeReason};
use crate::domain::types::{epoch_ms, LocationSample, ProviderUpdate};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::event_bus::EventBus;
use crate::services::processor::SamplerOutput;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, interval_at, Instant};
use tracing::{debug, info, warn};

/// How often provider silence is checked
const PROVIDER_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq)]
pub enum SamplerError {
    #[error("location provider unavailable: no fix for {silent_ms} ms")]
    ProviderUnavailable { silent_ms: u64 },
}

/// Sampler tuning
#[derive(Debug, Clone)]
pub struct SamplerSettings {
    pub distance_filter: f64,
    pub max_interval_ms: u64,
    pub provider_timeout_ms: u64,
    pub wake_interval: Duration,
}

impl SamplerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            distance_filter: config.distance_filter(),
            max_interval_ms: config.max_interval().as_millis() as u64,
            provider_timeout_ms: config.provider_timeout().as_millis() as u64,
            wake_interval: config.minimum_fetch_interval(),
        }
    }
}

/// Push-mode listener for emitted samples
pub type UpdateCallback = Box<dyn FnMut(&LocationSample) + Send>;

pub struct Sampler {
    settings: SamplerSettings,
    rx: mpsc::Receiver<ProviderUpdate>,
    last_emitted: Option<LocationSample>,
    /// Wall time of the last emission (epoch ms)
    last_emitted_at: u64,
    /// Newest fix that did not pass the filter
    latest_filtered: Option<LocationSample>,
    /// Wall time of the last fix, or of construction (epoch ms)
    last_fix_at: u64,
    available: bool,
    callbacks: Vec<UpdateCallback>,
    provider_changes: Vec<ProviderChangePayload>,
    metrics: Arc<Metrics>,
}

impl Sampler {
    pub fn new(
        settings: SamplerSettings,
        rx: mpsc::Receiver<ProviderUpdate>,
        metrics: Arc<Metrics>,
        now_ms: u64,
    ) -> Self {
        Self {
            settings,
            rx,
            last_emitted: None,
            last_emitted_at: now_ms,
            latest_filtered: None,
            last_fix_at: now_ms,
            available: true,
            callbacks: Vec::new(),
            provider_changes: Vec::new(),
            metrics,
        }
    }

    /// Register a callback run for every emitted sample, in registration order
    pub fn on_update<F>(&mut self, callback: F)
    where
        F: FnMut(&LocationSample) + Send + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    /// Non-blocking: drain pending provider updates until one sample passes the filter
    pub fn poll(&mut self, now_ms: u64) -> Option<LocationSample> {
        while let Ok(update) = self.rx.try_recv() {
            if let Some(sample) = self.handle_update(update, now_ms) {
                return Some(sample);
            }
        }
        None
    }

    /// Apply one provider update; returns the sample if it was emitted
    pub fn handle_update(&mut self, update: ProviderUpdate, now_ms: u64) -> Option<LocationSample> {
        match update {
            ProviderUpdate::Fix(sample) => self.offer(sample, now_ms),
            ProviderUpdate::Status(status) => {
                let available = status.enabled && status.authorized;
                info!(
                    enabled = %status.enabled,
                    authorized = %status.authorized,
                    gps = %status.gps,
                    network = %status.network,
                    "provider_status_changed"
                );
                self.available = available;
                self.provider_changes.push(ProviderChangePayload {
                    reason: ProviderChangeReason::Status,
                    available,
                    status: Some(status),
                    silent_ms: None,
                });
                None
            }
        }
    }

    /// Run a raw fix through the distance filter
    pub fn offer(&mut self, sample: LocationSample, now_ms: u64) -> Option<LocationSample> {
        self.metrics.record_sample_received();
        self.last_fix_at = now_ms;

        if !self.available {
            info!(ts = %sample.timestamp, "provider_recovered");
            self.available = true;
            self.provider_changes.push(ProviderChangePayload {
                reason: ProviderChangeReason::Recovered,
                available: true,
                status: None,
                silent_ms: None,
            });
        }

        if !self.passes_filter(&sample) {
            self.metrics.record_sample_filtered();
            let newer = self.latest_filtered.map_or(true, |f| sample.timestamp >= f.timestamp);
            if newer {
                self.latest_filtered = Some(sample);
            }
            debug!(ts = %sample.timestamp, "sample_filtered");
            return None;
        }

        self.emit(sample, now_ms);
        Some(sample)
    }

    fn passes_filter(&self, sample: &LocationSample) -> bool {
        let Some(last) = self.last_emitted else {
            return true;
        };
        if self.settings.distance_filter <= 0.0 {
            return true;
        }
        if sample.distance_to(&last) > self.settings.distance_filter {
            return true;
        }
        sample.timestamp.saturating_sub(last.timestamp) >= self.settings.max_interval_ms
    }

    fn emit(&mut self, sample: LocationSample, now_ms: u64) {
        self.last_emitted = Some(sample);
        self.last_emitted_at = now_ms;
        self.latest_filtered = None;
        self.metrics.record_sample_emitted();
        for callback in self.callbacks.iter_mut() {
            callback(&sample);
        }
    }

    /// Periodic wake: emit the newest held-back fix once `max_interval` has passed
    pub fn wake(&mut self, now_ms: u64) -> Option<LocationSample> {
        let elapsed = now_ms.saturating_sub(self.last_emitted_at);
        if elapsed < self.settings.max_interval_ms {
            return None;
        }
        let sample = self.latest_filtered.take()?;
        debug!(ts = %sample.timestamp, elapsed_ms = %elapsed, "sample_emitted_on_wake");
        self.emit(sample, now_ms);
        Some(sample)
    }

    /// Check provider silence; the first failing check queues an unavailability report
    pub fn check_provider(&mut self, now_ms: u64) -> Result<(), SamplerError> {
        let silent_ms = now_ms.saturating_sub(self.last_fix_at);
        if silent_ms <= self.settings.provider_timeout_ms {
            return Ok(());
        }
        if self.available {
            warn!(silent_ms = %silent_ms, "provider_unavailable");
            self.available = false;
            self.metrics.record_provider_unavailable();
            self.provider_changes.push(ProviderChangePayload {
                reason: ProviderChangeReason::Unavailable,
                available: false,
                status: None,
                silent_ms: Some(silent_ms),
            });
        }
        Err(SamplerError::ProviderUnavailable { silent_ms })
    }

    /// Provider changes observed since the last call
    pub fn drain_provider_changes(&mut self) -> Vec<ProviderChangePayload> {
        std::mem::take(&mut self.provider_changes)
    }

    pub fn last_emitted(&self) -> Option<&LocationSample> {
        self.last_emitted.as_ref()
    }

    pub fn is_provider_available(&self) -> bool {
        self.available
    }

    fn publish_provider_changes(&mut self, bus: &EventBus) {
        for change in self.drain_provider_changes() {
            let _ = bus.publish(EventPayload::ProviderChange(change));
        }
    }

    /// Run the sampler until shutdown or until the provider closes its channel
    ///
    /// Emitted samples go to the location processor; provider changes go
    /// straight to the bus.
    pub async fn run(
        mut self,
        bus: EventBus,
        out_tx: mpsc::Sender<SamplerOutput>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut check_interval = interval(PROVIDER_CHECK_INTERVAL);
        let wake_period = self.settings.wake_interval;
        let mut wake_interval = interval_at(Instant::now() + wake_period, wake_period);

        info!(
            distance_filter = %self.settings.distance_filter,
            max_interval_ms = %self.settings.max_interval_ms,
            provider_timeout_ms = %self.settings.provider_timeout_ms,
            "sampler_started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                update = self.rx.recv() => {
                    let Some(update) = update else {
                        info!("provider_channel_closed");
                        break;
                    };
                    let emitted = self.handle_update(update, epoch_ms());
                    self.publish_provider_changes(&bus);
                    if let Some(sample) = emitted {
                        if out_tx.send(SamplerOutput::Sample(sample)).await.is_err() {
                            break;
                        }
                    }
                }
                _ = check_interval.tick() => {
                    if let Err(e) = self.check_provider(epoch_ms()) {
                        debug!(error = %e, "provider_check_failed");
                    }
                    self.publish_provider_changes(&bus);
                }
                _ = wake_interval.tick() => {
                    if let Some(sample) = self.wake(epoch_ms()) {
                        if out_tx.send(SamplerOutput::Sample(sample)).await.is_err() {
                            break;
                        }
                    }
                    if out_tx.send(SamplerOutput::Wake).await.is_err() {
                        break;
                    }
                }
            }
        }

        info!("sampler_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geo::Coordinate;
    use crate::domain::event::EventKind;
    use crate::domain::types::ProviderStatus;
    use crate::services::event_bus::EventBus;
    use parking_lot::Mutex;

    const T0: u64 = 1_700_000_000_000;

    fn settings(distance_filter: f64) -> SamplerSettings {
        SamplerSettings {
            distance_filter,
            max_interval_ms: 60_000,
            provider_timeout_ms: 30_000,
            wake_interval: Duration::from_secs(900),
        }
    }

    fn sampler(distance_filter: f64) -> (Sampler, mpsc::Sender<ProviderUpdate>) {
        let (tx, rx) = mpsc::channel(16);
        (Sampler::new(settings(distance_filter), rx, Arc::new(Metrics::new()), T0), tx)
    }

    /// Points along a meridian, `spacing_m` apart, one second apart
    fn walk(n: usize, spacing_m: f64) -> Vec<LocationSample> {
        let origin = Coordinate::new(10.0, 20.0);
        (0..n)
            .map(|i| {
                let c = origin.offset_m(spacing_m * i as f64, 0.0);
                LocationSample::new(T0 + i as u64 * 1000, c.latitude, c.longitude)
            })
            .collect()
    }

    #[test]
    fn test_close_points_filtered() {
        let (mut sampler, _tx) = sampler(10.0);
        let emitted: Vec<_> =
            walk(3, 2.0).into_iter().filter_map(|s| sampler.offer(s, T0)).collect();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].timestamp, T0);
    }

    #[test]
    fn test_far_points_all_emitted() {
        let (mut sampler, _tx) = sampler(10.0);
        let emitted: Vec<_> =
            walk(3, 15.0).into_iter().filter_map(|s| sampler.offer(s, T0)).collect();
        assert_eq!(emitted.len(), 3);
    }

    #[test]
    fn test_zero_filter_emits_everything() {
        let (mut sampler, _tx) = sampler(0.0);
        let samples = walk(1, 0.0);
        assert!(sampler.offer(samples[0], T0).is_some());
        assert!(sampler.offer(samples[0], T0).is_some());
    }

    #[test]
    fn test_max_interval_forces_emission() {
        let (mut sampler, _tx) = sampler(10.0);
        let first = LocationSample::new(T0, 10.0, 20.0);
        let later = LocationSample::new(T0 + 60_000, 10.0, 20.0);
        assert!(sampler.offer(first, T0).is_some());
        assert!(sampler.offer(later, T0).is_some());
    }

    #[test]
    fn test_wake_emits_held_back_fix() {
        let (mut sampler, _tx) = sampler(10.0);
        let samples = walk(2, 2.0);
        assert!(sampler.offer(samples[0], T0).is_some());
        assert!(sampler.offer(samples[1], T0 + 1000).is_none());

        // Not yet due
        assert!(sampler.wake(T0 + 30_000).is_none());
        let woke = sampler.wake(T0 + 61_000).unwrap();
        assert_eq!(woke, samples[1]);
        // Nothing left to emit
        assert!(sampler.wake(T0 + 200_000).is_none());
    }

    #[test]
    fn test_poll_drains_channel() {
        let (mut sampler, tx) = sampler(10.0);
        for s in walk(3, 2.0) {
            tx.try_send(ProviderUpdate::Fix(s)).unwrap();
        }
        assert!(sampler.poll(T0).is_some());
        assert!(sampler.poll(T0).is_none());
        assert!(sampler.poll(T0).is_none());
    }

    #[test]
    fn test_on_update_callbacks_in_order() {
        let (mut sampler, _tx) = sampler(10.0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = seen.clone();
        sampler.on_update(move |s| a.lock().push(("a", s.timestamp)));
        let b = seen.clone();
        sampler.on_update(move |s| b.lock().push(("b", s.timestamp)));

        for s in walk(2, 15.0) {
            sampler.offer(s, T0);
        }
        assert_eq!(*seen.lock(), vec![("a", T0), ("b", T0), ("a", T0 + 1000), ("b", T0 + 1000)]);
    }

    #[test]
    fn test_provider_unavailable_reported_once() {
        let (mut sampler, _tx) = sampler(10.0);
        assert!(sampler.check_provider(T0 + 10_000).is_ok());

        let err = sampler.check_provider(T0 + 31_000).unwrap_err();
        assert_eq!(err, SamplerError::ProviderUnavailable { silent_ms: 31_000 });
        assert!(sampler.check_provider(T0 + 40_000).is_err());

        let changes = sampler.drain_provider_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].reason, ProviderChangeReason::Unavailable);
        assert!(!sampler.is_provider_available());

        // A fix restores availability
        sampler.offer(LocationSample::new(T0 + 41_000, 0.0, 0.0), T0 + 41_000);
        let changes = sampler.drain_provider_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].reason, ProviderChangeReason::Recovered);
        assert!(sampler.check_provider(T0 + 42_000).is_ok());
    }

    #[test]
    fn test_status_update_forwarded() {
        let (mut sampler, _tx) = sampler(10.0);
        let status = ProviderStatus { enabled: false, authorized: true, gps: false, network: false };
        assert!(sampler.handle_update(ProviderUpdate::Status(status.clone()), T0).is_none());
        let changes = sampler.drain_provider_changes();
        assert_eq!(changes[0].status, Some(status));
        assert!(!changes[0].available);
    }

    #[tokio::test]
    async fn test_run_publishes_provider_unavailable() {
        let metrics = Arc::new(Metrics::new());
        let (bus, dispatcher) = EventBus::new(metrics.clone());
        let dispatcher = dispatcher.spawn();

        let changes = Arc::new(Mutex::new(Vec::new()));
        let c = changes.clone();
        bus.subscribe(EventKind::ProviderChange, move |event| {
            if let EventPayload::ProviderChange(change) = &event.payload {
                c.lock().push(change.clone());
            }
            Ok(())
        });

        let settings = SamplerSettings { provider_timeout_ms: 50, ..settings(10.0) };
        // Provider stays connected but silent
        let (_provider_tx, rx) = mpsc::channel(16);
        let sampler = Sampler::new(settings, rx, metrics.clone(), epoch_ms());
        let (out_tx, _out_rx) = mpsc::channel(16);
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(sampler.run(bus.clone(), out_tx, shutdown));

        for _ in 0..500 {
            if !changes.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop.send(true).unwrap();
        handle.await.unwrap();
        bus.shutdown();
        dispatcher.await.unwrap();

        let changes = changes.lock();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].reason, ProviderChangeReason::Unavailable);
        assert!(!changes[0].available);
        assert!(changes[0].silent_ms.is_some_and(|ms| ms > 50));
    }
}

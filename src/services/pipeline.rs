//! Pipeline orchestrator
//!
//! Wires sampler -> location processor -> event bus -> outbox and owns their
//! task handles. Components stop in that order: the sampler first, then the
//! processor, then the bus (drained), then the outbox (an upload in progress
//! completes, then a final compaction).
//!
//! Event seqs continue across launches: the bus starts after both the
//! persisted `next_seq` and the outbox journal watermark.

use crate::domain::event::{Event, EventKind, EventPayload};
use crate::domain::geofence::{Geofence, GeofenceError};
use crate::domain::types::{epoch_ms, ProviderUpdate};
use crate::infra::config::{Config, ConfigError};
use crate::infra::metrics::Metrics;
use crate::io::outbox_store::{OutboxStore, StoreHandle};
use crate::io::state_store::{PersistedState, StateStore};
use crate::services::event_bus::{Dispatcher, EventBus, Handler, SubscriptionId};
use crate::services::motion::MotionSettings;
use crate::services::outbox::{Outbox, OutboxSettings, SyncReport, Uploader};
use crate::services::processor::{LocationProcessor, ProcessorCommand, SharedSnapshot, TrackingSnapshot};
use crate::services::sampler::{Sampler, SamplerSettings};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Sampler -> processor channel depth
const SAMPLE_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Geofence(#[from] GeofenceError),
    #[error("pipeline already started")]
    AlreadyStarted,
    #[error("location processor is not running")]
    ProcessorStopped,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Point-in-time view of the pipeline
#[derive(Debug, Clone, Serialize)]
pub struct State {
    pub enabled: bool,
    pub connected: bool,
    pub power_save: bool,
    pub distance_filter: f64,
    pub stop_on_terminate: bool,
    pub start_on_boot: bool,
    pub auto_sync: bool,
    pub outbox_depth: usize,
    pub subscribers: usize,
    #[serde(flatten)]
    pub tracking: TrackingSnapshot,
}

struct Running {
    sampler: (watch::Sender<bool>, JoinHandle<()>),
    processor: (watch::Sender<bool>, JoinHandle<()>),
    outbox: (watch::Sender<bool>, JoinHandle<()>),
    dispatcher: JoinHandle<()>,
    commands: mpsc::Sender<ProcessorCommand>,
}

pub struct Pipeline {
    config: Config,
    metrics: Arc<Metrics>,
    bus: EventBus,
    outbox: Arc<Outbox>,
    state_store: StateStore,
    snapshot: SharedSnapshot,
    outbox_subscriptions: Vec<SubscriptionId>,
    /// Present until `start`
    idle: Option<(LocationProcessor, Dispatcher)>,
    running: Option<Running>,
    power_save: bool,
}

impl Pipeline {
    /// Validate config, reload the outbox snapshot and register configured geofences
    pub fn new(config: Config, uploader: Arc<dyn Uploader>, metrics: Arc<Metrics>) -> Result<Self, PipelineError> {
        config.validate()?;

        let mut store = OutboxStore::new(config.outbox_file());
        let loaded = store.load()?;
        store.compact(&loaded.entries)?;

        let state_store = StateStore::new(config.state_file());
        let persisted_seq = match state_store.load() {
            Ok(state) => state.map_or(0, |s| s.next_seq),
            Err(e) => {
                warn!(error = %e, "state_load_failed");
                0
            }
        };
        let start_seq = persisted_seq.max(loaded.last_seq + 1);
        info!(restored = %loaded.entries.len(), start_seq = %start_seq, "outbox_restored");

        let store = StoreHandle::spawn(store, metrics.clone())?;
        let (bus, dispatcher) = EventBus::with_start_seq(start_seq, metrics.clone());
        let outbox = Arc::new(Outbox::new(
            OutboxSettings::from_config(&config),
            loaded.entries,
            Some(store),
            uploader,
            bus.clone(),
            metrics.clone(),
        ));

        let outbox_subscriptions = EventKind::ALL
            .into_iter()
            .filter(EventKind::is_persisted)
            .map(|kind| {
                let outbox = outbox.clone();
                bus.subscribe(kind, move |event| {
                    outbox.enqueue(event.clone());
                    Ok(())
                })
            })
            .collect();

        let snapshot = SharedSnapshot::default();
        let mut processor =
            LocationProcessor::new(MotionSettings::from_config(&config), bus.clone(), metrics.clone(), snapshot.clone());
        for fence in config.geofences() {
            processor.register_geofence(fence.clone())?;
        }

        Ok(Self {
            state_store,
            config,
            metrics,
            bus,
            outbox,
            snapshot,
            outbox_subscriptions,
            idle: Some((processor, dispatcher)),
            running: None,
            power_save: false,
        })
    }

    /// Spawn every component and begin consuming provider updates
    pub fn start(&mut self, provider_rx: mpsc::Receiver<ProviderUpdate>) -> Result<(), PipelineError> {
        let Some((processor, dispatcher)) = self.idle.take() else {
            return Err(PipelineError::AlreadyStarted);
        };

        let dispatcher = dispatcher.spawn();

        let (sample_tx, sample_rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let (processor_stop, rx) = watch::channel(false);
        let tick = self.config.motion_tick_interval();
        let processor = (processor_stop, tokio::spawn(processor.run(sample_rx, command_rx, rx, tick)));

        let (sampler_stop, rx) = watch::channel(false);
        let sampler = Sampler::new(
            SamplerSettings::from_config(&self.config),
            provider_rx,
            self.metrics.clone(),
            epoch_ms(),
        );
        let sampler = (sampler_stop, tokio::spawn(sampler.run(self.bus.clone(), sample_tx, rx)));

        let (outbox_stop, rx) = watch::channel(false);
        let outbox = (outbox_stop, tokio::spawn(self.outbox.clone().run(rx)));

        self.running = Some(Running { sampler, processor, outbox, dispatcher, commands });
        self.persist_enabled(true);
        self.publish(EventPayload::EnabledChange { enabled: true });

        info!(
            distance_filter = %self.config.distance_filter(),
            geofences = %self.snapshot.read().geofences.len(),
            auto_sync = %self.config.auto_sync(),
            "pipeline_started"
        );
        Ok(())
    }

    /// Stop all components in order
    ///
    /// With `terminating` set and `stop_on_terminate` off, the persisted
    /// enabled flag stays set so the next launch can resume tracking.
    pub async fn stop(mut self, terminating: bool) {
        let keep_enabled = terminating && !self.config.stop_on_terminate();

        if let Some(running) = self.running.take() {
            stop_task("sampler", running.sampler).await;
            drop(running.commands);
            stop_task("processor", running.processor).await;

            self.publish(EventPayload::EnabledChange { enabled: false });
            self.bus.shutdown();
            if let Err(e) = running.dispatcher.await {
                error!(error = %e, "dispatcher_join_failed");
            }

            stop_task("outbox", running.outbox).await;
        } else {
            self.bus.shutdown();
        }

        for id in self.outbox_subscriptions.drain(..) {
            self.bus.unsubscribe(id);
        }
        self.outbox.flush().await;
        self.persist_enabled(keep_enabled);

        info!(
            terminating = %terminating,
            keep_enabled = %keep_enabled,
            outbox_depth = %self.outbox.len(),
            "pipeline_stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub async fn register_geofence(&mut self, fence: Geofence) -> Result<(), PipelineError> {
        if let Some((processor, _)) = self.idle.as_mut() {
            return Ok(processor.register_geofence(fence)?);
        }
        let (reply, rx) = oneshot::channel();
        self.send_command(ProcessorCommand::RegisterGeofence { fence, reply }).await?;
        Ok(rx.await.map_err(|_| PipelineError::ProcessorStopped)??)
    }

    /// Returns false if no geofence had this id
    pub async fn remove_geofence(&mut self, identifier: &str) -> Result<bool, PipelineError> {
        if let Some((processor, _)) = self.idle.as_mut() {
            return Ok(processor.remove_geofence(identifier));
        }
        let (reply, rx) = oneshot::channel();
        let identifier = identifier.to_string();
        self.send_command(ProcessorCommand::RemoveGeofence { identifier, reply }).await?;
        rx.await.map_err(|_| PipelineError::ProcessorStopped)
    }

    async fn send_command(&self, command: ProcessorCommand) -> Result<(), PipelineError> {
        let running = self.running.as_ref().ok_or(PipelineError::ProcessorStopped)?;
        running.commands.send(command).await.map_err(|_| PipelineError::ProcessorStopped)
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(kind, handler)
    }

    /// Subscribe one handler to several kinds
    pub fn subscribe_many(&self, kinds: &[EventKind], handler: Handler) -> Vec<SubscriptionId> {
        kinds
            .iter()
            .map(|kind| {
                let handler = handler.clone();
                self.bus.subscribe(*kind, move |event| handler(event))
            })
            .collect()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Manual outbox sync
    pub async fn sync(&self) -> SyncReport {
        self.outbox.sync().await
    }

    pub fn set_connectivity(&self, connected: bool) {
        if self.outbox.is_connected() == connected {
            return;
        }
        self.outbox.set_connected(connected);
        self.publish(EventPayload::ConnectivityChange { connected });
    }

    pub fn set_power_save(&mut self, is_power_save_mode: bool) {
        if self.power_save == is_power_save_mode {
            return;
        }
        self.power_save = is_power_save_mode;
        info!(power_save = %is_power_save_mode, "power_save_changed");
        self.publish(EventPayload::PowerSaveChange { is_power_save_mode });
    }

    pub fn state(&self) -> State {
        State {
            enabled: self.is_running(),
            connected: self.outbox.is_connected(),
            power_save: self.power_save,
            distance_filter: self.config.distance_filter(),
            stop_on_terminate: self.config.stop_on_terminate(),
            start_on_boot: self.config.start_on_boot(),
            auto_sync: self.config.auto_sync(),
            outbox_depth: self.outbox.len(),
            subscribers: self.bus.subscriber_count(),
            tracking: self.snapshot.read().clone(),
        }
    }

    /// Whether a launch should resume tracking from the persisted flag
    pub fn should_resume(config: &Config) -> bool {
        if !config.start_on_boot() {
            return false;
        }
        match StateStore::new(config.state_file()).load() {
            Ok(Some(state)) => state.enabled,
            // First launch
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "state_load_failed");
                false
            }
        }
    }

    fn persist_enabled(&self, enabled: bool) {
        let state = PersistedState::new(enabled, self.bus.next_seq());
        if let Err(e) = self.state_store.save(&state) {
            warn!(error = %e, path = %self.state_store.path().display(), "state_persist_failed");
        }
    }

    fn publish(&self, payload: EventPayload) {
        if let Err(e) = self.bus.publish(payload) {
            warn!(error = %e, "pipeline_publish_failed");
        }
    }
}

async fn stop_task(name: &'static str, (stop, handle): (watch::Sender<bool>, JoinHandle<()>)) {
    let _ = stop.send(true);
    if let Err(e) = handle.await {
        error!(task = %name, error = %e, "task_join_failed");
    }
}

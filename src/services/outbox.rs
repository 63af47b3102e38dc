//! Persistent outbox - durable queue of events awaiting upload
//!
//! Entries move PENDING -> IN_FLIGHT -> (removed on ACK | FAILED with backoff).
//! A sync leases due entries oldest-first in batches; the lease returns them
//! to PENDING if the attempt is dropped before it settles. Durable mutations
//! (enqueue, settle, eviction) are journaled through the store writer while the
//! state lock is held, so journal order matches queue order. Leases are not
//! journaled since IN_FLIGHT reverts to PENDING on reload. The in-memory queue
//! stays authoritative when a write fails.

use crate::domain::event::{Event, EventPayload, HttpPayload};
use crate::domain::outbox::{DeliveryStatus, OutboxEntry};
use crate::domain::types::epoch_ms;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::outbox_store::{StoreHandle, StoreOp};
use crate::services::event_bus::EventBus;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(300);
const MS_PER_DAY: u64 = 86_400_000;
/// Journal lines tolerated before compaction, at minimum
const COMPACT_MIN_OPS: usize = 1_024;

/// Retry delay after `attempts` failed attempts: 1 s doubling, capped at 5 min
pub fn backoff_delay(attempts: u32) -> Duration {
    let mut backoff = BACKOFF_INITIAL;
    for _ in 1..attempts {
        backoff = std::cmp::min(backoff * 2, BACKOFF_MAX);
        if backoff == BACKOFF_MAX {
            break;
        }
    }
    backoff
}

/// One entry in an upload batch
#[derive(Debug, Clone, Serialize)]
pub struct UploadRecord {
    pub id: Uuid,
    pub event: Event,
}

/// Per-entry acknowledgement from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryAck {
    pub id: Uuid,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadResponse {
    pub status: u16,
    /// Per-entry results; `None` on a 2xx acks the whole batch
    pub results: Option<Vec<EntryAck>>,
}

impl UploadResponse {
    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sync target for outbox batches
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Errors are transport failures; HTTP failures come back as a status
    async fn upload(&self, records: &[UploadRecord]) -> anyhow::Result<UploadResponse>;
}

/// Time source (epoch ms)
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug, Clone)]
pub struct OutboxSettings {
    pub batch_size: usize,
    pub max_records: usize,
    pub max_days_to_persist: u32,
    pub upload_timeout: Duration,
    pub sync_interval: Duration,
    pub auto_sync: bool,
}

impl OutboxSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size(),
            max_records: config.max_records(),
            max_days_to_persist: config.max_days_to_persist(),
            upload_timeout: config.http_timeout(),
            sync_interval: config.sync_interval(),
            auto_sync: config.auto_sync(),
        }
    }

    #[inline]
    fn max_age_ms(&self) -> u64 {
        u64::from(self.max_days_to_persist) * MS_PER_DAY
    }
}

/// Outcome of one `sync` call
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncReport {
    /// Connectivity was down; nothing attempted
    pub skipped: bool,
    pub batches: usize,
    pub acked: usize,
    pub failed: usize,
    pub evicted: usize,
}

struct OutboxState {
    /// Enqueue order, oldest first
    entries: VecDeque<OutboxEntry>,
    connected: bool,
    /// Journal lines written since the last compaction
    journal_ops: usize,
}

pub struct Outbox {
    settings: OutboxSettings,
    state: Mutex<OutboxState>,
    store: Option<StoreHandle>,
    uploader: Arc<dyn Uploader>,
    bus: EventBus,
    metrics: Arc<Metrics>,
    notify: Notify,
    /// One sync at a time
    sync_lock: tokio::sync::Mutex<()>,
    clock: Clock,
}

enum Settlement {
    Ack,
    Retry { status: DeliveryStatus, error: String },
}

/// IN_FLIGHT lease over a batch
///
/// Dropping it unsettled returns the entries to PENDING.
struct Lease<'a> {
    outbox: &'a Outbox,
    ids: Vec<Uuid>,
    settled: bool,
}

impl<'a> Lease<'a> {
    fn len(&self) -> usize {
        self.ids.len()
    }

    /// Apply per-entry outcomes; returns (acked, failed)
    fn settle<F>(mut self, outcome: F) -> (usize, usize)
    where
        F: Fn(&Uuid) -> Settlement,
    {
        self.settled = true;
        let now = (self.outbox.clock)();
        let mut acked = 0;
        let mut failed = 0;

        let mut ops = Vec::with_capacity(self.ids.len());
        let mut state = self.outbox.state.lock();
        for id in &self.ids {
            let Some(pos) = state.entries.iter().position(|e| e.id == *id) else {
                continue;
            };
            if !state.entries[pos].is_in_flight() {
                continue;
            }
            match outcome(id) {
                Settlement::Ack => {
                    state.entries.remove(pos);
                    ops.push(StoreOp::Remove { id: *id });
                    acked += 1;
                }
                Settlement::Retry { status, error } => {
                    let entry = &mut state.entries[pos];
                    entry.attempts += 1;
                    entry.status = status;
                    entry.next_attempt_at = now + backoff_delay(entry.attempts).as_millis() as u64;
                    entry.last_error = Some(error);
                    ops.push(StoreOp::Put { entry: entry.clone() });
                    failed += 1;
                }
            }
        }
        self.outbox.journal(&mut state, ops);
        drop(state);

        self.outbox.metrics.record_outbox_acked(acked as u64);
        self.outbox.metrics.record_outbox_failed(failed as u64);
        (acked, failed)
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.outbox.state.lock();
        let mut released = 0usize;
        for entry in state.entries.iter_mut() {
            if entry.is_in_flight() && self.ids.contains(&entry.id) {
                entry.status = DeliveryStatus::Pending;
                released += 1;
            }
        }
        drop(state);
        debug!(released = %released, "outbox_lease_released");
    }
}

impl Outbox {
    pub fn new(
        settings: OutboxSettings,
        entries: Vec<OutboxEntry>,
        store: Option<StoreHandle>,
        uploader: Arc<dyn Uploader>,
        bus: EventBus,
        metrics: Arc<Metrics>,
    ) -> Self {
        metrics.set_outbox_depth(entries.len() as u64);
        Self {
            settings,
            state: Mutex::new(OutboxState { journal_ops: entries.len(), entries: entries.into(), connected: true }),
            store,
            uploader,
            bus,
            metrics,
            notify: Notify::new(),
            sync_lock: tokio::sync::Mutex::new(()),
            clock: Arc::new(epoch_ms),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Snapshot of the queue, oldest first
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.state.lock().entries.iter().cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Buffer an event for upload; evicts the oldest non-IN_FLIGHT entries over capacity
    pub fn enqueue(&self, event: Event) {
        let now = (self.clock)();
        let seq = event.seq;
        let kind = event.kind();

        let entry = OutboxEntry::new(event, now);
        let mut ops = vec![StoreOp::Put { entry: entry.clone() }];
        let mut state = self.state.lock();
        state.entries.push_back(entry);
        let mut evicted = 0usize;
        while state.entries.len() > self.settings.max_records {
            let Some(pos) = state.entries.iter().position(|e| !e.is_in_flight()) else {
                break;
            };
            if let Some(old) = state.entries.remove(pos) {
                ops.push(StoreOp::Remove { id: old.id });
            }
            evicted += 1;
        }
        self.journal(&mut state, ops);
        let depth = state.entries.len();
        drop(state);

        self.metrics.record_outbox_enqueued();
        if evicted > 0 {
            self.metrics.record_outbox_evicted_capacity(evicted as u64);
            warn!(evicted = %evicted, max_records = %self.settings.max_records, "outbox_capacity_eviction");
        }
        debug!(seq = %seq, kind = %kind, depth = %depth, "outbox_enqueued");

        if self.settings.auto_sync {
            self.notify.notify_one();
        }
    }

    /// Connectivity change; restoring it wakes the sync task
    pub fn set_connected(&self, connected: bool) {
        let previous = std::mem::replace(&mut self.state.lock().connected, connected);
        if previous == connected {
            return;
        }
        info!(connected = %connected, "outbox_connectivity_changed");
        if connected && self.settings.auto_sync {
            self.notify.notify_one();
        }
    }

    /// Evict expired entries, then upload due entries in batches
    pub async fn sync(&self) -> SyncReport {
        let _guard = self.sync_lock.lock().await;
        let mut report = SyncReport::default();

        if !self.is_connected() {
            debug!("outbox_sync_skipped_offline");
            report.skipped = true;
            return report;
        }

        report.evicted = self.evict_expired((self.clock)());
        if report.evicted > 0 {
            let summary = HttpPayload::eviction_summary(report.evicted, self.settings.max_days_to_persist);
            let _ = self.bus.publish(EventPayload::Http(summary));
        }

        loop {
            let Some((lease, records)) = self.lease_batch((self.clock)()) else {
                break;
            };
            report.batches += 1;

            let started = Instant::now();
            let result = tokio::time::timeout(self.settings.upload_timeout, self.uploader.upload(&records)).await;
            self.metrics.record_upload_latency(started.elapsed().as_millis() as u64);

            let (payload, batch_failed) = self.settle(lease, result);
            report.acked += payload.acked;
            report.failed += payload.failed;
            let _ = self.bus.publish(EventPayload::Http(payload));

            // A failing endpoint is retried on backoff, not hammered
            if batch_failed {
                break;
            }
        }

        if report.batches > 0 || report.evicted > 0 {
            info!(
                batches = %report.batches,
                acked = %report.acked,
                failed = %report.failed,
                evicted = %report.evicted,
                depth = %self.len(),
                "outbox_synced"
            );
        }
        report
    }

    fn settle(
        &self,
        lease: Lease<'_>,
        result: Result<anyhow::Result<UploadResponse>, tokio::time::error::Elapsed>,
    ) -> (HttpPayload, bool) {
        let batch = lease.len();
        match result {
            Err(_) => {
                warn!(batch = %batch, timeout_ms = %self.settings.upload_timeout.as_millis(), "outbox_upload_timeout");
                let error = "upload timed out".to_string();
                let e = error.clone();
                let (_, failed) = lease.settle(|_| Settlement::Retry {
                    status: DeliveryStatus::Pending,
                    error: e.clone(),
                });
                (failure_payload(0, failed, error), true)
            }
            Ok(Err(e)) => {
                warn!(batch = %batch, error = %e, "outbox_upload_failed");
                let error = e.to_string();
                let (_, failed) = lease.settle(|_| Settlement::Retry {
                    status: DeliveryStatus::Failed,
                    error: error.clone(),
                });
                (failure_payload(0, failed, error), true)
            }
            Ok(Ok(response)) if !response.is_success() => {
                warn!(batch = %batch, status = %response.status, "outbox_upload_rejected");
                let error = format!("HTTP {}", response.status);
                let (_, failed) = lease.settle(|_| Settlement::Retry {
                    status: DeliveryStatus::Failed,
                    error: error.clone(),
                });
                (failure_payload(response.status, failed, error), true)
            }
            Ok(Ok(response)) => {
                let acks: Option<FxHashMap<Uuid, bool>> =
                    response.results.map(|r| r.into_iter().map(|a| (a.id, a.ok)).collect());
                let (acked, failed) = lease.settle(|id| match &acks {
                    None => Settlement::Ack,
                    Some(acks) if acks.get(id) == Some(&true) => Settlement::Ack,
                    Some(acks) => Settlement::Retry {
                        status: DeliveryStatus::Failed,
                        error: if acks.contains_key(id) { "rejected".into() } else { "not acknowledged".into() },
                    },
                });
                debug!(status = %response.status, acked = %acked, failed = %failed, "outbox_upload_completed");
                let payload = HttpPayload {
                    success: failed == 0,
                    status: response.status,
                    acked,
                    failed,
                    evicted: 0,
                    error: (failed > 0).then(|| format!("{failed} record(s) not acknowledged")),
                };
                (payload, false)
            }
        }
    }

    /// Mark up to `batch_size` due entries IN_FLIGHT, oldest first
    fn lease_batch(&self, now_ms: u64) -> Option<(Lease<'_>, Vec<UploadRecord>)> {
        let mut state = self.state.lock();
        let mut ids = Vec::new();
        let mut records = Vec::new();
        for entry in state.entries.iter_mut() {
            if records.len() >= self.settings.batch_size {
                break;
            }
            if !entry.is_due(now_ms) {
                continue;
            }
            entry.status = DeliveryStatus::InFlight;
            ids.push(entry.id);
            records.push(UploadRecord { id: entry.id, event: entry.event.clone() });
        }
        drop(state);
        if records.is_empty() {
            return None;
        }
        Some((Lease { outbox: self, ids, settled: false }, records))
    }

    /// Drop entries past the retention window; IN_FLIGHT entries are kept
    fn evict_expired(&self, now_ms: u64) -> usize {
        let max_age = self.settings.max_age_ms();
        let mut state = self.state.lock();
        let mut ops = Vec::new();
        state.entries.retain(|e| {
            let keep = e.is_in_flight() || !e.is_expired(now_ms, max_age);
            if !keep {
                ops.push(StoreOp::Remove { id: e.id });
            }
            keep
        });
        let evicted = ops.len();
        self.journal(&mut state, ops);
        drop(state);

        if evicted > 0 {
            self.metrics.record_outbox_evicted_expired(evicted as u64);
            warn!(
                evicted = %evicted,
                max_days = %self.settings.max_days_to_persist,
                "outbox_expired_eviction"
            );
        }
        evicted
    }

    /// Compact the journal to the current queue and wait until it is on disk
    pub async fn flush(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let done = {
            let mut state = self.state.lock();
            state.journal_ops = state.entries.len();
            store.flush(state.entries.iter().cloned().collect())
        };
        if done.await.is_err() {
            warn!("outbox_flush_incomplete");
        }
    }

    /// Queue journal ops; called with the state lock held
    fn journal(&self, state: &mut OutboxState, ops: Vec<StoreOp>) {
        self.metrics.set_outbox_depth(state.entries.len() as u64);
        let Some(store) = &self.store else {
            return;
        };
        if ops.is_empty() {
            return;
        }
        state.journal_ops += ops.len();
        store.append(ops);

        // One O(depth) snapshot per O(depth) appended ops
        if state.journal_ops >= COMPACT_MIN_OPS.max(2 * state.entries.len()) {
            state.journal_ops = state.entries.len();
            store.compact(state.entries.iter().cloned().collect());
        }
    }

    /// Background sync loop
    ///
    /// Syncs on enqueue/reconnect notifications and every `sync_interval`
    /// while auto sync is on. An upload in progress at shutdown completes.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.settings.sync_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let auto_sync = self.settings.auto_sync;
        info!(auto_sync = %auto_sync, interval_secs = %self.settings.sync_interval.as_secs(), "outbox_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.notify.notified(), if auto_sync => {
                    self.sync().await;
                }
                _ = tick.tick(), if auto_sync => {
                    self.sync().await;
                }
            }
        }

        self.flush().await;
        info!(depth = %self.len(), "outbox_stopped");
    }
}

#[inline]
fn failure_payload(status: u16, failed: usize, error: String) -> HttpPayload {
    HttpPayload { success: false, status, acked: 0, failed, evicted: 0, error: Some(error) }
}

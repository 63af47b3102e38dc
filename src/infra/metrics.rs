//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries for upload latency (milliseconds)
/// Buckets: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, >25600
const BUCKET_BOUNDS: [u64; 10] = [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];
const NUM_BUCKETS: usize = 11;

pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps periodic counters to get a snapshot.
pub struct Metrics {
    /// Raw fixes received from the provider (monotonic)
    samples_received: AtomicU64,
    /// Samples that passed the distance filter (monotonic)
    samples_emitted: AtomicU64,
    /// Samples dropped by the distance filter (monotonic)
    samples_filtered: AtomicU64,
    /// Provider unavailability reports (monotonic)
    provider_unavailable_total: AtomicU64,
    /// Events published to the bus (monotonic)
    events_published: AtomicU64,
    /// Events published since last report (reset on report)
    events_since_report: AtomicU64,
    /// Handler invocations (monotonic)
    deliveries_total: AtomicU64,
    /// Handlers that returned an error or panicked (monotonic)
    handler_errors: AtomicU64,
    /// Motion state transitions (monotonic)
    motion_changes: AtomicU64,
    /// Geofence transitions emitted (monotonic)
    geofence_transitions: AtomicU64,
    /// Entries added to the outbox (monotonic)
    outbox_enqueued: AtomicU64,
    /// Entries acknowledged by the server (monotonic)
    outbox_acked: AtomicU64,
    /// Failed entry delivery attempts (monotonic)
    outbox_failed: AtomicU64,
    /// Entries evicted by the capacity limit (monotonic)
    outbox_evicted_capacity: AtomicU64,
    /// Entries evicted by the retention window (monotonic)
    outbox_evicted_expired: AtomicU64,
    /// Failed outbox snapshot writes (monotonic)
    outbox_persist_errors: AtomicU64,
    /// Current outbox depth (gauge)
    outbox_depth: AtomicU64,
    /// Upload attempts since last report (reset on report)
    uploads_since_report: AtomicU64,
    /// Sum of upload latencies in ms (reset on report)
    upload_latency_sum_ms: AtomicU64,
    /// Max upload latency in ms (reset on report)
    upload_latency_max_ms: AtomicU64,
    /// Upload latency histogram buckets (reset on report)
    upload_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            samples_received: AtomicU64::new(0),
            samples_emitted: AtomicU64::new(0),
            samples_filtered: AtomicU64::new(0),
            provider_unavailable_total: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            events_since_report: AtomicU64::new(0),
            deliveries_total: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            motion_changes: AtomicU64::new(0),
            geofence_transitions: AtomicU64::new(0),
            outbox_enqueued: AtomicU64::new(0),
            outbox_acked: AtomicU64::new(0),
            outbox_failed: AtomicU64::new(0),
            outbox_evicted_capacity: AtomicU64::new(0),
            outbox_evicted_expired: AtomicU64::new(0),
            outbox_persist_errors: AtomicU64::new(0),
            outbox_depth: AtomicU64::new(0),
            uploads_since_report: AtomicU64::new(0),
            upload_latency_sum_ms: AtomicU64::new(0),
            upload_latency_max_ms: AtomicU64::new(0),
            upload_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_sample_received(&self) {
        self.samples_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sample_emitted(&self) {
        self.samples_emitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sample_filtered(&self) {
        self.samples_filtered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_provider_unavailable(&self) {
        self.provider_unavailable_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.events_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery(&self, ok: bool) {
        self.deliveries_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.handler_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_motion_change(&self) {
        self.motion_changes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_geofence_transition(&self) {
        self.geofence_transitions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_outbox_enqueued(&self) {
        self.outbox_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_outbox_acked(&self, count: u64) {
        self.outbox_acked.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_outbox_failed(&self, count: u64) {
        self.outbox_failed.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_outbox_evicted_capacity(&self, count: u64) {
        self.outbox_evicted_capacity.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_outbox_evicted_expired(&self, count: u64) {
        self.outbox_evicted_expired.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_outbox_persist_error(&self) {
        self.outbox_persist_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_outbox_depth(&self, depth: u64) {
        self.outbox_depth.store(depth, Ordering::Relaxed);
    }

    /// Record an upload attempt round-trip (lock-free)
    #[inline]
    pub fn record_upload_latency(&self, latency_ms: u64) {
        self.uploads_since_report.fetch_add(1, Ordering::Relaxed);
        self.upload_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        let bucket = bucket_index(latency_ms);
        self.upload_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.upload_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn handler_errors(&self) -> u64 {
        self.handler_errors.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn samples_filtered(&self) -> u64 {
        self.samples_filtered.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn outbox_acked(&self) -> u64 {
        self.outbox_acked.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn outbox_depth(&self) -> u64 {
        self.outbox_depth.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let events_count = self.events_since_report.swap(0, Ordering::Relaxed);
        let upload_count = self.uploads_since_report.swap(0, Ordering::Relaxed);
        let upload_sum = self.upload_latency_sum_ms.swap(0, Ordering::Relaxed);
        let upload_max = self.upload_latency_max_ms.swap(0, Ordering::Relaxed);
        let upload_buckets = swap_buckets(&self.upload_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let events_per_sec = if elapsed.as_secs_f64() > 0.0 {
            events_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            samples_received: self.samples_received.load(Ordering::Relaxed),
            samples_emitted: self.samples_emitted.load(Ordering::Relaxed),
            samples_filtered: self.samples_filtered.load(Ordering::Relaxed),
            provider_unavailable_total: self.provider_unavailable_total.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            events_per_sec,
            deliveries_total: self.deliveries_total.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            motion_changes: self.motion_changes.load(Ordering::Relaxed),
            geofence_transitions: self.geofence_transitions.load(Ordering::Relaxed),
            outbox_enqueued: self.outbox_enqueued.load(Ordering::Relaxed),
            outbox_acked: self.outbox_acked.load(Ordering::Relaxed),
            outbox_failed: self.outbox_failed.load(Ordering::Relaxed),
            outbox_evicted_capacity: self.outbox_evicted_capacity.load(Ordering::Relaxed),
            outbox_evicted_expired: self.outbox_evicted_expired.load(Ordering::Relaxed),
            outbox_persist_errors: self.outbox_persist_errors.load(Ordering::Relaxed),
            outbox_depth: self.outbox_depth.load(Ordering::Relaxed),
            uploads: upload_count,
            upload_avg_ms: if upload_count > 0 { upload_sum / upload_count } else { 0 },
            upload_max_ms: upload_max,
            upload_p99_ms: percentile_from_buckets(&upload_buckets, 0.99),
            upload_buckets,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub samples_received: u64,
    pub samples_emitted: u64,
    pub samples_filtered: u64,
    pub provider_unavailable_total: u64,
    pub events_published: u64,
    pub events_per_sec: f64,
    pub deliveries_total: u64,
    pub handler_errors: u64,
    pub motion_changes: u64,
    pub geofence_transitions: u64,
    pub outbox_enqueued: u64,
    pub outbox_acked: u64,
    pub outbox_failed: u64,
    pub outbox_evicted_capacity: u64,
    pub outbox_evicted_expired: u64,
    pub outbox_persist_errors: u64,
    pub outbox_depth: u64,
    pub uploads: u64,
    pub upload_avg_ms: u64,
    pub upload_max_ms: u64,
    pub upload_p99_ms: u64,
    pub upload_buckets: [u64; NUM_BUCKETS],
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            samples_received = %self.samples_received,
            samples_emitted = %self.samples_emitted,
            samples_filtered = %self.samples_filtered,
            events_published = %self.events_published,
            events_per_sec = %format!("{:.2}", self.events_per_sec),
            handler_errors = %self.handler_errors,
            motion_changes = %self.motion_changes,
            geofence_transitions = %self.geofence_transitions,
            outbox_depth = %self.outbox_depth,
            outbox_acked = %self.outbox_acked,
            outbox_failed = %self.outbox_failed,
            uploads = %self.uploads,
            upload_avg_ms = %self.upload_avg_ms,
            upload_p99_ms = %self.upload_p99_ms,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(50), 0);
        assert_eq!(bucket_index(51), 1);
        assert_eq!(bucket_index(25600), 9);
        assert_eq!(bucket_index(30000), 10);
    }

    #[test]
    fn test_percentile_empty() {
        assert_eq!(percentile_from_buckets(&[0; NUM_BUCKETS], 0.99), 0);
    }

    #[test]
    fn test_delivery_counts() {
        let metrics = Metrics::new();
        metrics.record_delivery(true);
        metrics.record_delivery(false);
        let summary = metrics.report();
        assert_eq!(summary.deliveries_total, 2);
        assert_eq!(summary.handler_errors, 1);
    }

    #[test]
    fn test_report_resets_periodic_counters() {
        let metrics = Metrics::new();
        metrics.record_upload_latency(120);
        metrics.record_upload_latency(80);
        metrics.record_event_published();

        let first = metrics.report();
        assert_eq!(first.uploads, 2);
        assert_eq!(first.upload_avg_ms, 100);
        assert_eq!(first.upload_max_ms, 120);
        assert_eq!(first.upload_p99_ms, 100);
        assert_eq!(first.events_published, 1);

        let second = metrics.report();
        assert_eq!(second.uploads, 0);
        assert_eq!(second.upload_max_ms, 0);
        // Monotonic counters survive the report
        assert_eq!(second.events_published, 1);
    }
}

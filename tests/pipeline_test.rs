//! End-to-end pipeline tests with an in-memory uploader

use geotrack::domain::{epoch_ms, Coordinate, Event, EventKind, EventPayload, Geofence, GeofenceAction, LocationSample, MotionState, ProviderUpdate};
use geotrack::infra::{Config, Metrics};
use geotrack::services::{Handler, Pipeline, UploadRecord, UploadResponse, Uploader};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Records every batch; answers with a fixed status
struct MemoryUploader {
    status: u16,
    received: Mutex<Vec<UploadRecord>>,
}

impl MemoryUploader {
    fn new(status: u16) -> Arc<Self> {
        Arc::new(Self { status, received: Mutex::new(Vec::new()) })
    }
}

#[async_trait::async_trait]
impl Uploader for MemoryUploader {
    async fn upload(&self, records: &[UploadRecord]) -> anyhow::Result<UploadResponse> {
        self.received.lock().extend_from_slice(records);
        Ok(UploadResponse { status: self.status, results: None })
    }
}

fn config(dir: &TempDir) -> Config {
    Config::default()
        .with_data_dir(dir.path().display().to_string())
        .with_auto_sync(false)
        .with_geofences(vec![Geofence::new("home", Coordinate::new(0.0, 0.0), 100.0)])
}

fn fix(ts: u64, north_m: f64) -> ProviderUpdate {
    let c = Coordinate::new(0.0, 0.0).offset_m(north_m, 0.0);
    ProviderUpdate::Fix(LocationSample::new(ts, c.latitude, c.longitude))
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

#[tokio::test]
async fn test_geofence_enter_exit_and_upload() {
    let dir = TempDir::new().unwrap();
    let uploader = MemoryUploader::new(200);
    let mut pipeline = Pipeline::new(config(&dir), uploader.clone(), Arc::new(Metrics::new())).unwrap();

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let t = transitions.clone();
    pipeline.subscribe(EventKind::Geofence, move |event| {
        if let EventPayload::Geofence(g) = &event.payload {
            t.lock().push((g.identifier.clone(), g.action));
        }
        Ok(())
    });

    let kinds = Arc::new(Mutex::new(Vec::new()));
    let k = kinds.clone();
    let handler: Handler = Arc::new(move |event: &Event| -> anyhow::Result<()> {
        k.lock().push(event.kind());
        Ok(())
    });
    let ids = pipeline.subscribe_many(&[EventKind::MotionChange, EventKind::Geofence], handler);
    assert_eq!(ids.len(), 2);

    let (tx, rx) = mpsc::channel(16);
    pipeline.start(rx).unwrap();

    let t0 = epoch_ms();
    tx.send(fix(t0, 150.0)).await.unwrap();
    tx.send(fix(t0 + 5_000, 50.0)).await.unwrap();
    tx.send(fix(t0 + 10_000, 150.0)).await.unwrap();

    wait_for(|| transitions.lock().len() == 2).await;
    assert_eq!(
        *transitions.lock(),
        vec![("home".to_string(), GeofenceAction::Enter), ("home".to_string(), GeofenceAction::Exit)]
    );

    // 3 locations, 1 motion change, 2 geofence transitions
    wait_for(|| pipeline.outbox().len() == 6).await;
    wait_for(|| kinds.lock().len() == 3).await;
    assert_eq!(kinds.lock().iter().filter(|k| **k == EventKind::Geofence).count(), 2);
    assert!(kinds.lock().contains(&EventKind::MotionChange));
    for id in ids {
        assert!(pipeline.unsubscribe(id));
    }
    let state = pipeline.state();
    assert!(state.enabled);
    assert_eq!(state.tracking.motion, MotionState::Moving);
    assert!(state.tracking.inside.is_empty());

    let report = pipeline.sync().await;
    assert_eq!(report.acked, 6);
    assert!(pipeline.outbox().is_empty());

    let received = uploader.received.lock().clone();
    let seqs: Vec<u64> = received.iter().map(|r| r.event.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(received.iter().filter(|r| r.event.kind() == EventKind::Location).count(), 3);

    pipeline.stop(false).await;
    assert!(!Pipeline::should_resume(&config(&dir)));
}

#[tokio::test]
async fn test_unacked_entries_survive_restart() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = Pipeline::new(config(&dir), MemoryUploader::new(503), Arc::new(Metrics::new())).unwrap();

    let (tx, rx) = mpsc::channel(16);
    pipeline.start(rx).unwrap();
    let t0 = epoch_ms();
    tx.send(fix(t0, 500.0)).await.unwrap();
    tx.send(fix(t0 + 5_000, 700.0)).await.unwrap();

    // 2 locations, 1 motion change
    wait_for(|| pipeline.outbox().len() == 3).await;
    let report = pipeline.sync().await;
    assert_eq!(report.acked, 0);
    assert_eq!(report.failed, 3);

    let max_seq = pipeline.outbox().entries().iter().map(|e| e.event.seq).max().unwrap();
    pipeline.stop(true).await;
    assert!(Pipeline::should_resume(&config(&dir)));

    // Relaunch against the same data directory
    let uploader = MemoryUploader::new(200);
    let mut pipeline = Pipeline::new(config(&dir), uploader.clone(), Arc::new(Metrics::new())).unwrap();
    assert_eq!(pipeline.outbox().len(), 3);

    let (tx, rx) = mpsc::channel(16);
    pipeline.start(rx).unwrap();
    tx.send(fix(epoch_ms(), 900.0)).await.unwrap();
    wait_for(|| pipeline.outbox().len() == 4).await;

    let newest = pipeline.outbox().entries().iter().map(|e| e.event.seq).max().unwrap();
    assert!(newest > max_seq);
    pipeline.stop(false).await;
}

#[tokio::test]
async fn test_runtime_geofence_registration() {
    let dir = TempDir::new().unwrap();
    let mut pipeline =
        Pipeline::new(config(&dir).with_geofences(Vec::new()), MemoryUploader::new(200), Arc::new(Metrics::new()))
            .unwrap();

    let (tx, rx) = mpsc::channel(16);
    pipeline.start(rx).unwrap();

    let office = Geofence::new("office", Coordinate::new(0.0, 0.0), 100.0);
    pipeline.register_geofence(office).await.unwrap();
    let bad = Geofence::new("", Coordinate::new(0.0, 0.0), 100.0);
    assert!(pipeline.register_geofence(bad).await.is_err());

    tx.send(fix(epoch_ms(), 20.0)).await.unwrap();
    wait_for(|| pipeline.state().tracking.inside == vec!["office".to_string()]).await;

    assert!(pipeline.remove_geofence("office").await.unwrap());
    assert!(!pipeline.remove_geofence("office").await.unwrap());
    assert!(pipeline.state().tracking.geofences.is_empty());

    pipeline.set_connectivity(false);
    assert!(pipeline.sync().await.skipped);
    pipeline.stop(false).await;
}

#[tokio::test]
async fn test_seqs_keep_increasing_after_full_ack_and_restart() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = Pipeline::new(config(&dir), MemoryUploader::new(200), Arc::new(Metrics::new())).unwrap();

    let (tx, rx) = mpsc::channel(16);
    pipeline.start(rx).unwrap();
    let t0 = epoch_ms();
    tx.send(fix(t0, 500.0)).await.unwrap();
    tx.send(fix(t0 + 5_000, 700.0)).await.unwrap();

    wait_for(|| pipeline.outbox().len() == 3).await;
    let max_seq = pipeline.outbox().entries().iter().map(|e| e.event.seq).max().unwrap();
    assert_eq!(pipeline.sync().await.acked, 3);
    assert!(pipeline.outbox().is_empty());
    pipeline.stop(false).await;

    // Nothing left in the outbox to derive a seq from
    let mut pipeline = Pipeline::new(config(&dir), MemoryUploader::new(200), Arc::new(Metrics::new())).unwrap();
    assert!(pipeline.outbox().is_empty());
    assert!(pipeline.bus().next_seq() > max_seq);

    let (tx, rx) = mpsc::channel(16);
    pipeline.start(rx).unwrap();
    tx.send(fix(epoch_ms(), 900.0)).await.unwrap();
    wait_for(|| pipeline.outbox().len() == 1).await;

    let newest = pipeline.outbox().entries()[0].event.seq;
    assert!(newest > max_seq);
    pipeline.stop(false).await;
}

//! geotrack - motion and location event pipeline
//!
//! Reads location provider updates (JSONL replay file or stdin), runs them
//! through the sampler, motion state machine and geofence evaluator, and
//! uploads persisted events from the outbox.
//!
//! Module structure:
//! - `domain/` - Core types (LocationSample, Geofence, Event, OutboxEntry)
//! - `io/` - External interfaces (outbox store, HTTP uploader, replay, Prometheus)
//! - `services/` - Pipeline components (Sampler, Motion, Geofence, EventBus, Outbox)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use geotrack::domain::{Event, EventKind};
use geotrack::infra::{Config, Metrics};
use geotrack::io::replay::{replay_file, replay_reader};
use geotrack::io::HttpUploader;
use geotrack::services::{Handler, Pipeline};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Provider -> sampler channel depth
const PROVIDER_CHANNEL_CAPACITY: usize = 1024;

/// geotrack - motion and location event pipeline
#[derive(Parser, Debug)]
#[command(name = "geotrack", version, about)]
struct Args {
    /// Path to TOML configuration file [default: $CONFIG_FILE or config/dev.toml]
    #[arg(short, long)]
    config: Option<String>,

    /// Replay provider updates from a JSONL file instead of stdin
    #[arg(short, long)]
    replay: Option<PathBuf>,

    /// Replay speed factor (0 = as fast as possible)
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Start tracking regardless of the persisted enabled flag
    #[arg(long)]
    start: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref());

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(build = %env!("GEOTRACK_BUILD"), "geotrack starting");

    if config.http_url().is_empty() && config.auto_sync() {
        warn!("http_url_missing_auto_sync_disabled");
        config = config.with_auto_sync(false);
    }

    info!(
        config_file = %config.config_file(),
        distance_filter = %config.distance_filter(),
        stop_on_terminate = %config.stop_on_terminate(),
        start_on_boot = %config.start_on_boot(),
        auto_sync = %config.auto_sync(),
        max_days_to_persist = %config.max_days_to_persist(),
        minimum_fetch_interval_secs = %config.minimum_fetch_interval().as_secs(),
        data_dir = %config.data_dir().display(),
        geofences = %config.geofences().len(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let metrics = Arc::new(Metrics::new());
    let uploader = Arc::new(HttpUploader::from_config(&config)?);
    let mut pipeline = match Pipeline::new(config.clone(), uploader, metrics.clone()) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "pipeline_rejected");
            return Err(e.into());
        }
    };

    // Log every state transition the host app would react to
    let transition_log: Handler = Arc::new(|event: &Event| -> anyhow::Result<()> {
        match serde_json::to_string(&event.payload) {
            Ok(payload) => info!(seq = %event.seq, kind = %event.kind().as_str(), payload = %payload, "event"),
            Err(e) => warn!(seq = %event.seq, error = %e, "event_serialize_failed"),
        }
        Ok(())
    });
    pipeline.subscribe_many(
        &[EventKind::MotionChange, EventKind::Geofence, EventKind::ProviderChange, EventKind::Http],
        transition_log,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) =
                geotrack::io::prometheus::start_metrics_server(prometheus_port, prom_metrics, prom_shutdown).await
            {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    // Periodic metrics summary
    let reporter_metrics = metrics.clone();
    let mut reporter_shutdown = shutdown_rx.clone();
    let metrics_interval = Duration::from_secs(config.metrics_interval_secs());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(metrics_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => reporter_metrics.report().log(),
                _ = reporter_shutdown.changed() => break,
            }
        }
    });

    let (provider_tx, provider_rx) = mpsc::channel(PROVIDER_CHANNEL_CAPACITY);
    let resume = Pipeline::should_resume(&config);
    if args.start || resume {
        pipeline.start(provider_rx)?;
    } else {
        info!("tracking_disabled");
    }

    match serde_json::to_string(&pipeline.state()) {
        Ok(state) => info!(state = %state, "current_state"),
        Err(e) => warn!(error = %e, "state_serialize_failed"),
    }

    let from_stdin = args.replay.is_none();
    let replay_shutdown = shutdown_rx.clone();
    let mut provider = tokio::spawn(async move {
        match args.replay {
            Some(path) => replay_file(&path, args.speed, provider_tx, replay_shutdown).await,
            None => replay_reader(BufReader::new(tokio::io::stdin()), 0.0, provider_tx, replay_shutdown).await,
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown_signal_received");
        }
        result = &mut provider => {
            match result {
                Ok(Ok(stats)) => info!(sent = %stats.sent, skipped = %stats.skipped, "provider_finished"),
                Ok(Err(e)) => error!(error = %e, "provider_failed"),
                Err(e) => error!(error = %e, "provider_task_failed"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    match serde_json::to_string(&pipeline.state()) {
        Ok(state) => info!(state = %state, "final_state"),
        Err(e) => warn!(error = %e, "state_serialize_failed"),
    }
    pipeline.stop(true).await;

    info!("geotrack shutdown complete");
    if from_stdin {
        // A blocked stdin read would hold up runtime shutdown
        std::process::exit(0);
    }
    Ok(())
}

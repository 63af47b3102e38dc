//! Prometheus metrics HTTP endpoint
//!
//! Exposes pipeline metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum {}", avg * count);
    let _ = writeln!(output, "{name}_count {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_sampler_metrics(&mut output, &summary);
    write_bus_metrics(&mut output, &summary);
    write_tracking_metrics(&mut output, &summary);
    write_outbox_metrics(&mut output, &summary);

    output
}

fn write_sampler_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "geotrack_samples_received_total",
        "Raw fixes received from the provider",
        MetricType::Counter,
        summary.samples_received,
    );
    write_metric(
        output,
        "geotrack_samples_emitted_total",
        "Samples that passed the distance filter",
        MetricType::Counter,
        summary.samples_emitted,
    );
    write_metric(
        output,
        "geotrack_samples_filtered_total",
        "Samples dropped by the distance filter",
        MetricType::Counter,
        summary.samples_filtered,
    );
    write_metric(
        output,
        "geotrack_provider_unavailable_total",
        "Provider timeouts",
        MetricType::Counter,
        summary.provider_unavailable_total,
    );
}

fn write_bus_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "geotrack_events_published_total",
        "Events published on the bus",
        MetricType::Counter,
        summary.events_published,
    );
    let _ = writeln!(output, "# HELP geotrack_events_per_sec Events published per second");
    let _ = writeln!(output, "# TYPE geotrack_events_per_sec gauge");
    let _ = writeln!(output, "geotrack_events_per_sec {:.2}", summary.events_per_sec);
    write_metric(
        output,
        "geotrack_deliveries_total",
        "Handler invocations",
        MetricType::Counter,
        summary.deliveries_total,
    );
    write_metric(
        output,
        "geotrack_handler_errors_total",
        "Handlers that returned an error or panicked",
        MetricType::Counter,
        summary.handler_errors,
    );
}

fn write_tracking_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "geotrack_motion_changes_total",
        "Motion state transitions",
        MetricType::Counter,
        summary.motion_changes,
    );
    write_metric(
        output,
        "geotrack_geofence_transitions_total",
        "Geofence transitions emitted",
        MetricType::Counter,
        summary.geofence_transitions,
    );
}

fn write_outbox_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "geotrack_outbox_depth",
        "Entries waiting in the outbox",
        MetricType::Gauge,
        summary.outbox_depth,
    );
    write_metric(
        output,
        "geotrack_outbox_enqueued_total",
        "Entries enqueued",
        MetricType::Counter,
        summary.outbox_enqueued,
    );
    write_metric(
        output,
        "geotrack_outbox_acked_total",
        "Entries acknowledged by the server",
        MetricType::Counter,
        summary.outbox_acked,
    );
    write_metric(
        output,
        "geotrack_outbox_failed_total",
        "Failed delivery attempts",
        MetricType::Counter,
        summary.outbox_failed,
    );

    let _ = writeln!(output, "# HELP geotrack_outbox_evicted_total Entries evicted without delivery");
    let _ = writeln!(output, "# TYPE geotrack_outbox_evicted_total counter");
    let _ = writeln!(output, "geotrack_outbox_evicted_total{{reason=\"capacity\"}} {}", summary.outbox_evicted_capacity);
    let _ = writeln!(output, "geotrack_outbox_evicted_total{{reason=\"expired\"}} {}", summary.outbox_evicted_expired);

    write_metric(
        output,
        "geotrack_outbox_persist_errors_total",
        "Failed outbox snapshots",
        MetricType::Counter,
        summary.outbox_persist_errors,
    );

    write_histogram(
        output,
        "geotrack_upload_latency_ms",
        "Upload latency in milliseconds",
        &summary.upload_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.upload_avg_ms,
    );
    write_metric(
        output,
        "geotrack_upload_latency_p99_ms",
        "99th percentile upload latency",
        MetricType::Gauge,
        summary.upload_p99_ms,
    );
}

fn text_response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, hyper::header::HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics),
        ),
        (&Method::GET, "/health") => text_response(StatusCode::OK, "text/plain", "ok"),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_sample_received();
        metrics.record_sample_filtered();
        metrics.record_upload_latency(120);
        metrics.record_outbox_evicted_expired(3);
        metrics.set_outbox_depth(7);

        let output = format_prometheus_metrics(&metrics);

        assert!(output.contains("geotrack_samples_received_total 1"));
        assert!(output.contains("geotrack_samples_filtered_total 1"));
        assert!(output.contains("geotrack_outbox_depth 7"));
        assert!(output.contains("geotrack_outbox_evicted_total{reason=\"expired\"} 3"));
        assert!(output.contains("geotrack_upload_latency_ms_bucket{le=\"200\"} 1"));
        assert!(output.contains("geotrack_upload_latency_ms_count 1"));
    }
}

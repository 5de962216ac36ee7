//! Status and metrics HTTP endpoint
//!
//! - `GET /metrics` - Prometheus text format
//! - `GET /health` - liveness
//! - `GET /status` - JSON snapshot of the trip state and latest position

use crate::domain::trip::{TripPhase, TripState};
use crate::domain::types::Position;
use crate::infra::metrics::{Metrics, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::latest_position::LatestPosition;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

/// Shared read-only view served by the endpoint
#[derive(Clone)]
pub struct StatusContext {
    pub metrics: Arc<Metrics>,
    pub latest: Arc<LatestPosition>,
    pub trip: watch::Receiver<TripState>,
}

#[derive(Debug, Serialize)]
struct StatusSnapshot {
    generated_at: String,
    phase: TripPhase,
    trip_id: Option<Uuid>,
    destination_notified: bool,
    origin_notified: bool,
    elapsed_secs: Option<f64>,
    latest_position: Option<Position>,
    position_age_ms: Option<u64>,
}

impl StatusSnapshot {
    fn capture(ctx: &StatusContext) -> Self {
        let state = *ctx.trip.borrow();
        Self {
            generated_at: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
            phase: state.phase(),
            trip_id: state.trip_id,
            destination_notified: state.destination_notified,
            origin_notified: state.origin_notified,
            elapsed_secs: state.elapsed(Instant::now()).map(|d| d.as_secs_f64()),
            latest_position: ctx.latest.load(),
            position_age_ms: ctx.latest.age().map(|d| d.as_millis() as u64),
        }
    }
}

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

fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
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
    let _ = writeln!(output, "{name}_sum {sum}");
    let _ = writeln!(output, "{name}_count {cumulative}");
}

/// Format metrics in Prometheus text exposition format
///
/// Reads counters directly so scraping never resets the periodic summary.
fn format_prometheus_metrics(metrics: &Metrics, state: &TripState) -> String {
    let mut output = String::with_capacity(4096);

    write_metric(
        &mut output,
        "follower_positions_total",
        "Valid position reports received",
        MetricType::Counter,
        metrics.positions_received(),
    );
    write_metric(
        &mut output,
        "follower_positions_discarded_total",
        "Malformed position reports discarded",
        MetricType::Counter,
        metrics.positions_discarded(),
    );
    write_metric(
        &mut output,
        "follower_detector_ticks_total",
        "Detector evaluations",
        MetricType::Counter,
        metrics.detector_ticks(),
    );
    write_metric(
        &mut output,
        "follower_destination_events_total",
        "Destination arrivals detected",
        MetricType::Counter,
        metrics.destination_events(),
    );
    write_metric(
        &mut output,
        "follower_origin_events_total",
        "Returns to origin detected",
        MetricType::Counter,
        metrics.origin_events(),
    );
    write_metric(
        &mut output,
        "follower_commands_enqueued_total",
        "Device commands enqueued",
        MetricType::Counter,
        metrics.commands_enqueued(),
    );
    write_metric(
        &mut output,
        "follower_commands_delivered_total",
        "Device commands acknowledged",
        MetricType::Counter,
        metrics.commands_delivered(),
    );
    write_metric(
        &mut output,
        "follower_commands_timed_out_total",
        "Device commands that timed out",
        MetricType::Counter,
        metrics.commands_timed_out(),
    );
    write_metric(
        &mut output,
        "follower_commands_failed_total",
        "Device commands that failed",
        MetricType::Counter,
        metrics.commands_failed(),
    );
    write_metric(
        &mut output,
        "follower_command_queue_depth",
        "Commands waiting for the worker",
        MetricType::Gauge,
        metrics.command_queue_depth(),
    );
    write_histogram(
        &mut output,
        "follower_command_latency_ms",
        "Device command round trip in milliseconds",
        &metrics.command_latency_buckets(),
        &METRICS_BUCKET_BOUNDS,
        metrics.command_latency_sum_ms(),
    );
    write_metric(
        &mut output,
        "follower_notifications_sent_total",
        "Notifications accepted by the provider",
        MetricType::Counter,
        metrics.notifications_sent(),
    );
    write_metric(
        &mut output,
        "follower_notifications_failed_total",
        "Notifications that failed",
        MetricType::Counter,
        metrics.notifications_failed(),
    );
    write_metric(
        &mut output,
        "follower_notifications_in_flight",
        "Notifications currently being sent",
        MetricType::Gauge,
        metrics.notifications_in_flight(),
    );

    let _ = writeln!(output, "# HELP follower_trip_phase Current trip phase");
    let _ = writeln!(output, "# TYPE follower_trip_phase gauge");
    let current = state.phase();
    for phase in [TripPhase::Waiting, TripPhase::Underway, TripPhase::Returned] {
        let val = u8::from(phase == current);
        let _ = writeln!(output, "follower_trip_phase{{phase=\"{}\"}} {val}", phase.as_str());
    }

    output
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    ctx: StatusContext,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let state = *ctx.trip.borrow();
            text_response(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                format_prometheus_metrics(&ctx.metrics, &state),
            )
        }
        (&Method::GET, "/health") => {
            text_response(StatusCode::OK, "text/plain", "ok".to_string())
        }
        (&Method::GET, "/status") => match serde_json::to_string(&StatusSnapshot::capture(&ctx)) {
            Ok(json) => text_response(StatusCode::OK, "application/json", json),
            Err(e) => text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                format!("status encoding failed: {e}"),
            ),
        },
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };
    Ok(response)
}

/// Start the status HTTP server; returns on shutdown
pub async fn start_status_server(
    port: u16,
    ctx: StatusContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, "status_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let ctx = ctx.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, ctx.clone()));
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "status_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "status_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("status_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

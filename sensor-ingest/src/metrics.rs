use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const ADMISSIONS: &str = "sensor_ingest_admissions_total";
pub const PERSIST_DURATION: &str = "sensor_ingest_persist_duration_seconds";
pub const DEDUPE_ENTRIES: &str = "sensor_ingest_dedupe_entries";
pub const DEDUPE_EVICTED: &str = "sensor_ingest_dedupe_evicted_total";
pub const NOTIFICATIONS: &str = "sensor_ingest_notifications_total";
pub const FEED_RECEIVERS: &str = "sensor_ingest_feed_receivers";
pub const BUS_RECONNECTS: &str = "sensor_ingest_bus_reconnects_total";
pub const SIMULATOR_TICKS: &str = "sensor_ingest_simulator_ticks_total";

const HTTP_REQUESTS: &str = "sensor_ingest_http_requests_total";
const HTTP_REQUEST_DURATION: &str = "sensor_ingest_http_requests_duration_seconds";

/// Add the prometheus endpoint and middleware to a router, should be called last.
/// Fails if a recorder was already installed in this process.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    // Seconds. Inserts and HTTP calls are expected to land well under one second.
    const BUCKETS: &[f64] = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
}

/// Count requests and their latency by method, matched route and status.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    // Use the route template so path parameters do not explode label cardinality.
    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];

    metrics::counter!(HTTP_REQUESTS, &labels).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION, &labels).record(start.elapsed().as_secs_f64());

    response
}

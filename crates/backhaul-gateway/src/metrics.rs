//! Prometheus metrics exposition.
//!
//! Collectors are process-wide: the recorder is installed once at boot and
//! never torn down. Components record through the `metrics` facade against
//! the names below; the handle renders the text format at `metrics.path`.

use std::{sync::Arc, time::Duration};

use axum::{routing::get, Router};
use backhaul_delivery::Queue;
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Counter of inbound requests, labeled by path.
pub const REQUESTS_TOTAL: &str = "http_requests_total";

/// Histogram of inbound request duration, labeled by path.
pub const REQUEST_DURATION: &str = "http_response_time_seconds";

/// Histogram of upstream request duration, labeled by path and result.
pub const PROXY_REQUEST_DURATION: &str = "http_proxy_response_time_seconds";

/// Gauge of outstanding queue rows.
pub const QUEUE_TOTAL_SIZE: &str = "queue_total_size";

const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

const GAUGE_REFRESH: Duration = Duration::from_secs(5);

/// Installs the global Prometheus recorder and describes the collectors.
///
/// # Errors
///
/// Returns an error when a recorder is already installed or the builder
/// rejects the bucket configuration.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_owned()), DURATION_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full(PROXY_REQUEST_DURATION.to_owned()), DURATION_BUCKETS)?
        .install_recorder()?;

    describe_counter!(REQUESTS_TOTAL, "Number of requests.");
    describe_histogram!(REQUEST_DURATION, "Response time.");
    describe_histogram!(PROXY_REQUEST_DURATION, "Proxy request response time.");
    describe_gauge!(QUEUE_TOTAL_SIZE, "Number of all requests in the queue.");

    Ok(handle)
}

/// Router serving the rendered metrics at the given path.
pub fn router(path: &str, handle: PrometheusHandle) -> Router {
    Router::new().route(
        path,
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    )
}

/// Refreshes the queue size gauge until cancelled.
pub fn spawn_queue_gauge(queue: Arc<dyn Queue>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(GAUGE_REFRESH);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = tick.tick() => {
                    #[allow(clippy::cast_precision_loss)]
                    gauge!(QUEUE_TOTAL_SIZE).set(queue.total().await as f64);
                },
            }
        }
    })
}

//! Inbound HTTP server.
//!
//! A single catch-all route: every path and method is accepted and handed
//! to the gateway, which acknowledges with the configured status. The only
//! carve-out is the metrics path when metrics share the inbound listener.

use std::{sync::Arc, time::Instant};

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    Router,
};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    gateway::Gateway,
    metrics::{REQUESTS_TOTAL, REQUEST_DURATION},
};

/// Builds the inbound router.
///
/// `collocated_metrics` mounts the metrics handler on this listener when
/// `metrics.bind` equals `server.bind`; requests to that path then bypass
/// the gateway.
pub fn router(
    gateway: Arc<Gateway>,
    collocated_metrics: Option<(String, PrometheusHandle)>,
) -> Router {
    let app = Router::new()
        .fallback(accept)
        .layer(middleware::from_fn(track_request))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway);

    match collocated_metrics {
        Some((path, handle)) => app.merge(crate::metrics::router(&path, handle)),
        None => app,
    }
}

/// Serves the router until a shutdown signal arrives, then drains
/// in-flight connections.
///
/// # Errors
///
/// Returns the underlying I/O error from the listener.
pub async fn serve(listener: TcpListener, router: Router) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "server listening");
    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await
}

async fn accept(State(gateway): State<Arc<Gateway>>, request: Request) -> StatusCode {
    info!(method = %request.method(), uri = %request.uri(), "received");
    gateway.accept(request).await
}

/// Counts and times every inbound request, labeled by path.
async fn track_request(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_owned();
    counter!(REQUESTS_TOTAL, "path" => path.clone()).increment(1);

    let start = Instant::now();
    let response = next.run(request).await;
    histogram!(REQUEST_DURATION, "path" => path).record(start.elapsed().as_secs_f64());

    response
}

/// Completes on CTRL+C (development) or SIGTERM (orchestrated shutdown).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("received SIGTERM, starting graceful shutdown");
        },
    }
}

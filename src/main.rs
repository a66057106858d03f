//! Backhaul — asynchronous HTTP forwarding gateway.
//!
//! Accepts inbound requests, acknowledges them immediately, and delivers
//! them to the configured origin either synchronously or through the
//! durable queue. This binary wires configuration, tracing, metrics, the
//! gateway, and graceful shutdown together.

use std::sync::Arc;

use anyhow::{Context, Result};
use backhaul_gateway::{config::Config, gateway::Gateway, metrics, server};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting backhaul");

    let config = Config::load()?;
    info!(
        bind = %config.server.bind,
        remote_url = %config.proxy.remote_url,
        queue_enabled = config.queue.enabled,
        db = %config.connection_string_masked(),
        "configuration loaded"
    );

    let metrics_handle = metrics::install_recorder()?;

    let gateway = Arc::new(Gateway::new(&config).await.context("initializing gateway")?);
    gateway.start().await;

    let gauge_token = CancellationToken::new();
    let gauge_task =
        gateway.queue().map(|queue| metrics::spawn_queue_gauge(queue, gauge_token.clone()));

    let metrics_server = if config.metrics_collocated() {
        None
    } else {
        let listener = TcpListener::bind(config.metrics_addr()?)
            .await
            .context("binding metrics listener")?;
        info!(addr = %listener.local_addr()?, path = %config.metrics.path, "metrics listening");
        let app = metrics::router(&config.metrics.path, metrics_handle.clone());
        Some(tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app).await {
                error!(%error, "metrics server failed");
            }
        }))
    };

    let collocated =
        config.metrics_collocated().then(|| (config.metrics.path.clone(), metrics_handle));
    let app = server::router(gateway.clone(), collocated);
    let listener =
        TcpListener::bind(config.server_addr()?).await.context("binding server listener")?;

    server::serve(listener, app).await.context("serving")?;

    // The listener is closed and in-flight connections are drained; what
    // remains is async dispatch work, workers, and open upstream calls.
    if let Err(error) = gateway.stop(config.shutdown_timeout()).await {
        error!(%error, "graceful shutdown incomplete");
    }

    gauge_token.cancel();
    if let Some(task) = gauge_task {
        let _ = task.await;
    }
    if let Some(task) = metrics_server {
        task.abort();
    }

    info!("backhaul stopped");
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,backhaul=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

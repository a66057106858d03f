//! Dispatch policy and lifecycle coordination.
//!
//! The gateway snapshots inbound requests, answers with the configured
//! status right away, and decides per request whether delivery happens
//! synchronously (fast path, no database round-trip) or through the
//! durable queue. Every async dispatch is tracked so shutdown can wait for
//! quiescence.

use std::{
    num::NonZeroU32,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{body::Body, extract::Request, http::StatusCode};
use backhaul_core::{CaptureError, CapturedRequest};
use backhaul_delivery::{DeliveryError, Forward, ForwardClient, PgQueue, Queue, Result, WorkerPool};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use metrics::histogram;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::{config::Config, metrics::PROXY_REQUEST_DURATION};

/// Forwards a captured request and records the upstream histogram, labeled
/// by the captured URL and `"OK"` or the error's string form.
///
/// This is both the gateway's synchronous path and the capability injected
/// into the worker pool.
pub struct Sender {
    client: Arc<ForwardClient>,
}

impl Sender {
    /// Wraps the shared upstream client.
    pub fn new(client: Arc<ForwardClient>) -> Self {
        Self { client }
    }

    /// Sends one request, tracking duration and outcome.
    ///
    /// # Errors
    ///
    /// Propagates the client's delivery error after recording it.
    pub async fn send(&self, request: &CapturedRequest) -> Result<()> {
        let start = Instant::now();
        let result = self.client.send(request).await;

        let status = match &result {
            Ok(()) => "OK".to_owned(),
            Err(error) => {
                warn!(error = %error, request = %request, "proxy error");
                error.to_string()
            },
        };
        histogram!(
            PROXY_REQUEST_DURATION,
            "path" => request.origin_url().to_owned(),
            "status" => status
        )
        .record(start.elapsed().as_secs_f64());

        result
    }

    /// The wrapped client, for shutdown sequencing.
    pub fn client(&self) -> &ForwardClient {
        &self.client
    }
}

#[async_trait::async_trait]
impl Forward for Sender {
    async fn forward(&self, request: &CapturedRequest) -> Result<()> {
        self.send(request).await
    }
}

/// Front of the system: ingress handling, dispatch, and shutdown.
pub struct Gateway {
    sender: Arc<Sender>,
    queue: Option<Arc<dyn Queue>>,
    worker: Mutex<Option<WorkerPool>>,
    sync_limiter: DefaultDirectRateLimiter,
    dispatches: TaskTracker,
    response_status: StatusCode,
}

impl Gateway {
    /// Builds the gateway from configuration, connecting the queue when
    /// enabled.
    ///
    /// # Errors
    ///
    /// Returns configuration errors from the client or worker pool, or a
    /// storage error when the queue database is unreachable.
    pub async fn new(config: &Config) -> Result<Self> {
        let client = Arc::new(ForwardClient::new(
            &config.proxy.remote_url,
            config.request_timeout(),
            config.proxy.num_clients,
        )?);
        let sender = Arc::new(Sender::new(client));

        let worker = if config.queue.enabled {
            info!("queueing enabled");
            let queue: Arc<dyn Queue> = Arc::new(
                PgQueue::connect(
                    &config.db.connection_string,
                    config.db.max_connections,
                    config.db.use_index,
                )
                .await?,
            );
            Some(WorkerPool::new(config.worker_config(), queue, sender.clone())?)
        } else {
            None
        };

        Self::from_parts(sender, worker, config.server.response_status, config.server.sync_per_second)
    }

    /// Assembles a gateway from pre-built parts. Tests use this to inject
    /// fake queues and local origins.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid response status or a
    /// zero sync rate.
    pub fn from_parts(
        sender: Arc<Sender>,
        worker: Option<WorkerPool>,
        response_status: u16,
        sync_per_second: u32,
    ) -> Result<Self> {
        let response_status = StatusCode::from_u16(response_status)
            .map_err(|e| DeliveryError::configuration(format!("response status: {e}")))?;
        let sync_rate = NonZeroU32::new(sync_per_second)
            .ok_or_else(|| DeliveryError::configuration("sync_per_second must be >= 1"))?;

        Ok(Self {
            sender,
            queue: worker.as_ref().map(WorkerPool::queue),
            worker: Mutex::new(worker),
            sync_limiter: RateLimiter::direct(Quota::per_second(sync_rate)),
            dispatches: TaskTracker::new(),
            response_status,
        })
    }

    /// Boots the worker pool, if queueing is enabled.
    pub async fn start(&self) {
        if let Some(worker) = self.worker.lock().await.as_mut() {
            worker.spawn_workers();
        }
    }

    /// Shared queue handle for the size gauge; `None` when queueing is
    /// disabled.
    pub fn queue(&self) -> Option<Arc<dyn Queue>> {
        self.queue.clone()
    }

    /// Ingress entry: snapshots the request and acknowledges immediately.
    ///
    /// The caller never waits for upstream completion; capture failures are
    /// the only thing reported back, as 400.
    pub async fn accept(self: Arc<Self>, request: Request) -> StatusCode {
        let (parts, body) = request.into_parts();

        let body = match read_body(body).await {
            Ok(body) => body,
            Err(error) => {
                warn!(method = %parts.method, uri = %parts.uri, %error, "rejecting request");
                return StatusCode::BAD_REQUEST;
            },
        };

        let captured = CapturedRequest::capture(&parts, body);
        let gateway = Arc::clone(&self);
        self.dispatches.spawn(async move {
            gateway.dispatch(captured).await;
        });

        self.response_status
    }

    /// Routes one captured request: fast path when queueing is off or the
    /// sync limiter admits, durable queue otherwise, falling back to the
    /// fast path when the enqueue fails.
    ///
    /// Delivery errors never propagate: the inbound caller has already
    /// been answered, so failures are logged (and retried by the worker
    /// pool when they happened on the queue path).
    async fn dispatch(&self, request: CapturedRequest) {
        let Some(queue) = &self.queue else {
            let _ = self.sender.send(&request).await;
            return;
        };

        if self.sync_limiter.check().is_ok() {
            let _ = self.sender.send(&request).await;
            return;
        }

        if let Err(error) = queue.enqueue(&request, 1).await {
            warn!(%error, "enqueueing error, proxying without the queue");
            let _ = self.sender.send(&request).await;
        }
    }

    /// Stops the gateway: drains in-flight dispatches, stops the workers,
    /// then waits out open upstream calls. Residual queue rows are left
    /// for the next process.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::ShutdownTimeout`] as soon as one stage
    /// overruns the deadline.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        info!("stopping proxying...");
        let deadline = Instant::now() + timeout;

        self.dispatches.close();
        if tokio::time::timeout(remaining(deadline), self.dispatches.wait()).await.is_err() {
            return Err(DeliveryError::ShutdownTimeout { timeout });
        }

        if let Some(worker) = self.worker.lock().await.take() {
            worker.shutdown(remaining(deadline)).await?;
        }

        self.sender.client().shutdown(remaining(deadline)).await
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

async fn read_body(body: Body) -> std::result::Result<bytes::Bytes, CaptureError> {
    axum::body::to_bytes(body, usize::MAX).await.map_err(CaptureError::read)
}

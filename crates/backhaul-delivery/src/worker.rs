//! Rate-limited worker pool draining the durable queue.
//!
//! Workers share one token bucket, so the steady-state dequeue rate across
//! the pool is `handle_per_second` regardless of worker count. Empty or
//! failing dequeues back off exponentially; failed deliveries go back to
//! the queue with an incremented attempt counter until the retry budget is
//! spent.

use std::{num::NonZeroU32, sync::Arc, time::Duration};

use backhaul_core::{CapturedRequest, Clock, RealClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    backoff::{Backoff, BackoffPolicy},
    error::{DeliveryError, Result},
    queue::Queue,
};

/// Capability to send a dequeued record upstream.
///
/// Injected into the pool as a single-method trait so workers are testable
/// without a real HTTP stack.
#[async_trait::async_trait]
pub trait Forward: Send + Sync {
    /// Delivers one captured request to the origin.
    async fn forward(&self, request: &CapturedRequest) -> Result<()>;
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent consumer loops.
    pub workers: u32,

    /// Collective dequeue-attempt rate across the pool, with burst equal
    /// to the rate.
    pub handle_per_second: u32,

    /// Retry budget: a record failing at `attempt > max_retries` is
    /// dropped instead of re-enqueued.
    pub max_retries: u32,

    /// Pause schedule for empty or failing dequeues.
    pub backoff: BackoffPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            handle_per_second: 10,
            max_retries: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Pool of queue consumers.
pub struct WorkerPool {
    config: WorkerConfig,
    queue: Arc<dyn Queue>,
    forwarder: Arc<dyn Forward>,
    limiter: Arc<DefaultDirectRateLimiter>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    /// Creates a pool over the given queue and forwarding capability.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `workers` or `handle_per_second`
    /// is zero.
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn Queue>,
        forwarder: Arc<dyn Forward>,
    ) -> Result<Self> {
        Self::with_clock(config, queue, forwarder, Arc::new(RealClock::new()))
    }

    /// Creates a pool with an injected clock. Tests use this to make
    /// backoff sleeps instantaneous.
    pub fn with_clock(
        config: WorkerConfig,
        queue: Arc<dyn Queue>,
        forwarder: Arc<dyn Forward>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.workers < 1 {
            return Err(DeliveryError::configuration("workers count cannot be less than 1"));
        }
        let rate = NonZeroU32::new(config.handle_per_second)
            .ok_or_else(|| DeliveryError::configuration("handle_per_second must be >= 1"))?;

        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(rate)));

        Ok(Self {
            config,
            queue,
            forwarder,
            limiter,
            cancellation_token: CancellationToken::new(),
            worker_handles: Vec::new(),
            clock,
        })
    }

    /// Spawns the configured number of worker loops. Returns immediately.
    pub fn spawn_workers(&mut self) {
        info!(
            workers = self.config.workers,
            handle_per_second = self.config.handle_per_second,
            max_retries = self.config.max_retries,
            "starting queue workers"
        );

        for worker_id in 0..self.config.workers {
            let worker = Worker {
                id: worker_id,
                queue: self.queue.clone(),
                forwarder: self.forwarder.clone(),
                limiter: self.limiter.clone(),
                cancellation_token: self.cancellation_token.clone(),
                max_retries: self.config.max_retries,
                backoff: Backoff::new(self.config.backoff.clone()),
                clock: self.clock.clone(),
            };
            self.worker_handles.push(tokio::spawn(worker.run()));
        }
    }

    /// External enqueue entry: first attempt is always 1.
    ///
    /// # Errors
    ///
    /// Propagates the storage error when the insert fails; the gateway
    /// falls back to synchronous delivery in that case.
    pub async fn enqueue(&self, request: &CapturedRequest) -> Result<()> {
        self.queue.enqueue(request, 1).await
    }

    /// Shared handle to the underlying queue (for the size gauge).
    pub fn queue(&self) -> Arc<dyn Queue> {
        self.queue.clone()
    }

    /// Signals stop, waits for in-flight iterations, then closes the queue.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::ShutdownTimeout`] when workers are still
    /// busy past the deadline, or [`DeliveryError::WorkerPanic`] for the
    /// first worker task that aborted instead of stopping. The queue is
    /// closed either way.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<()> {
        info!("stopping queue workers");
        self.cancellation_token.cancel();

        let join_all = async {
            let mut first_panic = None;
            for (worker_id, handle) in
                std::mem::take(&mut self.worker_handles).into_iter().enumerate()
            {
                if let Err(join_error) = handle.await {
                    error!(worker_id, %join_error, "worker task panicked");
                    if first_panic.is_none() {
                        first_panic = Some(DeliveryError::WorkerPanic {
                            worker_id: u32::try_from(worker_id).unwrap_or(u32::MAX),
                            message: join_error.to_string(),
                        });
                    }
                }
            }
            first_panic
        };

        let result = match tokio::time::timeout(timeout, join_all).await {
            Ok(None) => Ok(()),
            Ok(Some(panic_error)) => Err(panic_error),
            Err(_) => {
                error!(timeout = ?timeout, "worker shutdown timed out, some workers may still be running");
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        };

        self.queue.shutdown().await;
        result
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Orphaned loops would keep dequeueing forever; stop them even on
        // a non-graceful drop.
        if !self.worker_handles.is_empty() && !self.cancellation_token.is_cancelled() {
            self.cancellation_token.cancel();
            warn!("worker pool dropped without shutdown, cancelling workers");
        }
    }
}

struct Worker {
    id: u32,
    queue: Arc<dyn Queue>,
    forwarder: Arc<dyn Forward>,
    limiter: Arc<DefaultDirectRateLimiter>,
    cancellation_token: CancellationToken,
    max_retries: u32,
    backoff: Backoff,
    clock: Arc<dyn Clock>,
}

impl Worker {
    async fn run(mut self) {
        info!(worker_id = self.id, "worker started");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            // One token per dequeue attempt, shared across the pool.
            tokio::select! {
                () = self.cancellation_token.cancelled() => break,
                () = self.limiter.until_ready() => {},
            }

            // Dropping the dequeue future on stop rolls the claim
            // transaction back; the row stays visible to the next process.
            let dequeued = tokio::select! {
                () = self.cancellation_token.cancelled() => break,
                result = self.queue.dequeue() => result,
            };

            match dequeued {
                Ok((request, attempt)) => {
                    self.backoff.reset();
                    self.deliver(&request, attempt).await;
                },
                Err(DeliveryError::Empty) => self.pause().await,
                Err(error) => {
                    warn!(worker_id = self.id, %error, "dequeue failed");
                    self.pause().await;
                },
            }
        }

        info!(worker_id = self.id, "worker stopped");
    }

    async fn pause(&mut self) {
        let delay = self.backoff.next_delay();
        tokio::select! {
            () = self.cancellation_token.cancelled() => {},
            () = self.clock.sleep(delay) => {},
        }
    }

    /// The record is already gone from the queue; whatever happens here
    /// must either succeed, re-enqueue, or knowingly drop it.
    async fn deliver(&self, request: &CapturedRequest, attempt: u32) {
        let Err(delivery_error) = self.forwarder.forward(request).await else {
            return;
        };

        if !delivery_error.is_retryable() {
            error!(
                worker_id = self.id,
                error = %delivery_error,
                request = %request,
                "dropping undeliverable request"
            );
            return;
        }

        if attempt > self.max_retries {
            warn!(
                worker_id = self.id,
                error = %delivery_error,
                attempt,
                request = %request,
                "retries exhausted, dropping request"
            );
            return;
        }

        if let Err(enqueue_error) = self.queue.enqueue(request, attempt + 1).await {
            warn!(
                worker_id = self.id,
                error = %enqueue_error,
                request = %request,
                "couldn't retry request, record lost"
            );
        }
    }
}

//! Error types for queueing and upstream delivery.
//!
//! The taxonomy drives worker retry decisions: transport failures and
//! non-2xx upstream responses are retryable via re-enqueue, a permanently
//! malformed captured URL is not, and storage errors only ever cause
//! backoff because nothing was handed out.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failure modes of the queue, the worker pool, and the upstream client.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Captured URL cannot be turned into an upstream request. Permanent.
    #[error("building upstream request: {message}")]
    Build {
        /// What made the request unbuildable.
        message: String,
    },

    /// Upstream call failed before producing a response (connect error,
    /// timeout, canceled).
    #[error("request error: {message}")]
    Transport {
        /// Underlying transport failure.
        message: String,
    },

    /// Upstream responded with a status above 299. 3xx and 4xx are treated
    /// the same as 5xx; this is the documented policy.
    #[error("response {status}")]
    UpstreamStatus {
        /// HTTP status code of the response.
        status: u16,
    },

    /// Underlying database failure during enqueue, dequeue, or commit.
    #[error("queue error: {message}")]
    Storage {
        /// Database error description.
        message: String,
    },

    /// No queued row matched. Sentinel, not a failure; drives worker
    /// backoff.
    #[error("queue is empty")]
    Empty,

    /// Component was constructed with invalid settings.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error description.
        message: String,
    },

    /// Quiescence was not reached before the shutdown deadline.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// A worker task aborted instead of completing its loop.
    #[error("worker {worker_id} panicked: {message}")]
    WorkerPanic {
        /// Index of the aborted worker.
        worker_id: u32,
        /// Join error description.
        message: String,
    },
}

impl DeliveryError {
    /// Creates a build error from a message.
    pub fn build(message: impl ToString) -> Self {
        Self::Build { message: message.to_string() }
    }

    /// Creates a transport error from a message.
    pub fn transport(message: impl ToString) -> Self {
        Self::Transport { message: message.to_string() }
    }

    /// Creates an upstream-status error from a response code.
    pub fn upstream_status(status: u16) -> Self {
        Self::UpstreamStatus { status }
    }

    /// Creates a storage error from a message.
    pub fn storage(message: impl ToString) -> Self {
        Self::Storage { message: message.to_string() }
    }

    /// Creates a configuration error from a message.
    pub fn configuration(message: impl ToString) -> Self {
        Self::Configuration { message: message.to_string() }
    }

    /// Whether a failed delivery may be re-enqueued.
    ///
    /// Transport failures and upstream error statuses are transient from
    /// the queue's point of view. A request whose URL cannot be built will
    /// never become deliverable, so it is dropped immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::UpstreamStatus { .. })
    }
}

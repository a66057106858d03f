//! Abstract queue capability.

use backhaul_core::CapturedRequest;

use crate::error::Result;

/// Durable FIFO of captured requests awaiting delivery.
///
/// The queue is represented by its four operations rather than a concrete
/// store, so worker tests can run against an in-memory fake. Production
/// uses [`crate::PgQueue`].
#[async_trait::async_trait]
pub trait Queue: Send + Sync {
    /// Snapshot count of outstanding records. Feeds a gauge only, so an
    /// approximation (or 0 on error) is acceptable.
    async fn total(&self) -> u64;

    /// Persists one record with the given attempt counter.
    async fn enqueue(&self, request: &CapturedRequest, attempt: u32) -> Result<()>;

    /// Claims and removes one record.
    ///
    /// Returns the record together with its attempt counter,
    /// [`crate::DeliveryError::Empty`] when no record is available, or a
    /// storage error. Concurrent callers never observe the same record.
    async fn dequeue(&self) -> Result<(CapturedRequest, u32)>;

    /// Releases the backing resources. Idempotent.
    async fn shutdown(&self);
}

//! Clock abstraction for testable timing.
//!
//! Worker backoff and gauge refresh loops sleep through an injected clock
//! so tests can shrink or fake delays without touching the runtime.

use std::{future::Future, pin::Pin, time::Duration};

/// Injectable time source.
///
/// Production code uses [`RealClock`]; tests may substitute an
/// implementation that returns immediately.
pub trait Clock: Send + Sync {
    /// Sleeps for the given duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

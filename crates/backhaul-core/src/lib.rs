//! Core domain types for the backhaul forwarding gateway.
//!
//! Provides the captured-request value object shared by the ingress path,
//! the durable queue, and the upstream delivery client, plus the clock
//! abstraction used to make timing-sensitive code testable.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod request;
pub mod time;

pub use request::{BuildError, CaptureError, CapturedRequest, Headers};
pub use time::{Clock, RealClock};

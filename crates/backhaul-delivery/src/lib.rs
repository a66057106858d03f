//! Durable delivery pipeline for the backhaul gateway.
//!
//! Implements the queue-backed half of the system: a PostgreSQL queue with
//! `FOR UPDATE SKIP LOCKED` dequeue for lock-free work distribution, a
//! rate-limited worker pool with exponential backoff, and the upstream HTTP
//! client with a bounded number of parallel calls.
//!
//! ```text
//!            enqueue                        dequeue (skip-locked,
//!   Gateway ────────►  proxy_requests  ◄──────── delete-on-claim)
//!                          table                   │
//!                                         ┌────────┼────────┐
//!                                         ▼        ▼        ▼
//!                                      Worker 1 Worker 2 Worker N
//!                                         │        │        │
//!                                         └───► ForwardClient ───► origin
//! ```
//!
//! Retry state lives in the durable row: the `attempt` counter is read on
//! dequeue and written back on re-enqueue, so a crashed worker cannot drift
//! it. A row claimed by an uncommitted transaction is invisible to every
//! other worker.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod client;
pub mod error;
pub mod pg;
pub mod queue;
pub mod worker;

pub use backoff::{Backoff, BackoffPolicy};
pub use client::ForwardClient;
pub use error::{DeliveryError, Result};
pub use pg::PgQueue;
pub use queue::Queue;
pub use worker::{Forward, WorkerConfig, WorkerPool};

//! Webhook reliability pipeline.
//!
//! Inbound identity-provider webhooks are verified, de-duplicated by event id,
//! handed to a caller-supplied processor under a timeout, retried with
//! exponential backoff and finally parked in a dead-letter queue. All state
//! lives in a shared key-value store reached through a circuit breaker, so any
//! number of stateless instances can run side by side.

pub mod auth;
pub mod circuit;
pub mod config;
pub mod dlq;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod idempotency;
pub mod logger;
pub mod orchestrator;
pub mod processor;
pub mod retry;
pub mod state;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod verifier;

use chrono::Utc;

/// Wall-clock time in epoch milliseconds, the unit of every persisted timestamp.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

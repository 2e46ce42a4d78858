use serde::{Deserialize, Serialize};
use specta::Type;
use std::collections::BTreeMap;

use super::WebhookEvent;

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct RetryEntry {
    pub id: String,
    pub event: WebhookEvent,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Epoch milliseconds; also the sort key of the retry queue.
    pub next_retry_at: i64,
    pub last_retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub correlation_id: String,
    pub created_at: i64,
    pub processing_time_ms: Option<i64>,
    pub headers: BTreeMap<String, String>,
    pub policy: RetryPolicy,
}

/// Backoff an entry was scheduled with; every later attempt reuses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Type)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct RetryRunStats {
    pub processed: u32,
    pub successful: u32,
    pub failed: u32,
    pub dead_lettered: u32,
    pub skipped: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Type)]
pub struct RetryStats {
    pub total_entries: u64,
    pub ready_entries: u64,
    pub by_retry_count: BTreeMap<u32, u64>,
    pub average_delay_ms: f64,
    pub oldest_entry_at: Option<i64>,
    pub total_scheduled: i64,
    pub total_succeeded: i64,
    pub total_dead_lettered: i64,
}

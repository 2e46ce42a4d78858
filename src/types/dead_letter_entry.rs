use serde::{Deserialize, Serialize};
use specta::Type;
use std::collections::BTreeMap;

use super::WebhookEvent;

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct DeadLetterEntry {
    pub id: String,
    pub event: WebhookEvent,
    pub error: String,
    pub timestamp: i64,
    pub retry_count: u32,
    pub correlation_id: String,
    pub headers: BTreeMap<String, String>,
    pub processing_time_ms: Option<i64>,
    pub last_retry_at: Option<i64>,
    pub next_retry_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Type)]
pub struct DlqStats {
    pub total_entries: u64,
    pub by_event_type: BTreeMap<String, u64>,
    pub by_retry_count: BTreeMap<u32, u64>,
    pub average_processing_time_ms: f64,
    pub oldest_entry_at: Option<i64>,
    pub newest_entry_at: Option<i64>,
    pub size_warnings: i64,
    pub total_added: i64,
}

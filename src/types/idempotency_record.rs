use serde::{Deserialize, Serialize};
use specta::Type;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct RecordError {
    pub code: String,
    pub message: String,
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct IdempotencyRecord {
    pub id: String,
    pub event_id: String,
    pub event_type: String,
    pub correlation_id: String,
    pub status: IdempotencyStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    pub result: Option<String>,
    pub error: Option<RecordError>,
    pub metadata: BTreeMap<String, String>,
}

impl IdempotencyRecord {
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct IdempotencyCheck {
    pub is_duplicate: bool,
    pub can_process: bool,
    pub record: Option<IdempotencyRecord>,
    pub reason: Option<String>,
    pub retry_after_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Type)]
pub struct IdempotencyStats {
    pub tracked: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

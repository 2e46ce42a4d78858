use serde::{Deserialize, Serialize};
use specta::Type;

use super::{DeadLetterEntry, LogEntry, ProcessingResult, RetryEntry};

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct ListDeadLettersResponse {
    pub entries: Vec<DeadLetterEntry>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct ReplayResponse {
    pub dlq_id: String,
    pub removed: bool,
    pub result: ProcessingResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Type)]
pub struct ClearDeadLettersRequest {
    pub event_type: Option<String>,
    /// Only clear entries older than this epoch millisecond timestamp.
    pub older_than: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct ClearDeadLettersResponse {
    pub cleared: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Type)]
pub struct RetryAllResponse {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct ListRetriesResponse {
    pub entries: Vec<RetryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct ListLogsResponse {
    pub logs: Vec<LogEntry>,
}

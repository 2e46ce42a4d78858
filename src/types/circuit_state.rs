use serde::{Deserialize, Serialize};
use specta::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct CircuitBreakerState {
    pub state: CircuitStatus,
    pub consecutive_failures: u32,
    pub total_requests: u32,
    pub failed_requests: u32,
    pub last_failure_at: Option<i64>,
    /// Remaining cool-down while open.
    pub open_for_ms: Option<i64>,
}

use serde::{Deserialize, Serialize};
use specta::Type;
use std::collections::BTreeMap;

use super::{CircuitBreakerState, DlqStats, IdempotencyStats, LogStats, RetryStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct ComponentHealth {
    pub status: HealthLevel,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct HealthStatus {
    pub status: HealthLevel,
    pub checked_at: i64,
    pub components: BTreeMap<String, ComponentHealth>,
    pub circuit: CircuitBreakerState,
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct ProcessingStats {
    pub idempotency: IdempotencyStats,
    pub retries: RetryStats,
    pub dead_letters: DlqStats,
    pub logs: LogStats,
    pub circuit: CircuitBreakerState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Type)]
pub struct CleanupReport {
    pub idempotency_records: u64,
    pub dead_letters: u64,
    pub logs: u64,
}

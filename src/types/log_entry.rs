use serde::{Deserialize, Serialize};
use specta::Type;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct LogError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct LogEntry {
    pub id: String,
    pub timestamp: i64,
    pub level: LogLevel,
    pub correlation_id: String,
    pub event_type: Option<String>,
    pub user_id: Option<String>,
    pub operation: String,
    pub message: String,
    pub metadata: Option<BTreeMap<String, String>>,
    pub duration_ms: Option<i64>,
    pub error: Option<LogError>,
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Type)]
pub struct LogStats {
    pub total_logs: u64,
    pub by_level: BTreeMap<String, u64>,
    pub by_operation: BTreeMap<String, u64>,
    pub by_source: BTreeMap<String, u64>,
    pub average_duration_ms: f64,
    pub error_rate: f64,
    pub recent_errors: Vec<LogEntry>,
}

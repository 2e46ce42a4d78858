use serde::{Deserialize, Serialize};
use specta::Type;
use std::collections::BTreeMap;

/// Raw inbound delivery, before signature verification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Type)]
pub struct WebhookRequest {
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl WebhookRequest {
    pub fn new(headers: BTreeMap<String, String>, body: impl Into<String>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A verified identity-provider event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Type)]
pub struct WebhookEvent {
    /// Natural idempotency key assigned by the provider.
    pub id: String,
    pub event_type: String,
    pub user_id: Option<String>,
    pub payload: serde_json::Value,
    pub received_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    Duplicate { reason: String },
    Rejected { reason: RejectionReason },
    RetryScheduled { retry_id: String },
    DeadLettered { dlq_id: String },
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// Signature, timestamp or payload did not verify.
    Verification,
    /// Verified, but the event id is unusable.
    InvalidEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct ProcessingResult {
    pub success: bool,
    pub correlation_id: String,
    pub processing_time_ms: i64,
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    pub user_id: Option<String>,
    pub error: Option<String>,
    pub outcome: WebhookOutcome,
}

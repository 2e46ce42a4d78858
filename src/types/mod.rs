pub mod admin;
pub mod api_error;
pub mod circuit_state;
pub mod dead_letter_entry;
pub mod health;
pub mod idempotency_record;
pub mod log_entry;
pub mod retry_entry;
pub mod webhook;

#[allow(unused_imports)]
pub use admin::{
    ClearDeadLettersRequest, ClearDeadLettersResponse, ListDeadLettersResponse,
    ListLogsResponse, ListRetriesResponse, ReplayResponse, RetryAllResponse,
};
#[allow(unused_imports)]
pub use api_error::{ApiErrorCode, ApiErrorResponse};
#[allow(unused_imports)]
pub use circuit_state::{CircuitBreakerState, CircuitStatus};
#[allow(unused_imports)]
pub use dead_letter_entry::{DeadLetterEntry, DlqStats};
#[allow(unused_imports)]
pub use health::{CleanupReport, ComponentHealth, HealthLevel, HealthStatus, ProcessingStats};
#[allow(unused_imports)]
pub use idempotency_record::{
    IdempotencyCheck, IdempotencyRecord, IdempotencyStats, IdempotencyStatus, RecordError,
};
#[allow(unused_imports)]
pub use log_entry::{LogEntry, LogError, LogLevel, LogStats};
#[allow(unused_imports)]
pub use retry_entry::{RetryEntry, RetryPolicy, RetryRunStats, RetryStats};
#[allow(unused_imports)]
pub use webhook::{ProcessingResult, RejectionReason, WebhookEvent, WebhookOutcome, WebhookRequest};

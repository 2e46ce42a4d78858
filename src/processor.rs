use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::WebhookEvent;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("{0}")]
    Failed(String),
    #[error("processor task panicked")]
    Panicked,
}

impl ProcessorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Business handler invoked once per verified event.
///
/// `Ok(true)` means the event was handled. `Ok(false)` and `Err` are both
/// failures and enter the retry path.
#[async_trait]
pub trait EventProcessor: Send + Sync + 'static {
    async fn process(
        &self,
        event: WebhookEvent,
        correlation_id: String,
    ) -> Result<bool, ProcessorError>;
}

#[async_trait]
impl<F, Fut> EventProcessor for F
where
    F: Fn(WebhookEvent, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, ProcessorError>> + Send + 'static,
{
    async fn process(
        &self,
        event: WebhookEvent,
        correlation_id: String,
    ) -> Result<bool, ProcessorError> {
        (self)(event, correlation_id).await
    }
}

/// Default processor for the bundled binary: acknowledges every event after
/// recording it in the trace.
pub struct LoggingProcessor;

#[async_trait]
impl EventProcessor for LoggingProcessor {
    async fn process(
        &self,
        event: WebhookEvent,
        correlation_id: String,
    ) -> Result<bool, ProcessorError> {
        tracing::info!(
            correlation_id = %correlation_id,
            event_id = %event.id,
            event_type = %event.event_type,
            user_id = event.user_id.as_deref().unwrap_or("-"),
            "identity event accepted"
        );
        Ok(true)
    }
}

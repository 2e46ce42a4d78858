use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{
    error::ApiError,
    extractors::RawWebhook,
    state::AppState,
    types::{RejectionReason, WebhookOutcome},
};

/// Intake for identity-provider webhooks.
///
/// Anything that verifies and carries a usable event id is acknowledged with a
/// 2xx: failed processing is retried by this service, not by the provider.
pub async fn identity_webhook_handler(
    State(state): State<AppState>,
    RawWebhook(request): RawWebhook,
) -> Response {
    let result = state
        .orchestrator
        .process_webhook(&request, state.processor.clone())
        .await;

    let status = match &result.outcome {
        WebhookOutcome::Rejected { reason } => {
            let message = result.error.unwrap_or_else(|| "webhook rejected".to_string());
            let err = match reason {
                RejectionReason::Verification => ApiError::VerificationFailed(message),
                RejectionReason::InvalidEvent => ApiError::Validation(message),
            };
            return err.into_response();
        }
        WebhookOutcome::Processed | WebhookOutcome::Duplicate { .. } => StatusCode::OK,
        WebhookOutcome::RetryScheduled { .. }
        | WebhookOutcome::DeadLettered { .. }
        | WebhookOutcome::Failed => StatusCode::ACCEPTED,
    };

    (status, Json(result)).into_response()
}

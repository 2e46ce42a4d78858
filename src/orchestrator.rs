//! Sequences verification, idempotency, processing, retry and dead-lettering
//! for each delivery.
//!
//! No store failure escapes `process_webhook`: every step either fails open or
//! degrades to the next fallback and the outcome says which one happened.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::circuit::CircuitBreaker;
use crate::config::{OrchestratorConfig, PipelineConfig};
use crate::dlq::{DeadLetterQueue, DlqFilter, NewDeadLetter};
use crate::error::PipelineError;
use crate::idempotency::{IdempotencyError, IdempotencyTracker};
use crate::logger::{LogContext, WebhookLogger};
use crate::now_millis;
use crate::processor::{EventProcessor, ProcessorError};
use crate::retry::{NewRetry, RetryScheduler};
use crate::store::{GuardedStore, Store, StoreError};
use crate::types::{
    CircuitStatus, CleanupReport, ComponentHealth, HealthLevel, HealthStatus, ProcessingResult,
    ProcessingStats, RecordError, RejectionReason, ReplayResponse, RetryAllResponse, RetryRunStats,
    WebhookEvent, WebhookOutcome, WebhookRequest,
};
use crate::verifier::Verifier;

/// Result of one processing attempt for an already verified event.
enum Attempt {
    Succeeded,
    Duplicate(String),
    /// The event id failed validation.
    Rejected(String),
    /// The event already used every attempt the tracker allows.
    Exhausted(PipelineError),
    Failed(PipelineError),
}

/// Runs `processor` on its own task, bounded by `timeout`.
///
/// On timeout the task keeps running unless `abort_on_timeout` is set, so a
/// slow processor may still complete after its attempt was recorded as failed.
pub async fn run_with_timeout(
    processor: Arc<dyn EventProcessor>,
    event: WebhookEvent,
    correlation_id: String,
    timeout: Duration,
    abort_on_timeout: bool,
) -> Result<(), PipelineError> {
    let mut task = tokio::spawn(async move { processor.process(event, correlation_id).await });

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(Ok(true))) => Ok(()),
        Ok(Ok(Ok(false))) => Err(PipelineError::Processing(
            "processor reported failure".to_string(),
        )),
        Ok(Ok(Err(err))) => Err(PipelineError::Processing(err.to_string())),
        Ok(Err(join_err)) => {
            tracing::error!(error = %join_err, "processor task did not complete");
            Err(PipelineError::Processing(ProcessorError::Panicked.to_string()))
        }
        Err(_) => {
            if abort_on_timeout {
                task.abort();
            }
            Err(PipelineError::ProcessingTimeout {
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}

pub struct WebhookOrchestrator {
    config: OrchestratorConfig,
    store: GuardedStore,
    verifier: Arc<dyn Verifier>,
    idempotency: IdempotencyTracker,
    retries: RetryScheduler,
    dlq: Arc<DeadLetterQueue>,
    logger: WebhookLogger,
}

impl WebhookOrchestrator {
    pub fn new(config: PipelineConfig, store: Arc<dyn Store>, verifier: Arc<dyn Verifier>) -> Self {
        let config = config.normalize();
        let breaker = Arc::new(CircuitBreaker::new(config.circuit.clone()));
        let store = GuardedStore::new(store, breaker);

        let dlq = Arc::new(DeadLetterQueue::new(store.clone(), config.dlq.clone()));
        Self {
            idempotency: IdempotencyTracker::new(store.clone(), config.idempotency.clone()),
            retries: RetryScheduler::new(store.clone(), config.retry.clone(), Arc::clone(&dlq)),
            logger: WebhookLogger::new(store.clone(), config.logger.clone()),
            dlq,
            verifier,
            store,
            config: config.orchestrator,
        }
    }

    pub fn idempotency(&self) -> &IdempotencyTracker {
        &self.idempotency
    }

    pub fn retries(&self) -> &RetryScheduler {
        &self.retries
    }

    pub fn dlq(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    pub fn logger(&self) -> &WebhookLogger {
        &self.logger
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        self.store.breaker()
    }

    pub async fn process_webhook(
        &self,
        request: &WebhookRequest,
        processor: Arc<dyn EventProcessor>,
    ) -> ProcessingResult {
        let correlation_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        self.logger
            .debug(
                "webhook_received",
                "webhook received",
                LogContext::new(&correlation_id).meta("body_bytes", request.body.len()),
            )
            .await;

        let event = match self.verifier.verify_webhook(request) {
            Ok(event) => event,
            Err(err) => {
                let err = PipelineError::from(err);
                self.logger
                    .warn(
                        "verification_failed",
                        "webhook signature verification failed",
                        LogContext::new(&correlation_id)
                            .duration_ms(elapsed_ms(started))
                            .error("VerificationError", err.to_string()),
                    )
                    .await;
                return ProcessingResult {
                    success: false,
                    correlation_id,
                    processing_time_ms: elapsed_ms(started),
                    event_id: None,
                    event_type: None,
                    user_id: None,
                    error: Some(err.to_string()),
                    outcome: WebhookOutcome::Rejected {
                        reason: RejectionReason::Verification,
                    },
                };
            }
        };

        let attempt = self
            .attempt(&event, &correlation_id, Arc::clone(&processor), started)
            .await;

        let (success, outcome, error) = match attempt {
            Attempt::Succeeded => (true, WebhookOutcome::Processed, None),
            Attempt::Duplicate(reason) => (true, WebhookOutcome::Duplicate { reason }, None),
            Attempt::Rejected(message) => (false, invalid_event(), Some(message)),
            // Already dead-lettered by the retry scheduler; redeliveries are no-ops.
            Attempt::Exhausted(_) => (
                true,
                WebhookOutcome::Duplicate {
                    reason: "maximum attempts exceeded".to_string(),
                },
                None,
            ),
            Attempt::Failed(err) => {
                let outcome = self
                    .handle_failure(&event, &correlation_id, &request.headers, &err, started)
                    .await;
                (false, outcome, Some(err.to_string()))
            }
        };

        ProcessingResult {
            success,
            correlation_id,
            processing_time_ms: elapsed_ms(started),
            event_id: Some(event.id),
            event_type: Some(event.event_type),
            user_id: event.user_id,
            error,
            outcome,
        }
    }

    /// Claims, processes and records one attempt of `event`.
    async fn attempt(
        &self,
        event: &WebhookEvent,
        correlation_id: &str,
        processor: Arc<dyn EventProcessor>,
        started: Instant,
    ) -> Attempt {
        let context = || {
            LogContext::new(correlation_id)
                .event_type(&event.event_type)
                .user_id(event.user_id.clone())
                .meta("event_id", &event.id)
        };

        let metadata = BTreeMap::from([("user_id".to_string(), event.user_id.clone().unwrap_or_default())]);
        let claimed = match self
            .idempotency
            .start_processing(&event.id, &event.event_type, correlation_id, metadata)
            .await
        {
            Ok(_) => true,
            Err(IdempotencyError::MaxAttemptsExceeded { event_id, attempts }) => {
                self.logger
                    .info(
                        "max_attempts_exceeded",
                        &format!("event already attempted {attempts} times, not processing"),
                        context(),
                    )
                    .await;
                return Attempt::Exhausted(PipelineError::MaxAttemptsExceeded { event_id, attempts });
            }
            Err(err) if err.is_duplicate() => {
                let reason = match &err {
                    IdempotencyError::DuplicateEvent { reason, .. } => reason.clone(),
                    _ => "event is currently being processed".to_string(),
                };
                self.logger
                    .info("duplicate_event", &format!("duplicate delivery ignored: {reason}"), context())
                    .await;
                return Attempt::Duplicate(reason);
            }
            Err(IdempotencyError::InvalidEventId(message)) => {
                self.logger
                    .warn("invalid_event", &message, context())
                    .await;
                return Attempt::Rejected(message);
            }
            Err(err) => {
                self.logger
                    .warn(
                        "idempotency_unavailable",
                        "idempotency claim failed, processing without it",
                        context().error(err.code(), err.to_string()),
                    )
                    .await;
                false
            }
        };

        let outcome = run_with_timeout(
            processor,
            event.clone(),
            correlation_id.to_string(),
            self.config.processing_timeout,
            self.config.abort_on_timeout,
        )
        .await;

        match outcome {
            Ok(()) => {
                if claimed
                    && let Err(err) = self
                        .idempotency
                        .mark_completed(&event.id, Some("processed".to_string()), None)
                        .await
                {
                    tracing::warn!(event_id = %event.id, error = %err, "failed to mark event completed");
                }
                self.logger
                    .info(
                        "webhook_processed",
                        "webhook processed",
                        context().duration_ms(elapsed_ms(started)),
                    )
                    .await;
                Attempt::Succeeded
            }
            Err(err) => {
                if claimed {
                    let record_error = RecordError {
                        code: failure_code(&err).to_string(),
                        message: err.to_string(),
                        stack: None,
                    };
                    if let Err(mark_err) = self.idempotency.mark_failed(&event.id, record_error, None).await {
                        tracing::warn!(event_id = %event.id, error = %mark_err, "failed to mark event failed");
                    }
                }
                self.logger
                    .error(
                        "processing_failed",
                        "webhook processing failed",
                        context()
                            .duration_ms(elapsed_ms(started))
                            .error(failure_code(&err), err.to_string()),
                    )
                    .await;
                Attempt::Failed(err)
            }
        }
    }

    /// Hands a failed first attempt to the retry scheduler, falling back to
    /// the dead-letter queue.
    async fn handle_failure(
        &self,
        event: &WebhookEvent,
        correlation_id: &str,
        headers: &BTreeMap<String, String>,
        err: &PipelineError,
        started: Instant,
    ) -> WebhookOutcome {
        let processing_time_ms = Some(elapsed_ms(started));

        if self.config.enable_retries && err.is_retryable() {
            let scheduled = self
                .retries
                .schedule_retry(NewRetry {
                    event: event.clone(),
                    error: err.to_string(),
                    correlation_id: correlation_id.to_string(),
                    headers: headers.clone(),
                    processing_time_ms,
                })
                .await;
            match scheduled {
                Ok(retry_id) => {
                    self.logger
                        .info(
                            "retry_scheduled",
                            "webhook scheduled for retry",
                            LogContext::new(correlation_id)
                                .event_type(&event.event_type)
                                .meta("retry_id", &retry_id),
                        )
                        .await;
                    return WebhookOutcome::RetryScheduled { retry_id };
                }
                Err(schedule_err) => {
                    tracing::error!(
                        correlation_id,
                        event_id = %event.id,
                        error = %schedule_err,
                        "failed to schedule retry, dead-lettering"
                    );
                }
            }
        }

        let added = self
            .dlq
            .add_to_dlq(NewDeadLetter {
                event: event.clone(),
                error: err.to_string(),
                retry_count: 0,
                correlation_id: correlation_id.to_string(),
                headers: headers.clone(),
                processing_time_ms,
                last_retry_at: None,
                next_retry_at: None,
            })
            .await;
        match added {
            Ok(dlq_id) => {
                self.logger
                    .error(
                        "dead_lettered",
                        "webhook moved to dead-letter queue",
                        LogContext::new(correlation_id)
                            .event_type(&event.event_type)
                            .meta("dlq_id", &dlq_id),
                    )
                    .await;
                WebhookOutcome::DeadLettered { dlq_id }
            }
            Err(dlq_err) => {
                self.logger
                    .error(
                        "dead_letter_failed",
                        "webhook could not be retried or dead-lettered",
                        LogContext::new(correlation_id)
                            .event_type(&event.event_type)
                            .error("DlqError", dlq_err.to_string()),
                    )
                    .await;
                WebhookOutcome::Failed
            }
        }
    }

    /// Drains ready retries through the same idempotency and timeout path as
    /// fresh deliveries.
    pub async fn process_pending_retries(
        &self,
        processor: Arc<dyn EventProcessor>,
    ) -> Result<RetryRunStats, PipelineError> {
        let stats = self
            .retries
            .process_pending_retries(|entry| {
                let processor = Arc::clone(&processor);
                async move {
                    let started = Instant::now();
                    match self
                        .attempt(&entry.event, &entry.correlation_id, processor, started)
                        .await
                    {
                        Attempt::Succeeded | Attempt::Duplicate(_) => Ok(()),
                        Attempt::Rejected(message) => Err(message),
                        Attempt::Exhausted(err) | Attempt::Failed(err) => Err(err.to_string()),
                    }
                }
            })
            .await?;
        Ok(stats)
    }

    /// Resets idempotency for a dead-lettered event and processes it again.
    pub async fn replay_failed_webhook(
        &self,
        dlq_id: &str,
        processor: Arc<dyn EventProcessor>,
    ) -> Result<ReplayResponse, PipelineError> {
        let entry = self
            .dlq
            .get_dlq_entry(dlq_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("dead letter {dlq_id}")))?;

        self.idempotency.reset(&entry.event.id).await?;
        self.logger
            .info(
                "replay_started",
                "replaying dead-lettered webhook",
                LogContext::new(&entry.correlation_id)
                    .event_type(&entry.event.event_type)
                    .meta("dlq_id", dlq_id),
            )
            .await;

        let started = Instant::now();
        let attempt = self
            .attempt(&entry.event, &entry.correlation_id, processor, started)
            .await;

        let (removed, success, outcome, error) = match attempt {
            Attempt::Succeeded => {
                let removed = self.dlq.remove_from_dlq(dlq_id).await?;
                (removed, true, WebhookOutcome::Processed, None)
            }
            Attempt::Duplicate(reason) => (false, true, WebhookOutcome::Duplicate { reason }, None),
            Attempt::Rejected(message) => (false, false, invalid_event(), Some(message)),
            Attempt::Exhausted(err) | Attempt::Failed(err) => {
                self.dlq
                    .update_retry_info(
                        dlq_id,
                        entry.retry_count + 1,
                        now_millis(),
                        None,
                        Some(err.to_string()),
                    )
                    .await?;
                (false, false, WebhookOutcome::Failed, Some(err.to_string()))
            }
        };

        Ok(ReplayResponse {
            dlq_id: dlq_id.to_string(),
            removed,
            result: ProcessingResult {
                success,
                correlation_id: entry.correlation_id,
                processing_time_ms: elapsed_ms(started),
                event_id: Some(entry.event.id),
                event_type: Some(entry.event.event_type),
                user_id: entry.event.user_id,
                error,
                outcome,
            },
        })
    }

    pub async fn retry_all_failed_webhooks(
        &self,
        processor: Arc<dyn EventProcessor>,
    ) -> Result<RetryAllResponse, PipelineError> {
        let entries = self
            .dlq
            .get_dlq_entries(self.dlq.config().max_size, 0)
            .await?;

        let mut response = RetryAllResponse::default();
        for entry in entries {
            response.attempted += 1;
            match self
                .replay_failed_webhook(&entry.id, Arc::clone(&processor))
                .await
            {
                Ok(replay) if replay.result.success => response.succeeded += 1,
                Ok(_) => response.failed += 1,
                Err(err) => {
                    tracing::warn!(dlq_id = %entry.id, error = %err, "replay failed");
                    response.failed += 1;
                }
            }
        }

        tracing::info!(
            attempted = response.attempted,
            succeeded = response.succeeded,
            failed = response.failed,
            "dead-letter replay finished"
        );
        Ok(response)
    }

    pub async fn clear_dead_letter_queue(&self, filter: &DlqFilter) -> Result<u64, PipelineError> {
        Ok(self.dlq.clear_dlq(filter).await?)
    }

    pub async fn get_processing_stats(&self) -> Result<ProcessingStats, PipelineError> {
        Ok(ProcessingStats {
            idempotency: self
                .idempotency
                .get_stats()
                .await
                .map_err(PipelineError::from)?,
            retries: self.retries.get_retry_stats().await?,
            dead_letters: self.dlq.get_dlq_stats().await?,
            logs: self
                .logger
                .get_log_stats()
                .await
                .map_err(|err| PipelineError::StoreUnavailable(err.to_string()))?,
            circuit: self.breaker().snapshot(),
        })
    }

    /// Runs every component's cleanup. A failing component reports zero and
    /// does not stop the others.
    pub async fn cleanup_old_data(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        match self.idempotency.cleanup_expired_records().await {
            Ok(removed) => report.idempotency_records = removed,
            Err(err) => tracing::warn!(error = %err, "idempotency cleanup failed"),
        }
        match self.dlq.cleanup_old_entries().await {
            Ok(removed) => report.dead_letters = removed,
            Err(err) => tracing::warn!(error = %err, "dead-letter cleanup failed"),
        }
        match self.logger.cleanup_old_logs().await {
            Ok(removed) => report.logs = removed,
            Err(err) => tracing::warn!(error = %err, "log cleanup failed"),
        }

        report
    }

    pub async fn get_health_status(&self) -> HealthStatus {
        let circuit = self.breaker().snapshot();
        let mut components = BTreeMap::new();

        components.insert("verifier".to_string(), self.verifier.health());

        let store = match (self.store.ping().await, circuit.state) {
            (Ok(()), CircuitStatus::Closed) => component(HealthLevel::Healthy, self.store.backend()),
            (Ok(()), _) => component(HealthLevel::Degraded, "circuit recovering"),
            (Err(StoreError::CircuitOpen { retry_in_ms }), _) => component(
                HealthLevel::Unhealthy,
                format!("circuit open, retry in {retry_in_ms} ms"),
            ),
            (Err(err), _) => component(HealthLevel::Unhealthy, err.to_string()),
        };
        components.insert("store".to_string(), store);

        let dlq = match self.dlq.ping().await {
            Ok(_) if !self.dlq.is_enabled() => component(HealthLevel::Degraded, "disabled"),
            Ok(size) if size as usize > self.dlq.config().warn_threshold => {
                component(HealthLevel::Degraded, format!("{size} entries"))
            }
            Ok(size) => component(HealthLevel::Healthy, format!("{size} entries")),
            Err(err) => component(HealthLevel::Unhealthy, err.to_string()),
        };
        components.insert("dead_letter_queue".to_string(), dlq);

        let retries = match self.retries.backlog().await {
            Ok(backlog) => component(HealthLevel::Healthy, format!("{backlog} pending")),
            Err(err) => component(HealthLevel::Unhealthy, err.to_string()),
        };
        components.insert("retry_scheduler".to_string(), retries);

        let logger = match self.logger.ping().await {
            Ok(_) => component(HealthLevel::Healthy, "persisting"),
            Err(err) => component(HealthLevel::Degraded, err.to_string()),
        };
        components.insert("logger".to_string(), logger);

        let status = components
            .values()
            .map(|health| health.status)
            .fold(HealthLevel::Healthy, worst);

        HealthStatus {
            status,
            checked_at: now_millis(),
            components,
            circuit,
        }
    }
}

fn invalid_event() -> WebhookOutcome {
    WebhookOutcome::Rejected {
        reason: RejectionReason::InvalidEvent,
    }
}

fn component(status: HealthLevel, detail: impl Into<String>) -> ComponentHealth {
    ComponentHealth {
        status,
        detail: Some(detail.into()),
    }
}

fn worst(a: HealthLevel, b: HealthLevel) -> HealthLevel {
    match (a, b) {
        (HealthLevel::Unhealthy, _) | (_, HealthLevel::Unhealthy) => HealthLevel::Unhealthy,
        (HealthLevel::Degraded, _) | (_, HealthLevel::Degraded) => HealthLevel::Degraded,
        _ => HealthLevel::Healthy,
    }
}

fn failure_code(err: &PipelineError) -> &'static str {
    match err {
        PipelineError::ProcessingTimeout { .. } => "PROCESSING_TIMEOUT",
        PipelineError::MaxAttemptsExceeded { .. } => "MAX_ATTEMPTS_EXCEEDED",
        PipelineError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
        _ => "PROCESSING_ERROR",
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    started.elapsed().as_millis() as i64
}

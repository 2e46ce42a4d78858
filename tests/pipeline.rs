#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::{
    DownStore, counting_processor, identity_body, orchestrator, setup_store, signed_request,
    test_config, verifier,
};
use webhook_pipeline::{
    config::SweeperConfig,
    dlq::DlqFilter,
    error::PipelineError,
    orchestrator::WebhookOrchestrator,
    processor::{EventProcessor, ProcessorError},
    sweeper::Sweeper,
    types::{
        ComponentHealth, HealthLevel, IdempotencyStatus, RejectionReason, WebhookEvent, WebhookOutcome,
        WebhookRequest,
    },
    verifier::{SvixVerifier, VerificationError, Verifier},
};

/// Fails the first `failures` calls, then succeeds.
fn flaky_processor(failures: u32) -> (Arc<dyn EventProcessor>, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let processor: Arc<dyn EventProcessor> =
        Arc::new(move |_event: WebhookEvent, _correlation_id: String| {
            let counter = Arc::clone(&counter);
            async move {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                if call < failures {
                    Err(ProcessorError::failed("downstream unavailable"))
                } else {
                    Ok(true)
                }
            }
        });
    (processor, calls)
}

fn slow_processor(delay: Duration) -> Arc<dyn EventProcessor> {
    Arc::new(move |_event: WebhookEvent, _correlation_id: String| async move {
        tokio::time::sleep(delay).await;
        Ok::<bool, ProcessorError>(true)
    })
}

fn request(msg_id: &str) -> WebhookRequest {
    signed_request(msg_id, &identity_body("user.created", "user_42"))
}

fn retry_id(outcome: &WebhookOutcome) -> String {
    match outcome {
        WebhookOutcome::RetryScheduled { retry_id } => retry_id.clone(),
        other => panic!("expected a scheduled retry, got {other:?}"),
    }
}

fn dlq_id(outcome: &WebhookOutcome) -> String {
    match outcome {
        WebhookOutcome::DeadLettered { dlq_id } => dlq_id.clone(),
        other => panic!("expected a dead letter, got {other:?}"),
    }
}

#[tokio::test]
async fn redelivered_event_is_processed_once() {
    let db = setup_store().await;
    let pipeline = orchestrator(&db, test_config());
    let (processor, calls) = counting_processor(Ok(true));

    let first = pipeline
        .process_webhook(&request("msg_dup"), Arc::clone(&processor))
        .await;
    assert!(first.success);
    assert_eq!(first.outcome, WebhookOutcome::Processed);
    assert_eq!(first.event_id.as_deref(), Some("msg_dup"));
    assert_eq!(first.event_type.as_deref(), Some("user.created"));
    assert_eq!(first.user_id.as_deref(), Some("user_42"));

    let second = pipeline
        .process_webhook(&request("msg_dup"), Arc::clone(&processor))
        .await;
    assert!(second.success);
    assert_eq!(
        second.outcome,
        WebhookOutcome::Duplicate {
            reason: "already processed successfully".to_string()
        }
    );
    assert_ne!(first.correlation_id, second.correlation_id);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let record = pipeline
        .idempotency()
        .get_record("msg_dup")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, IdempotencyStatus::Completed);
}

#[tokio::test]
async fn concurrent_deliveries_run_the_processor_once() {
    let db = setup_store().await;
    let pipeline = Arc::new(orchestrator(&db, test_config()));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let processor: Arc<dyn EventProcessor> =
        Arc::new(move |_event: WebhookEvent, _correlation_id: String| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<bool, ProcessorError>(true)
            }
        });

    let req = request("msg_race");
    let mut handles = Vec::new();
    for _ in 0..5 {
        let pipeline = Arc::clone(&pipeline);
        let processor = Arc::clone(&processor);
        let req = req.clone();
        handles.push(tokio::spawn(async move {
            pipeline.process_webhook(&req, processor).await
        }));
    }

    let mut processed = 0;
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.success);
        match result.outcome {
            WebhookOutcome::Processed => processed += 1,
            WebhookOutcome::Duplicate { .. } => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(processed, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bad_signature_is_rejected_before_processing() {
    let db = setup_store().await;
    let pipeline = orchestrator(&db, test_config());
    let (processor, calls) = counting_processor(Ok(true));

    let mut req = request("msg_forged");
    req.body = identity_body("user.deleted", "user_42");

    let result = pipeline.process_webhook(&req, processor).await;
    assert!(!result.success);
    assert_eq!(
        result.outcome,
        WebhookOutcome::Rejected {
            reason: RejectionReason::Verification
        }
    );
    assert!(result.event_id.is_none());
    assert!(result.error.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failure_is_retried_and_then_succeeds() {
    let db = setup_store().await;
    let pipeline = orchestrator(&db, test_config());
    let (processor, calls) = flaky_processor(1);

    let first = pipeline
        .process_webhook(&request("msg_flaky"), Arc::clone(&processor))
        .await;
    assert!(!first.success);
    assert_eq!(first.error.as_deref(), Some("downstream unavailable"));
    let retry_id = retry_id(&first.outcome);

    let entry = pipeline.retries().get_retry_entry(&retry_id).await.unwrap().unwrap();
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.correlation_id, first.correlation_id);
    assert!(entry.headers.contains_key("svix-signature"));

    pipeline.retries().retry_now(&retry_id).await.unwrap();
    let stats = pipeline
        .process_pending_retries(Arc::clone(&processor))
        .await
        .unwrap();
    assert_eq!(stats.successful, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(pipeline.retries().get_retry_entry(&retry_id).await.unwrap().is_none());

    let record = pipeline
        .idempotency()
        .get_record("msg_flaky")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, IdempotencyStatus::Completed);
    assert_eq!(record.attempts, 2);

    let again = pipeline.process_webhook(&request("msg_flaky"), processor).await;
    assert!(matches!(again.outcome, WebhookOutcome::Duplicate { .. }));
}

#[tokio::test]
async fn persistent_failure_ends_in_the_dead_letter_queue() {
    let db = setup_store().await;
    let pipeline = orchestrator(&db, test_config());
    let (processor, calls) = counting_processor(Err("always broken"));

    let first = pipeline
        .process_webhook(&request("msg_doomed"), Arc::clone(&processor))
        .await;
    let retry_id = retry_id(&first.outcome);

    for _ in 0..5 {
        pipeline.retries().retry_now(&retry_id).await.unwrap();
        pipeline
            .process_pending_retries(Arc::clone(&processor))
            .await
            .unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert!(pipeline.retries().get_retry_entry(&retry_id).await.unwrap().is_none());

    let letters = pipeline.dlq().get_dlq_entries(10, 0).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].retry_count, 5);
    assert_eq!(letters[0].event.id, "msg_doomed");
    assert!(letters[0].error.starts_with("Max retries exceeded (5)"));

    let record = pipeline
        .idempotency()
        .get_record("msg_doomed")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.attempts, 6);
    assert!(record.is_exhausted());

    // Provider redeliveries of an exhausted event are acknowledged, not re-queued.
    for _ in 0..2 {
        let redelivered = pipeline
            .process_webhook(&request("msg_doomed"), Arc::clone(&processor))
            .await;
        assert!(redelivered.success);
        assert_eq!(
            redelivered.outcome,
            WebhookOutcome::Duplicate {
                reason: "maximum attempts exceeded".to_string()
            }
        );
    }
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(pipeline.dlq().get_dlq_entries(10, 0).await.unwrap().len(), 1);
    assert!(pipeline.retries().get_retry_entries(10).await.unwrap().is_empty());

    // Replaying resets idempotency and clears the dead letter on success.
    let (healthy, healthy_calls) = counting_processor(Ok(true));
    let replay = pipeline
        .replay_failed_webhook(&letters[0].id, healthy)
        .await
        .unwrap();
    assert!(replay.removed);
    assert!(replay.result.success);
    assert_eq!(replay.result.outcome, WebhookOutcome::Processed);
    assert_eq!(healthy_calls.load(Ordering::SeqCst), 1);
    assert!(pipeline.dlq().get_dlq_entries(10, 0).await.unwrap().is_empty());
    assert!(pipeline.retries().get_retry_entries(10).await.unwrap().is_empty());

    let (processor, _) = counting_processor(Ok(true));
    let missing = pipeline
        .replay_failed_webhook(&letters[0].id, processor)
        .await
        .unwrap_err();
    assert!(matches!(missing, PipelineError::NotFound(_)));
}

#[tokio::test]
async fn failed_replay_records_the_attempt() {
    let db = setup_store().await;
    let mut config = test_config();
    config.orchestrator.enable_retries = false;
    let pipeline = orchestrator(&db, config);
    let (processor, _) = counting_processor(Ok(false));

    let result = pipeline
        .process_webhook(&request("msg_replay"), Arc::clone(&processor))
        .await;
    assert_eq!(result.error.as_deref(), Some("processor reported failure"));
    let dlq_id = dlq_id(&result.outcome);

    let replay = pipeline
        .replay_failed_webhook(&dlq_id, processor)
        .await
        .unwrap();
    assert!(!replay.removed);
    assert!(!replay.result.success);
    assert_eq!(replay.result.outcome, WebhookOutcome::Failed);

    let entry = pipeline.dlq().get_dlq_entry(&dlq_id).await.unwrap().unwrap();
    assert_eq!(entry.retry_count, 1);
    assert!(entry.last_retry_at.is_some());
    assert_eq!(entry.error, "processor reported failure");
}

#[tokio::test]
async fn retries_disabled_dead_letters_immediately() {
    let db = setup_store().await;
    let mut config = test_config();
    config.orchestrator.enable_retries = false;
    let pipeline = orchestrator(&db, config);
    let (processor, _) = counting_processor(Err("nope"));

    let result = pipeline.process_webhook(&request("msg_no_retry"), processor).await;
    let dlq_id = dlq_id(&result.outcome);

    let entry = pipeline.dlq().get_dlq_entry(&dlq_id).await.unwrap().unwrap();
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.error, "nope");
    assert_eq!(
        entry.headers.get("svix-id").map(String::as_str),
        Some("msg_no_retry")
    );
    assert!(pipeline.retries().get_retry_entries(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn slow_processor_times_out_into_a_retry() {
    let db = setup_store().await;
    let mut config = test_config();
    config.orchestrator.processing_timeout = Duration::from_millis(50);
    let pipeline = orchestrator(&db, config);

    let result = pipeline
        .process_webhook(
            &request("msg_slow"),
            slow_processor(Duration::from_millis(500)),
        )
        .await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("processing timed out after 50 ms"));
    retry_id(&result.outcome);

    let record = pipeline
        .idempotency()
        .get_record("msg_slow")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, IdempotencyStatus::Failed);
    assert_eq!(record.error.unwrap().code, "PROCESSING_TIMEOUT");
}

#[tokio::test]
async fn store_outage_degrades_without_blocking() {
    let pipeline = WebhookOrchestrator::new(test_config(), Arc::new(DownStore::new()), verifier());

    let (ok, ok_calls) = counting_processor(Ok(true));
    let processed = pipeline.process_webhook(&request("msg_down_ok"), ok).await;
    assert!(processed.success);
    assert_eq!(processed.outcome, WebhookOutcome::Processed);
    assert_eq!(ok_calls.load(Ordering::SeqCst), 1);

    let (broken, _) = counting_processor(Err("broken"));
    let failed = pipeline
        .process_webhook(&request("msg_down_fail"), broken)
        .await;
    assert!(!failed.success);
    assert_eq!(failed.outcome, WebhookOutcome::Failed);

    let health = pipeline.get_health_status().await;
    assert_eq!(health.status, HealthLevel::Unhealthy);
    assert_eq!(health.components["store"].status, HealthLevel::Unhealthy);
}

#[tokio::test]
async fn retry_all_replays_every_dead_letter() {
    let db = setup_store().await;
    let mut config = test_config();
    config.orchestrator.enable_retries = false;
    let pipeline = orchestrator(&db, config);

    let (broken, _) = counting_processor(Err("broken"));
    for msg_id in ["msg_a", "msg_b", "msg_c"] {
        pipeline
            .process_webhook(&request(msg_id), Arc::clone(&broken))
            .await;
    }
    assert_eq!(pipeline.dlq().get_dlq_stats().await.unwrap().total_entries, 3);

    let (healthy, calls) = counting_processor(Ok(true));
    let response = pipeline.retry_all_failed_webhooks(healthy).await.unwrap();
    assert_eq!(response.attempted, 3);
    assert_eq!(response.succeeded, 3);
    assert_eq!(response.failed, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(pipeline.dlq().get_dlq_stats().await.unwrap().total_entries, 0);
}

#[tokio::test]
async fn stats_health_and_clear() {
    let db = setup_store().await;
    let mut config = test_config();
    config.orchestrator.enable_retries = false;
    let pipeline = orchestrator(&db, config);

    let (ok, _) = counting_processor(Ok(true));
    let (broken, _) = counting_processor(Err("broken"));
    pipeline.process_webhook(&request("msg_ok"), ok).await;
    pipeline.process_webhook(&request("msg_bad"), broken).await;

    let stats = pipeline.get_processing_stats().await.unwrap();
    assert_eq!(stats.idempotency.completed, 1);
    assert_eq!(stats.idempotency.failed, 1);
    assert_eq!(stats.dead_letters.total_entries, 1);
    assert!(stats.logs.total_logs > 0);
    assert!(stats.logs.error_rate > 0.0);

    let health = pipeline.get_health_status().await;
    assert_eq!(health.status, HealthLevel::Healthy);
    for name in ["verifier", "store", "dead_letter_queue", "retry_scheduler", "logger"] {
        assert!(health.components.contains_key(name), "missing {name}");
    }

    let cleared = pipeline
        .clear_dead_letter_queue(&DlqFilter {
            event_type: Some("user.created".to_string()),
            older_than: None,
        })
        .await
        .unwrap();
    assert_eq!(cleared, 1);

    let report = pipeline.cleanup_old_data().await;
    assert_eq!(report.dead_letters, 0);
}

#[tokio::test]
async fn delivery_is_traceable_by_correlation_id() {
    let db = setup_store().await;
    let pipeline = orchestrator(&db, test_config());
    let (processor, _) = counting_processor(Err("broken"));

    let result = pipeline.process_webhook(&request("msg_trace"), processor).await;
    let trace = pipeline
        .logger()
        .get_logs_by_correlation_id(&result.correlation_id)
        .await
        .unwrap();
    let operations: Vec<_> = trace.iter().map(|e| e.operation.as_str()).collect();
    assert_eq!(
        operations,
        vec!["webhook_received", "processing_failed", "retry_scheduled"]
    );
}

#[tokio::test]
async fn sweeper_drains_due_retries_in_the_background() {
    let db = setup_store().await;
    let pipeline = Arc::new(orchestrator(&db, test_config()));
    let (processor, calls) = flaky_processor(1);

    let first = pipeline
        .process_webhook(&request("msg_swept"), Arc::clone(&processor))
        .await;
    let retry_id = retry_id(&first.outcome);
    pipeline.retries().retry_now(&retry_id).await.unwrap();

    let sweeper = Sweeper::start(
        Arc::clone(&pipeline),
        Arc::clone(&processor),
        SweeperConfig {
            retry_interval: Duration::from_millis(50),
            cleanup_interval: Duration::from_secs(3600),
        },
    );

    let mut drained = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if pipeline.retries().get_retry_entry(&retry_id).await.unwrap().is_none() {
            drained = true;
            break;
        }
    }
    sweeper.shutdown().await;

    assert!(drained, "retry was never processed");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Verifies like the bundled verifier but reports a rotating key.
struct RotatingKeyVerifier(Arc<SvixVerifier>);

impl Verifier for RotatingKeyVerifier {
    fn verify_webhook(&self, request: &WebhookRequest) -> Result<WebhookEvent, VerificationError> {
        self.0.verify_webhook(request)
    }

    fn health(&self) -> ComponentHealth {
        ComponentHealth {
            status: HealthLevel::Degraded,
            detail: Some("signing key rotation in progress".to_string()),
        }
    }
}

#[tokio::test]
async fn health_reports_what_the_verifier_says() {
    let db = setup_store().await;
    let healthy = orchestrator(&db, test_config()).get_health_status().await;
    assert_eq!(healthy.components["verifier"].status, HealthLevel::Healthy);
    assert_eq!(healthy.status, HealthLevel::Healthy);

    let pipeline = WebhookOrchestrator::new(
        test_config(),
        db.store.clone(),
        Arc::new(RotatingKeyVerifier(verifier())),
    );
    let health = pipeline.get_health_status().await;
    assert_eq!(health.components["verifier"].status, HealthLevel::Degraded);
    assert_eq!(
        health.components["verifier"].detail.as_deref(),
        Some("signing key rotation in progress")
    );
    assert_eq!(health.status, HealthLevel::Degraded);

    let (processor, _) = counting_processor(Ok(true));
    let result = pipeline.process_webhook(&request("msg_rotating"), processor).await;
    assert_eq!(result.outcome, WebhookOutcome::Processed);
}

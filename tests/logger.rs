#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{DownStore, setup_store};
use webhook_pipeline::{
    circuit::CircuitBreaker,
    config::{CircuitConfig, LoggerConfig},
    logger::{LogContext, LogQuery, WebhookLogger},
    store::GuardedStore,
    types::LogLevel,
};

#[tokio::test]
async fn correlation_trace_reads_oldest_first() {
    let db = setup_store().await;
    let logger = WebhookLogger::new(db.guarded(), LoggerConfig::default());

    logger
        .info("webhook_received", "received", LogContext::new("corr-1"))
        .await
        .unwrap();
    logger
        .info("other", "unrelated", LogContext::new("corr-2"))
        .await
        .unwrap();
    logger
        .warn(
            "processing_failed",
            "processor failed",
            LogContext::new("corr-1")
                .event_type("user.created")
                .error("ProcessingError", "boom"),
        )
        .await
        .unwrap();
    logger
        .info(
            "retry_scheduled",
            "scheduled",
            LogContext::new("corr-1").meta("retry_count", 0).duration_ms(7),
        )
        .await
        .unwrap();

    let trace = logger.get_logs_by_correlation_id("corr-1").await.unwrap();
    let operations: Vec<_> = trace.iter().map(|e| e.operation.as_str()).collect();
    assert_eq!(
        operations,
        vec!["webhook_received", "processing_failed", "retry_scheduled"]
    );
    assert_eq!(trace[1].level, LogLevel::Warn);
    assert_eq!(trace[1].event_type.as_deref(), Some("user.created"));
    assert_eq!(trace[1].error.as_ref().unwrap().message, "boom");
    assert_eq!(
        trace[2].metadata.as_ref().unwrap().get("retry_count").map(String::as_str),
        Some("0")
    );
    assert_eq!(trace[2].source, LoggerConfig::default().source);
}

#[tokio::test]
async fn query_filters_by_level_and_operation() {
    let db = setup_store().await;
    let logger = WebhookLogger::new(db.guarded(), LoggerConfig::default());

    for i in 0..3 {
        logger
            .info("webhook_processed", &format!("ok {i}"), LogContext::new(format!("c{i}")))
            .await
            .unwrap();
    }
    logger
        .error(
            "webhook_failed",
            "failed",
            LogContext::new("c9").error("ProcessingError", "boom"),
        )
        .await
        .unwrap();

    let errors = logger.get_error_logs(10).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].operation, "webhook_failed");

    let processed = logger
        .query_logs(&LogQuery {
            operation: Some("webhook_processed".to_string()),
            limit: 2,
            offset: 1,
            ..LogQuery::default()
        })
        .await
        .unwrap();
    let messages: Vec<_> = processed.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["ok 1", "ok 0"]);

    let none_in_future = logger
        .query_logs(&LogQuery {
            start_time: Some(i64::MAX),
            ..LogQuery::default()
        })
        .await
        .unwrap();
    assert!(none_in_future.is_empty());

    let recent = logger.get_recent_logs(2).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].operation, "webhook_failed");
}

#[tokio::test]
async fn stats_report_error_rate_and_durations() {
    let db = setup_store().await;
    let logger = WebhookLogger::new(db.guarded(), LoggerConfig::default());

    logger
        .info("op", "fast", LogContext::new("a").duration_ms(10))
        .await
        .unwrap();
    logger
        .info("op", "slow", LogContext::new("b").duration_ms(30))
        .await
        .unwrap();
    logger.debug("op", "noise", LogContext::new("c")).await.unwrap();
    logger
        .error("op", "broken", LogContext::new("d").error("Error", "x"))
        .await
        .unwrap();

    let stats = logger.get_log_stats().await.unwrap();
    assert_eq!(stats.total_logs, 4);
    assert_eq!(stats.by_level.get("info"), Some(&2));
    assert_eq!(stats.by_operation.get("op"), Some(&4));
    assert_eq!(stats.average_duration_ms, 20.0);
    assert_eq!(stats.error_rate, 0.25);
    assert_eq!(stats.recent_errors.len(), 1);
}

#[tokio::test]
async fn lists_are_capped() {
    let db = setup_store().await;
    let logger = WebhookLogger::new(
        db.guarded(),
        LoggerConfig {
            max_entries: 3,
            max_per_correlation: 2,
            ..LoggerConfig::default()
        },
    );

    for i in 0..5 {
        logger
            .info("op", &format!("m{i}"), LogContext::new("same"))
            .await
            .unwrap();
    }

    assert_eq!(logger.get_recent_logs(10).await.unwrap().len(), 3);
    let trace = logger.get_logs_by_correlation_id("same").await.unwrap();
    let messages: Vec<_> = trace.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["m3", "m4"]);
}

#[tokio::test]
async fn cleanup_removes_expired_entries() {
    let db = setup_store().await;
    let logger = WebhookLogger::new(
        db.guarded(),
        LoggerConfig {
            retention: Duration::from_millis(100),
            ..LoggerConfig::default()
        },
    );

    logger.info("op", "old", LogContext::new("x")).await.unwrap();
    logger.info("op", "older", LogContext::new("y")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(logger.cleanup_old_logs().await.unwrap(), 2);
    assert!(logger.get_recent_logs(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn entries_trimmed_from_the_global_list_leave_no_index_rows() {
    let db = setup_store().await;
    let store = db.guarded();
    let logger = WebhookLogger::new(
        store.clone(),
        LoggerConfig {
            max_entries: 2,
            ..LoggerConfig::default()
        },
    );

    for i in 0..50 {
        logger
            .info("webhook_received", "received", LogContext::new(format!("delivery-{i}")))
            .await
            .unwrap();
    }

    let correlation_keys = store.keys("webhook:logs:correlation:").await.unwrap();
    assert_eq!(correlation_keys.len(), 2);
    assert_eq!(store.llen("webhook:logs:operation:webhook_received").await.unwrap(), 2);
    assert_eq!(store.llen("webhook:logs:level:info").await.unwrap(), 2);
    assert_eq!(store.keys("webhook:logs:entry:").await.unwrap().len(), 2);
    assert!(
        logger
            .get_logs_by_correlation_id("delivery-0")
            .await
            .unwrap()
            .is_empty()
    );

    logger.cleanup_old_logs().await.unwrap();
    assert_eq!(store.keys("webhook:logs:correlation:").await.unwrap().len(), 2);
}

#[tokio::test]
async fn cleanup_sweeps_index_rows_of_expired_entries() {
    let db = setup_store().await;
    let store = db.guarded();
    let logger = WebhookLogger::new(
        store.clone(),
        LoggerConfig {
            retention: Duration::from_millis(100),
            ..LoggerConfig::default()
        },
    );

    for i in 0..5 {
        logger
            .info("op", "short-lived", LogContext::new(format!("delivery-{i}")))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(logger.cleanup_old_logs().await.unwrap(), 5);
    assert!(store.keys("webhook:logs:").await.unwrap().is_empty());
}

#[tokio::test]
async fn store_outage_never_fails_the_caller() {
    let store = GuardedStore::new(
        Arc::new(DownStore::new()),
        Arc::new(CircuitBreaker::new(CircuitConfig::default())),
    );
    let logger = WebhookLogger::new(store, LoggerConfig::default());

    let id = logger
        .error("op", "store is down", LogContext::new("corr"))
        .await;
    assert!(id.is_none());
    assert!(logger.get_recent_logs(10).await.is_err());
}

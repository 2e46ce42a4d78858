//! Background retry and cleanup loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::config::SweeperConfig;
use crate::orchestrator::WebhookOrchestrator;
use crate::processor::EventProcessor;

/// Handle to the running sweep tasks. Dropping it leaves them running;
/// call [`Sweeper::shutdown`] to stop them.
pub struct Sweeper {
    cancellation_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Sweeper {
    pub fn start(
        orchestrator: Arc<WebhookOrchestrator>,
        processor: Arc<dyn EventProcessor>,
        config: SweeperConfig,
    ) -> Self {
        let cancellation_token = CancellationToken::new();

        let retry_task = tokio::spawn(retry_loop(
            Arc::clone(&orchestrator),
            processor,
            config.retry_interval,
            cancellation_token.clone(),
        ));
        let cleanup_task = tokio::spawn(cleanup_loop(
            orchestrator,
            config.cleanup_interval,
            cancellation_token.clone(),
        ));

        tracing::info!(
            retry_interval_ms = config.retry_interval.as_millis() as u64,
            cleanup_interval_ms = config.cleanup_interval.as_millis() as u64,
            "sweepers started"
        );

        Self {
            cancellation_token,
            tasks: vec![retry_task, cleanup_task],
        }
    }

    /// Signals both loops and waits for the sweep in progress to finish.
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "sweeper task ended abnormally");
            }
        }
        tracing::info!("sweepers stopped");
    }
}

async fn retry_loop(
    orchestrator: Arc<WebhookOrchestrator>,
    processor: Arc<dyn EventProcessor>,
    period: Duration,
    cancellation_token: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancellation_token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(err) = orchestrator
            .process_pending_retries(Arc::clone(&processor))
            .await
        {
            tracing::error!(error = %err, "retry sweep failed");
        }
    }
}

async fn cleanup_loop(
    orchestrator: Arc<WebhookOrchestrator>,
    period: Duration,
    cancellation_token: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancellation_token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let report = orchestrator.cleanup_old_data().await;
        tracing::info!(
            idempotency_records = report.idempotency_records,
            dead_letters = report.dead_letters,
            logs = report.logs,
            "cleanup sweep finished"
        );
    }
}

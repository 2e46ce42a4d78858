//! Per-event idempotency records.
//!
//! A record keyed by the provider's event id decides whether a delivery may be
//! processed. Claims are taken with set-if-absent on a short-lived lease key,
//! so concurrent deliveries of the same event produce exactly one processing
//! attempt while the lease is held. A crash after the claim lets the event be
//! processed again once the lease expires: the guarantee is at-least-once.

use std::collections::BTreeMap;

use thiserror::Error;
use uuid::Uuid;

use crate::config::IdempotencyConfig;
use crate::now_millis;
use crate::store::{Command, GuardedStore, StoreError};
use crate::types::{
    IdempotencyCheck, IdempotencyRecord, IdempotencyStats, IdempotencyStatus, RecordError,
};

const RECORD_PREFIX: &str = "webhook:idempotency:record:";
const LEASE_PREFIX: &str = "webhook:idempotency:lease:";
const INDEX_KEY: &str = "webhook:idempotency:index";

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("event {event_id} is a duplicate: {reason}")]
    DuplicateEvent { event_id: String, reason: String },
    #[error("event {event_id} is already being processed")]
    ProcessingInProgress {
        event_id: String,
        retry_after_ms: Option<i64>,
    },
    #[error("event {event_id} exhausted {attempts} processing attempts")]
    MaxAttemptsExceeded { event_id: String, attempts: u32 },
    #[error("idempotency store error: {0}")]
    Store(#[from] StoreError),
    #[error("idempotency record is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid event id: {0}")]
    InvalidEventId(String),
    #[error("no idempotency record for event {0}")]
    RecordNotFound(String),
}

impl IdempotencyError {
    pub fn code(&self) -> &'static str {
        match self {
            IdempotencyError::DuplicateEvent { .. } => "DUPLICATE_EVENT",
            IdempotencyError::ProcessingInProgress { .. } => "PROCESSING_IN_PROGRESS",
            IdempotencyError::MaxAttemptsExceeded { .. } => "MAX_ATTEMPTS_EXCEEDED",
            IdempotencyError::Store(_) | IdempotencyError::Serialization(_) => "REDIS_ERROR",
            IdempotencyError::InvalidEventId(_) => "INVALID_EVENT_ID",
            IdempotencyError::RecordNotFound(_) => "RECORD_NOT_FOUND",
        }
    }

    /// Whether the caller should treat this as "already handled".
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            IdempotencyError::DuplicateEvent { .. }
                | IdempotencyError::ProcessingInProgress { .. }
                | IdempotencyError::MaxAttemptsExceeded { .. }
        )
    }
}

pub struct IdempotencyTracker {
    store: GuardedStore,
    config: IdempotencyConfig,
}

impl IdempotencyTracker {
    pub fn new(store: GuardedStore, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Decides whether `event_id` may be processed.
    ///
    /// Store failures fail open: the check reports `can_process = true` so an
    /// unavailable store never blocks valid traffic, at the cost of possible
    /// duplicate processing while it is down.
    pub async fn check_idempotency(
        &self,
        event_id: &str,
        event_type: &str,
        correlation_id: &str,
    ) -> Result<IdempotencyCheck, IdempotencyError> {
        self.validate_event_id(event_id)?;

        match self.evaluate(event_id).await {
            Ok(check) => {
                tracing::debug!(
                    event_id,
                    event_type,
                    correlation_id,
                    can_process = check.can_process,
                    reason = check.reason.as_deref().unwrap_or("new event"),
                    "idempotency check"
                );
                Ok(check)
            }
            Err(err) => {
                tracing::warn!(
                    event_id,
                    event_type,
                    correlation_id,
                    error = %err,
                    "idempotency check failed, allowing processing"
                );
                Ok(IdempotencyCheck {
                    is_duplicate: false,
                    can_process: true,
                    record: None,
                    reason: Some(format!("idempotency store unavailable: {err}")),
                    retry_after_ms: None,
                })
            }
        }
    }

    /// Claims `event_id` and writes a `processing` record with one more attempt.
    pub async fn start_processing(
        &self,
        event_id: &str,
        event_type: &str,
        correlation_id: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<IdempotencyRecord, IdempotencyError> {
        self.validate_event_id(event_id)?;

        let check = self.evaluate(event_id).await?;
        if !check.can_process {
            return Err(rejection(event_id, &check));
        }

        let lease_key = lease_key(event_id);
        let claimed = self
            .store
            .set_nx(&lease_key, correlation_id, Some(self.config.lease_ttl))
            .await?;
        if !claimed {
            return Err(IdempotencyError::ProcessingInProgress {
                event_id: event_id.to_string(),
                retry_after_ms: Some(self.config.lease_ttl.as_millis() as i64),
            });
        }

        // Another instance may have finished between the check and the claim.
        let current = match self.load(event_id).await {
            Ok(current) => current,
            Err(err) => {
                self.release_lease(event_id).await;
                return Err(err);
            }
        };
        if let Some(record) = &current {
            let blocked = match record.status {
                IdempotencyStatus::Completed => true,
                IdempotencyStatus::Failed => record.is_exhausted(),
                IdempotencyStatus::Processing => record.is_exhausted(),
            };
            if blocked {
                self.release_lease(event_id).await;
                let check = self.classify(record.clone()).await;
                return Err(rejection(event_id, &check));
            }
        }

        let now = now_millis();
        let record = match current {
            Some(previous) => {
                let mut merged = previous.metadata;
                merged.extend(metadata);
                IdempotencyRecord {
                    correlation_id: correlation_id.to_string(),
                    status: IdempotencyStatus::Processing,
                    attempts: previous.attempts.saturating_add(1),
                    max_attempts: self.config.max_attempts,
                    updated_at: now,
                    metadata: merged,
                    ..previous
                }
            }
            None => IdempotencyRecord {
                id: Uuid::new_v4().to_string(),
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                correlation_id: correlation_id.to_string(),
                status: IdempotencyStatus::Processing,
                attempts: 1,
                max_attempts: self.config.max_attempts,
                created_at: now,
                updated_at: now,
                completed_at: None,
                result: None,
                error: None,
                metadata,
            },
        };

        if let Err(err) = self.persist(&record, false).await {
            self.release_lease(event_id).await;
            return Err(err);
        }

        tracing::debug!(
            event_id,
            correlation_id,
            attempts = record.attempts,
            "idempotency claim taken"
        );
        Ok(record)
    }

    pub async fn mark_completed(
        &self,
        event_id: &str,
        result: Option<String>,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Result<IdempotencyRecord, IdempotencyError> {
        let mut record = self
            .load(event_id)
            .await?
            .ok_or_else(|| IdempotencyError::RecordNotFound(event_id.to_string()))?;

        let now = now_millis();
        record.status = IdempotencyStatus::Completed;
        record.updated_at = now;
        record.completed_at = Some(now);
        record.result = result;
        record.error = None;
        if let Some(metadata) = metadata {
            record.metadata.extend(metadata);
        }

        self.persist(&record, true).await?;
        Ok(record)
    }

    /// Records a failed attempt. The record becomes terminal once
    /// `attempts >= max_attempts`; before that a later delivery may retry it.
    pub async fn mark_failed(
        &self,
        event_id: &str,
        error: RecordError,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Result<IdempotencyRecord, IdempotencyError> {
        let mut record = self
            .load(event_id)
            .await?
            .ok_or_else(|| IdempotencyError::RecordNotFound(event_id.to_string()))?;

        record.status = IdempotencyStatus::Failed;
        record.updated_at = now_millis();
        record.error = Some(error);
        if let Some(metadata) = metadata {
            record.metadata.extend(metadata);
        }

        self.persist(&record, true).await?;

        if record.is_exhausted() {
            tracing::warn!(
                event_id,
                attempts = record.attempts,
                "idempotency record reached max attempts"
            );
        }
        Ok(record)
    }

    pub async fn get_record(
        &self,
        event_id: &str,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        self.load(event_id).await
    }

    /// Forgets everything about `event_id` so it can be processed afresh.
    pub async fn reset(&self, event_id: &str) -> Result<(), IdempotencyError> {
        self.store
            .pipeline(vec![
                Command::del(record_key(event_id)),
                Command::del(lease_key(event_id)),
                Command::srem(INDEX_KEY, event_id),
            ])
            .await?;
        Ok(())
    }

    /// Drops index entries whose record expired or outlived the record TTL.
    pub async fn cleanup_expired_records(&self) -> Result<u64, IdempotencyError> {
        let cutoff = now_millis() - self.config.record_ttl.as_millis() as i64;
        let mut removed = 0;

        for event_id in self.store.smembers(INDEX_KEY).await? {
            let stale = match self.load(&event_id).await {
                Ok(None) => true,
                Ok(Some(record)) => record.updated_at < cutoff,
                Err(IdempotencyError::Serialization(_)) => true,
                Err(err) => return Err(err),
            };
            if stale {
                self.store
                    .pipeline(vec![
                        Command::del(record_key(&event_id)),
                        Command::srem(INDEX_KEY, &event_id),
                    ])
                    .await?;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "cleaned up expired idempotency records");
        }
        Ok(removed)
    }

    pub async fn get_stats(&self) -> Result<IdempotencyStats, IdempotencyError> {
        let mut stats = IdempotencyStats::default();
        for event_id in self.store.smembers(INDEX_KEY).await? {
            let Ok(Some(record)) = self.load(&event_id).await else {
                continue;
            };
            stats.tracked += 1;
            match record.status {
                IdempotencyStatus::Processing => stats.processing += 1,
                IdempotencyStatus::Completed => stats.completed += 1,
                IdempotencyStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn evaluate(&self, event_id: &str) -> Result<IdempotencyCheck, IdempotencyError> {
        match self.load(event_id).await? {
            None => Ok(IdempotencyCheck {
                is_duplicate: false,
                can_process: true,
                record: None,
                reason: None,
                retry_after_ms: None,
            }),
            Some(record) => Ok(self.classify(record).await),
        }
    }

    async fn classify(&self, record: IdempotencyRecord) -> IdempotencyCheck {
        let duplicate = |record: IdempotencyRecord, reason: &str, retry_after_ms| IdempotencyCheck {
            is_duplicate: true,
            can_process: false,
            record: Some(record),
            reason: Some(reason.to_string()),
            retry_after_ms,
        };
        let retryable = |record: IdempotencyRecord, reason: &str| IdempotencyCheck {
            is_duplicate: true,
            can_process: true,
            record: Some(record),
            reason: Some(reason.to_string()),
            retry_after_ms: None,
        };

        match record.status {
            IdempotencyStatus::Processing => {
                // An unreadable lease counts as held; processing twice is worse than waiting.
                let lease = self
                    .store
                    .pttl(&lease_key(&record.event_id))
                    .await
                    .map(|remaining| remaining.map(|left| left.as_millis() as i64))
                    .unwrap_or(Some(self.config.lease_ttl.as_millis() as i64));
                match lease {
                    Some(remaining) => {
                        duplicate(record, "event is currently being processed", Some(remaining))
                    }
                    None if record.is_exhausted() => {
                        duplicate(record, "maximum attempts exceeded", None)
                    }
                    None => retryable(record, "previous processing claim expired"),
                }
            }
            IdempotencyStatus::Completed => {
                duplicate(record, "already processed successfully", None)
            }
            IdempotencyStatus::Failed if record.is_exhausted() => {
                duplicate(record, "maximum attempts exceeded", None)
            }
            IdempotencyStatus::Failed => retryable(record, "retrying previously failed event"),
        }
    }

    async fn load(&self, event_id: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        match self.store.get(&record_key(event_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn persist(
        &self,
        record: &IdempotencyRecord,
        release_lease: bool,
    ) -> Result<(), IdempotencyError> {
        let body = serde_json::to_string(record)?;
        let mut commands = vec![
            Command::set(
                record_key(&record.event_id),
                body,
                Some(self.config.record_ttl),
            ),
            Command::sadd(INDEX_KEY, &record.event_id),
        ];
        if release_lease {
            commands.push(Command::del(lease_key(&record.event_id)));
        }
        self.store.pipeline(commands).await?;
        Ok(())
    }

    async fn release_lease(&self, event_id: &str) {
        if let Err(err) = self.store.del(&lease_key(event_id)).await {
            tracing::warn!(event_id, error = %err, "failed to release idempotency lease");
        }
    }

    fn validate_event_id(&self, event_id: &str) -> Result<(), IdempotencyError> {
        let trimmed = event_id.trim();
        if trimmed.is_empty() {
            return Err(IdempotencyError::InvalidEventId(
                "event id must be non-empty".to_string(),
            ));
        }
        if trimmed.len() != event_id.len() || event_id.len() > self.config.max_event_id_len {
            return Err(IdempotencyError::InvalidEventId(format!(
                "event id must be at most {} characters without surrounding whitespace",
                self.config.max_event_id_len
            )));
        }
        Ok(())
    }
}

fn record_key(event_id: &str) -> String {
    format!("{RECORD_PREFIX}{event_id}")
}

fn lease_key(event_id: &str) -> String {
    format!("{LEASE_PREFIX}{event_id}")
}

fn rejection(event_id: &str, check: &IdempotencyCheck) -> IdempotencyError {
    let reason = check.reason.clone().unwrap_or_default();
    match &check.record {
        Some(record) if record.status != IdempotencyStatus::Completed && record.is_exhausted() => {
            IdempotencyError::MaxAttemptsExceeded {
                event_id: event_id.to_string(),
                attempts: record.attempts,
            }
        }
        Some(record) if record.status == IdempotencyStatus::Processing => {
            IdempotencyError::ProcessingInProgress {
                event_id: event_id.to_string(),
                retry_after_ms: check.retry_after_ms,
            }
        }
        _ => IdempotencyError::DuplicateEvent {
            event_id: event_id.to_string(),
            reason,
        },
    }
}

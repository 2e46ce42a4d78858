//! Exponential-backoff retry scheduling.
//!
//! Entries are JSON bodies keyed by retry id, indexed in a sorted set scored by
//! `next_retry_at`. A sweep claims each ready entry with a set-if-absent lease
//! so concurrent sweepers never process the same entry twice, and the
//! scheduler alone promotes exhausted entries to the dead-letter queue.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::dlq::{DeadLetterQueue, DlqError, NewDeadLetter};
use crate::now_millis;
use crate::store::{Command, GuardedStore, StoreError};
use crate::types::{RetryEntry, RetryPolicy, RetryRunStats, RetryStats, WebhookEvent};

const QUEUE_KEY: &str = "webhook:retry:queue";
const ENTRY_PREFIX: &str = "webhook:retry:entry:";
const LEASE_PREFIX: &str = "webhook:retry:processing:";
const SCHEDULED_KEY: &str = "webhook:retry:stats:scheduled";
const SUCCEEDED_KEY: &str = "webhook:retry:stats:succeeded";
const DEAD_LETTERED_KEY: &str = "webhook:retry:stats:dead_lettered";

const ENTRY_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const JITTER_FACTOR: f64 = 0.25;

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("retry entry {0} not found")]
    NotFound(String),
    #[error("retry store error: {0}")]
    Store(#[from] StoreError),
    #[error("retry entry is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("dead-letter promotion failed: {0}")]
    DeadLetter(#[from] DlqError),
}

/// Input to [`RetryScheduler::schedule_retry`].
#[derive(Debug, Clone)]
pub struct NewRetry {
    pub event: WebhookEvent,
    pub error: String,
    pub correlation_id: String,
    pub headers: BTreeMap<String, String>,
    pub processing_time_ms: Option<i64>,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay_ms: config.base_delay.as_millis() as u64,
            max_delay_ms: config.max_delay.as_millis() as u64,
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }
}

pub fn compute_backoff(config: &RetryConfig, retry_count: u32) -> Duration {
    policy_backoff(&RetryPolicy::from(config), retry_count)
}

/// Delay before attempt `retry_count + 1`:
/// `min(base * multiplier^retry_count, max_delay)`, optionally jittered by
/// ±25% and clamped back into `[0, max_delay]`.
pub fn policy_backoff(policy: &RetryPolicy, retry_count: u32) -> Duration {
    let exponent = retry_count.min(64) as i32;
    let raw_ms = policy.base_delay_ms as f64 * policy.multiplier.powi(exponent);
    let max_ms = policy.max_delay_ms as f64;
    let capped_ms = if raw_ms.is_finite() { raw_ms.min(max_ms) } else { max_ms };

    let delay_ms = if policy.jitter && capped_ms > 0.0 {
        let spread = capped_ms * JITTER_FACTOR;
        let offset = rand::rng().random_range(-spread..=spread);
        (capped_ms + offset).clamp(0.0, max_ms)
    } else {
        capped_ms
    };

    Duration::from_millis(delay_ms.round() as u64)
}

pub struct RetryScheduler {
    store: GuardedStore,
    config: RetryConfig,
    dlq: Arc<DeadLetterQueue>,
}

impl RetryScheduler {
    pub fn new(store: GuardedStore, config: RetryConfig, dlq: Arc<DeadLetterQueue>) -> Self {
        Self { store, config, dlq }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub async fn schedule_retry(&self, retry: NewRetry) -> Result<String, RetryError> {
        self.schedule_retry_with(retry, &self.config).await
    }

    /// Schedules with a per-call policy. The entry keeps `max_retries` and the
    /// backoff settings, so later attempts follow the same policy.
    pub async fn schedule_retry_with(
        &self,
        retry: NewRetry,
        config: &RetryConfig,
    ) -> Result<String, RetryError> {
        let now = now_millis();
        let policy = RetryPolicy::from(config);
        let entry = RetryEntry {
            id: Uuid::new_v4().to_string(),
            event: retry.event,
            retry_count: 0,
            max_retries: config.max_retries,
            next_retry_at: now + policy_backoff(&policy, 0).as_millis() as i64,
            last_retry_at: None,
            last_error: Some(retry.error),
            correlation_id: retry.correlation_id,
            created_at: now,
            processing_time_ms: retry.processing_time_ms,
            headers: retry.headers,
            policy,
        };

        self.store
            .pipeline(vec![
                Command::set(entry_key(&entry.id), serde_json::to_string(&entry)?, Some(ENTRY_TTL)),
                Command::zadd(QUEUE_KEY, &entry.id, entry.next_retry_at as f64),
                Command::incr(SCHEDULED_KEY),
            ])
            .await?;

        tracing::info!(
            retry_id = %entry.id,
            event_id = %entry.event.id,
            correlation_id = %entry.correlation_id,
            next_retry_at = entry.next_retry_at,
            "retry scheduled"
        );
        Ok(entry.id)
    }

    /// Runs `handler` over up to `batch_size` ready entries.
    ///
    /// `handler` returns `Err(message)` when the attempt failed.
    pub async fn process_pending_retries<F, Fut>(
        &self,
        handler: F,
    ) -> Result<RetryRunStats, RetryError>
    where
        F: Fn(RetryEntry) -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        let mut stats = RetryRunStats::default();
        let ready = self
            .store
            .zrange_by_score(QUEUE_KEY, 0.0, now_millis() as f64, Some(self.config.batch_size))
            .await?;

        for member in ready {
            let id = member.member;
            let claimed = self
                .store
                .set_nx(&lease_key(&id), "1", Some(self.config.lease_ttl))
                .await?;
            if !claimed {
                stats.skipped += 1;
                continue;
            }

            let entry = match self.load(&id).await {
                Ok(Some(entry)) => entry,
                Ok(None) | Err(RetryError::Serialization(_)) => {
                    self.store
                        .pipeline(vec![Command::zrem(QUEUE_KEY, &id), Command::del(lease_key(&id))])
                        .await?;
                    stats.skipped += 1;
                    continue;
                }
                Err(err) => {
                    self.release_lease(&id).await;
                    return Err(err);
                }
            };

            stats.processed += 1;
            match handler(entry.clone()).await {
                Ok(()) => {
                    self.store
                        .pipeline(vec![
                            Command::del(entry_key(&id)),
                            Command::zrem(QUEUE_KEY, &id),
                            Command::del(lease_key(&id)),
                            Command::incr(SUCCEEDED_KEY),
                        ])
                        .await?;
                    stats.successful += 1;
                    tracing::info!(
                        retry_id = %id,
                        event_id = %entry.event.id,
                        retry_count = entry.retry_count,
                        "retry succeeded"
                    );
                }
                Err(message) => match self.handle_failure(entry, message).await {
                    Ok(true) => stats.dead_lettered += 1,
                    Ok(false) => stats.failed += 1,
                    Err(err) => {
                        tracing::error!(retry_id = %id, error = %err, "failed to record retry failure");
                        self.release_lease(&id).await;
                        stats.failed += 1;
                    }
                },
            }
        }

        if stats.processed > 0 || stats.skipped > 0 {
            tracing::info!(
                processed = stats.processed,
                successful = stats.successful,
                failed = stats.failed,
                dead_lettered = stats.dead_lettered,
                skipped = stats.skipped,
                "retry sweep finished"
            );
        }
        Ok(stats)
    }

    /// Returns `true` when the entry was promoted to the dead-letter queue.
    async fn handle_failure(&self, mut entry: RetryEntry, message: String) -> Result<bool, RetryError> {
        let now = now_millis();
        let attempts = entry.retry_count + 1;

        if attempts >= entry.max_retries {
            let promoted = self
                .dlq
                .add_to_dlq(NewDeadLetter {
                    event: entry.event.clone(),
                    error: format!("Max retries exceeded ({attempts}): {message}"),
                    retry_count: attempts,
                    correlation_id: entry.correlation_id.clone(),
                    headers: entry.headers.clone(),
                    processing_time_ms: entry.processing_time_ms,
                    last_retry_at: Some(now),
                    next_retry_at: None,
                })
                .await;
            match promoted {
                Ok(_) => {}
                Err(DlqError::Disabled) => {
                    tracing::error!(
                        retry_id = %entry.id,
                        event_id = %entry.event.id,
                        "retries exhausted and dead-letter queue disabled, dropping event"
                    );
                }
                Err(err) => return Err(err.into()),
            }
            self.store
                .pipeline(vec![
                    Command::del(entry_key(&entry.id)),
                    Command::zrem(QUEUE_KEY, &entry.id),
                    Command::del(lease_key(&entry.id)),
                    Command::incr(DEAD_LETTERED_KEY),
                ])
                .await?;
            return Ok(true);
        }

        entry.retry_count = attempts;
        entry.last_retry_at = Some(now);
        entry.last_error = Some(message);
        entry.next_retry_at = now + policy_backoff(&entry.policy, attempts).as_millis() as i64;

        self.store
            .pipeline(vec![
                Command::set(entry_key(&entry.id), serde_json::to_string(&entry)?, Some(ENTRY_TTL)),
                Command::zadd(QUEUE_KEY, &entry.id, entry.next_retry_at as f64),
                Command::del(lease_key(&entry.id)),
            ])
            .await?;

        tracing::warn!(
            retry_id = %entry.id,
            event_id = %entry.event.id,
            retry_count = entry.retry_count,
            next_retry_at = entry.next_retry_at,
            "retry failed, rescheduled"
        );
        Ok(false)
    }

    pub async fn get_ready_retries(&self, limit: usize) -> Result<Vec<RetryEntry>, RetryError> {
        let members = self
            .store
            .zrange_by_score(QUEUE_KEY, 0.0, now_millis() as f64, Some(limit))
            .await?;
        self.load_members(members.into_iter().map(|m| m.member)).await
    }

    /// Entries ordered by next attempt time.
    pub async fn get_retry_entries(&self, limit: usize) -> Result<Vec<RetryEntry>, RetryError> {
        let members = self.store.zrange(QUEUE_KEY, 0, limit).await?;
        self.load_members(members.into_iter().map(|m| m.member)).await
    }

    pub async fn get_retry_entry(&self, id: &str) -> Result<Option<RetryEntry>, RetryError> {
        self.load(id).await
    }

    pub async fn remove_retry_entry(&self, id: &str) -> Result<bool, RetryError> {
        let replies = self
            .store
            .pipeline(vec![
                Command::del(entry_key(id)),
                Command::zrem(QUEUE_KEY, id),
                Command::del(lease_key(id)),
            ])
            .await?;
        let mut removed = false;
        for reply in replies.into_iter().take(2) {
            removed |= reply.into_bool("DEL")?;
        }
        Ok(removed)
    }

    /// Makes an entry due immediately.
    pub async fn retry_now(&self, id: &str) -> Result<(), RetryError> {
        let mut entry = self
            .load(id)
            .await?
            .ok_or_else(|| RetryError::NotFound(id.to_string()))?;
        entry.next_retry_at = now_millis();
        self.store
            .pipeline(vec![
                Command::set(entry_key(id), serde_json::to_string(&entry)?, Some(ENTRY_TTL)),
                Command::zadd(QUEUE_KEY, id, entry.next_retry_at as f64),
            ])
            .await?;
        Ok(())
    }

    pub async fn clear_retry_queue(&self) -> Result<u64, RetryError> {
        let total = self.store.zcard(QUEUE_KEY).await? as usize;
        let members = self.store.zrange(QUEUE_KEY, 0, total).await?;

        let mut commands = Vec::with_capacity(members.len() * 2 + 1);
        for member in &members {
            commands.push(Command::del(entry_key(&member.member)));
            commands.push(Command::del(lease_key(&member.member)));
        }
        commands.push(Command::del(QUEUE_KEY));
        self.store.pipeline(commands).await?;

        tracing::info!(cleared = members.len(), "retry queue cleared");
        Ok(members.len() as u64)
    }

    pub async fn get_retry_stats(&self) -> Result<RetryStats, RetryError> {
        let now = now_millis();
        let total = self.store.zcard(QUEUE_KEY).await? as usize;
        let entries = self.get_retry_entries(total).await?;

        let mut stats = RetryStats {
            total_entries: entries.len() as u64,
            total_scheduled: self.counter(SCHEDULED_KEY).await?,
            total_succeeded: self.counter(SUCCEEDED_KEY).await?,
            total_dead_lettered: self.counter(DEAD_LETTERED_KEY).await?,
            ..RetryStats::default()
        };

        let mut delay_sum = 0i64;
        for entry in &entries {
            if entry.next_retry_at <= now {
                stats.ready_entries += 1;
            }
            *stats.by_retry_count.entry(entry.retry_count).or_default() += 1;
            delay_sum += entry.next_retry_at - entry.last_retry_at.unwrap_or(entry.created_at);
            stats.oldest_entry_at = Some(
                stats
                    .oldest_entry_at
                    .map_or(entry.created_at, |oldest| oldest.min(entry.created_at)),
            );
        }
        if !entries.is_empty() {
            stats.average_delay_ms = delay_sum as f64 / entries.len() as f64;
        }
        Ok(stats)
    }

    pub(crate) async fn backlog(&self) -> Result<u64, RetryError> {
        Ok(self.store.zcard(QUEUE_KEY).await?)
    }

    async fn load_members(
        &self,
        ids: impl Iterator<Item = String>,
    ) -> Result<Vec<RetryEntry>, RetryError> {
        let mut entries = Vec::new();
        for id in ids {
            match self.load(&id).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) | Err(RetryError::Serialization(_)) => {
                    tracing::debug!(retry_id = %id, "dropping orphaned retry queue member");
                    self.store.zrem(QUEUE_KEY, &id).await?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(entries)
    }

    async fn load(&self, id: &str) -> Result<Option<RetryEntry>, RetryError> {
        match self.store.get(&entry_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn counter(&self, key: &str) -> Result<i64, RetryError> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }

    async fn release_lease(&self, id: &str) {
        if let Err(err) = self.store.del(&lease_key(id)).await {
            tracing::warn!(retry_id = id, error = %err, "failed to release retry lease");
        }
    }
}

fn entry_key(id: &str) -> String {
    format!("{ENTRY_PREFIX}{id}")
}

fn lease_key(id: &str) -> String {
    format!("{LEASE_PREFIX}{id}")
}

//! Dead-letter queue for events that exhausted their retries.
//!
//! Ids live in a newest-first list; each entry body is a separate key with a
//! retention TTL. Bodies may expire before their id leaves the list, so readers
//! drop dangling ids as they find them.

use std::collections::BTreeMap;

use thiserror::Error;
use uuid::Uuid;

use crate::config::DlqConfig;
use crate::now_millis;
use crate::store::{Command, GuardedStore, StoreError};
use crate::types::{DeadLetterEntry, DlqStats, WebhookEvent};

const LIST_KEY: &str = "webhook:dlq:list";
const ENTRY_PREFIX: &str = "webhook:dlq:entry:";
const SIZE_WARNINGS_KEY: &str = "webhook:dlq:stats:size_warnings";
const TOTAL_ADDED_KEY: &str = "webhook:dlq:stats:total_added";

#[derive(Debug, Error)]
pub enum DlqError {
    #[error("dead-letter queue is disabled")]
    Disabled,
    #[error("dead letter {0} not found")]
    NotFound(String),
    #[error("dead-letter store error: {0}")]
    Store(#[from] StoreError),
    #[error("dead letter is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Input to [`DeadLetterQueue::add_to_dlq`].
#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub event: WebhookEvent,
    pub error: String,
    pub retry_count: u32,
    pub correlation_id: String,
    pub headers: BTreeMap<String, String>,
    pub processing_time_ms: Option<i64>,
    pub last_retry_at: Option<i64>,
    pub next_retry_at: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub event_type: Option<String>,
    /// Epoch millis; only entries dead-lettered before this match.
    pub older_than: Option<i64>,
}

impl DlqFilter {
    fn matches(&self, entry: &DeadLetterEntry) -> bool {
        let type_matches = self
            .event_type
            .as_deref()
            .is_none_or(|event_type| entry.event.event_type == event_type);
        let age_matches = self
            .older_than
            .is_none_or(|cutoff| entry.timestamp < cutoff);
        type_matches && age_matches
    }
}

pub struct DeadLetterQueue {
    store: GuardedStore,
    config: DlqConfig,
}

impl DeadLetterQueue {
    pub fn new(store: GuardedStore, config: DlqConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn add_to_dlq(&self, letter: NewDeadLetter) -> Result<String, DlqError> {
        if !self.config.enabled {
            return Err(DlqError::Disabled);
        }

        let entry = DeadLetterEntry {
            id: Uuid::new_v4().to_string(),
            event: letter.event,
            error: letter.error,
            timestamp: now_millis(),
            retry_count: letter.retry_count,
            correlation_id: letter.correlation_id,
            headers: letter.headers,
            processing_time_ms: letter.processing_time_ms,
            last_retry_at: letter.last_retry_at,
            next_retry_at: letter.next_retry_at,
        };
        let body = serde_json::to_string(&entry)?;

        self.store
            .pipeline(vec![
                Command::set(entry_key(&entry.id), body, Some(self.config.retention)),
                Command::lpush(LIST_KEY, &entry.id),
                Command::incr(TOTAL_ADDED_KEY),
            ])
            .await?;

        // The entry is stored; size bookkeeping must not fail the insert.
        if let Err(err) = self.enforce_size_limits().await {
            tracing::warn!(dlq_id = %entry.id, error = %err, "failed to enforce dead-letter size limits");
        }

        tracing::error!(
            dlq_id = %entry.id,
            event_id = %entry.event.id,
            event_type = %entry.event.event_type,
            correlation_id = %entry.correlation_id,
            retry_count = entry.retry_count,
            error = %entry.error,
            "event moved to dead-letter queue"
        );
        Ok(entry.id)
    }

    /// Newest first.
    pub async fn get_dlq_entries(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DeadLetterEntry>, DlqError> {
        let ids = self.store.lrange(LIST_KEY, offset, limit).await?;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&id).await? {
                Some(entry) => entries.push(entry),
                None => self.drop_dangling(&id).await,
            }
        }
        Ok(entries)
    }

    pub async fn get_dlq_entry(&self, id: &str) -> Result<Option<DeadLetterEntry>, DlqError> {
        self.load(id).await
    }

    pub async fn remove_from_dlq(&self, id: &str) -> Result<bool, DlqError> {
        let replies = self
            .store
            .pipeline(vec![Command::del(entry_key(id)), Command::lrem(LIST_KEY, id)])
            .await?;
        let mut removed = false;
        for reply in replies {
            removed |= reply.into_bool("DEL")?;
        }
        Ok(removed)
    }

    pub async fn update_retry_info(
        &self,
        id: &str,
        retry_count: u32,
        last_retry_at: i64,
        next_retry_at: Option<i64>,
        error: Option<String>,
    ) -> Result<DeadLetterEntry, DlqError> {
        let mut entry = self
            .load(id)
            .await?
            .ok_or_else(|| DlqError::NotFound(id.to_string()))?;

        entry.retry_count = retry_count;
        entry.last_retry_at = Some(last_retry_at);
        entry.next_retry_at = next_retry_at;
        if let Some(error) = error {
            entry.error = error;
        }

        let body = serde_json::to_string(&entry)?;
        self.store
            .set(&entry_key(id), &body, Some(self.config.retention))
            .await?;
        Ok(entry)
    }

    pub async fn get_dlq_stats(&self) -> Result<DlqStats, DlqError> {
        let entries = self.all_entries().await?;
        let mut stats = DlqStats {
            total_entries: entries.len() as u64,
            size_warnings: self.counter(SIZE_WARNINGS_KEY).await?,
            total_added: self.counter(TOTAL_ADDED_KEY).await?,
            ..DlqStats::default()
        };

        let mut timed = 0u64;
        let mut total_time = 0i64;
        for entry in &entries {
            *stats
                .by_event_type
                .entry(entry.event.event_type.clone())
                .or_default() += 1;
            *stats.by_retry_count.entry(entry.retry_count).or_default() += 1;
            if let Some(ms) = entry.processing_time_ms {
                timed += 1;
                total_time += ms;
            }
            stats.oldest_entry_at = Some(
                stats
                    .oldest_entry_at
                    .map_or(entry.timestamp, |oldest| oldest.min(entry.timestamp)),
            );
            stats.newest_entry_at = Some(
                stats
                    .newest_entry_at
                    .map_or(entry.timestamp, |newest| newest.max(entry.timestamp)),
            );
        }
        if timed > 0 {
            stats.average_processing_time_ms = total_time as f64 / timed as f64;
        }
        Ok(stats)
    }

    /// Removes entries older than the retention window and ids whose body expired.
    pub async fn cleanup_old_entries(&self) -> Result<u64, DlqError> {
        let cutoff = now_millis() - self.config.retention.as_millis() as i64;
        let mut removed = 0;

        for id in self.all_ids().await? {
            match self.load(&id).await {
                Ok(Some(entry)) if entry.timestamp >= cutoff => {}
                Ok(_) | Err(DlqError::Serialization(_)) => {
                    self.remove_from_dlq(&id).await?;
                    removed += 1;
                }
                Err(err) => return Err(err),
            }
        }

        if removed > 0 {
            tracing::info!(removed, "cleaned up old dead letters");
        }
        Ok(removed)
    }

    pub async fn clear_dlq(&self, filter: &DlqFilter) -> Result<u64, DlqError> {
        let mut cleared = 0;
        for entry in self.all_entries().await? {
            if filter.matches(&entry) && self.remove_from_dlq(&entry.id).await? {
                cleared += 1;
            }
        }
        tracing::info!(
            cleared,
            event_type = filter.event_type.as_deref().unwrap_or("*"),
            older_than = filter.older_than,
            "dead-letter queue cleared"
        );
        Ok(cleared)
    }

    pub(crate) async fn ping(&self) -> Result<u64, DlqError> {
        Ok(self.store.llen(LIST_KEY).await?)
    }

    async fn all_ids(&self) -> Result<Vec<String>, DlqError> {
        let len = self.store.llen(LIST_KEY).await? as usize;
        Ok(self.store.lrange(LIST_KEY, 0, len).await?)
    }

    async fn all_entries(&self) -> Result<Vec<DeadLetterEntry>, DlqError> {
        let len = self.store.llen(LIST_KEY).await? as usize;
        self.get_dlq_entries(len, 0).await
    }

    async fn enforce_size_limits(&self) -> Result<(), DlqError> {
        let len = self.store.llen(LIST_KEY).await? as usize;
        if len > self.config.max_size {
            self.evict_beyond(self.config.max_size, len).await?;
        }
        if len > self.config.warn_threshold {
            if let Err(err) = self.store.incr(SIZE_WARNINGS_KEY).await {
                tracing::warn!(error = %err, "failed to record dead-letter size warning");
            }
            tracing::warn!(
                size = len,
                threshold = self.config.warn_threshold,
                "dead-letter queue above warning threshold"
            );
        }
        Ok(())
    }

    async fn evict_beyond(&self, max_size: usize, len: usize) -> Result<(), DlqError> {
        let evicted = self.store.lrange(LIST_KEY, max_size, len - max_size).await?;
        let mut commands = vec![Command::ltrim(LIST_KEY, max_size)];
        commands.extend(evicted.iter().map(|id| Command::del(entry_key(id))));
        self.store.pipeline(commands).await?;
        tracing::warn!(
            evicted = evicted.len(),
            max_size,
            "evicted oldest dead letters"
        );
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<DeadLetterEntry>, DlqError> {
        match self.store.get(&entry_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn counter(&self, key: &str) -> Result<i64, DlqError> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }

    async fn drop_dangling(&self, id: &str) {
        if let Err(err) = self.store.lrem(LIST_KEY, id).await {
            tracing::debug!(dlq_id = id, error = %err, "failed to drop dangling dead-letter id");
        }
    }
}

fn entry_key(id: &str) -> String {
    format!("{ENTRY_PREFIX}{id}")
}

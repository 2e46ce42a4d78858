//! Queryable webhook log.
//!
//! Entries are persisted with a retention TTL and indexed by correlation id,
//! operation and level in capped newest-first lists. Writing never fails the
//! caller: a store failure is reported through `tracing` and `log` returns
//! `None`.

use std::collections::BTreeMap;

use thiserror::Error;
use uuid::Uuid;

use crate::config::LoggerConfig;
use crate::now_millis;
use crate::store::{Command, GuardedStore, StoreError};
use crate::types::{LogEntry, LogError, LogLevel, LogStats};

const ENTRY_PREFIX: &str = "webhook:logs:entry:";
const ALL_KEY: &str = "webhook:logs:all";
const CORRELATION_PREFIX: &str = "webhook:logs:correlation:";
const OPERATION_PREFIX: &str = "webhook:logs:operation:";
const LEVEL_PREFIX: &str = "webhook:logs:level:";
const RECENT_ERRORS: usize = 10;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("log store error: {0}")]
    Store(#[from] StoreError),
    #[error("log entry is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default)]
pub struct LogContext {
    pub correlation_id: String,
    pub event_type: Option<String>,
    pub user_id: Option<String>,
    pub metadata: Option<BTreeMap<String, String>>,
    pub duration_ms: Option<i64>,
    pub error: Option<LogError>,
}

impl LogContext {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ..Self::default()
        }
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.to_string());
        self
    }

    pub fn duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn error(mut self, name: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(LogError {
            name: name.into(),
            message: message.into(),
            stack: None,
        });
        self
    }
}

#[derive(Debug, Clone)]
pub struct LogQuery {
    pub correlation_id: Option<String>,
    pub level: Option<LogLevel>,
    pub operation: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            correlation_id: None,
            level: None,
            operation: None,
            start_time: None,
            end_time: None,
            limit: 100,
            offset: 0,
        }
    }
}

impl LogQuery {
    fn matches(&self, entry: &LogEntry) -> bool {
        self.correlation_id
            .as_deref()
            .is_none_or(|id| entry.correlation_id == id)
            && self.level.is_none_or(|level| entry.level == level)
            && self
                .operation
                .as_deref()
                .is_none_or(|operation| entry.operation == operation)
            && self.start_time.is_none_or(|start| entry.timestamp >= start)
            && self.end_time.is_none_or(|end| entry.timestamp <= end)
    }

    /// The narrowest index that can answer this query.
    fn index(&self) -> String {
        if let Some(id) = &self.correlation_id {
            correlation_key(id)
        } else if let Some(operation) = &self.operation {
            operation_key(operation)
        } else if let Some(level) = self.level {
            level_key(level)
        } else {
            ALL_KEY.to_string()
        }
    }
}

pub struct WebhookLogger {
    store: GuardedStore,
    config: LoggerConfig,
}

impl WebhookLogger {
    pub fn new(store: GuardedStore, config: LoggerConfig) -> Self {
        Self { store, config }
    }

    pub async fn log(
        &self,
        level: LogLevel,
        operation: &str,
        message: &str,
        context: LogContext,
    ) -> Option<String> {
        let entry = LogEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            level,
            correlation_id: context.correlation_id,
            event_type: context.event_type,
            user_id: context.user_id,
            operation: operation.to_string(),
            message: message.to_string(),
            metadata: context.metadata,
            duration_ms: context.duration_ms,
            error: context.error,
            source: self.config.source.clone(),
        };
        emit(&entry);

        match self.persist(&entry).await {
            Ok(()) => Some(entry.id),
            Err(err) => {
                tracing::error!(
                    correlation_id = %entry.correlation_id,
                    operation = %entry.operation,
                    error = %err,
                    "failed to persist webhook log entry"
                );
                None
            }
        }
    }

    pub async fn debug(&self, operation: &str, message: &str, context: LogContext) -> Option<String> {
        self.log(LogLevel::Debug, operation, message, context).await
    }

    pub async fn info(&self, operation: &str, message: &str, context: LogContext) -> Option<String> {
        self.log(LogLevel::Info, operation, message, context).await
    }

    pub async fn warn(&self, operation: &str, message: &str, context: LogContext) -> Option<String> {
        self.log(LogLevel::Warn, operation, message, context).await
    }

    pub async fn error(&self, operation: &str, message: &str, context: LogContext) -> Option<String> {
        self.log(LogLevel::Error, operation, message, context).await
    }

    /// Newest first.
    pub async fn query_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>, LoggerError> {
        let ids = self.store.lrange(&query.index(), 0, self.config.max_entries).await?;

        let mut matched = Vec::new();
        let mut skipped = 0;
        for id in ids {
            let Some(entry) = self.load(&id).await? else {
                continue;
            };
            if !query.matches(&entry) {
                continue;
            }
            if skipped < query.offset {
                skipped += 1;
                continue;
            }
            matched.push(entry);
            if matched.len() >= query.limit {
                break;
            }
        }
        Ok(matched)
    }

    /// The full trace for one delivery, oldest first.
    pub async fn get_logs_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<LogEntry>, LoggerError> {
        let mut entries = self
            .query_logs(&LogQuery {
                correlation_id: Some(correlation_id.to_string()),
                limit: self.config.max_per_correlation,
                ..LogQuery::default()
            })
            .await?;
        entries.reverse();
        Ok(entries)
    }

    pub async fn get_error_logs(&self, limit: usize) -> Result<Vec<LogEntry>, LoggerError> {
        self.query_logs(&LogQuery {
            level: Some(LogLevel::Error),
            limit,
            ..LogQuery::default()
        })
        .await
    }

    pub async fn get_recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>, LoggerError> {
        self.query_logs(&LogQuery {
            limit,
            ..LogQuery::default()
        })
        .await
    }

    pub async fn get_log_stats(&self) -> Result<LogStats, LoggerError> {
        let entries = self.get_recent_logs(self.config.max_entries).await?;
        let mut stats = LogStats {
            total_logs: entries.len() as u64,
            ..LogStats::default()
        };

        let mut timed = 0u64;
        let mut duration_sum = 0i64;
        let mut errors = 0u64;
        for entry in &entries {
            *stats.by_level.entry(entry.level.as_str().to_string()).or_default() += 1;
            *stats.by_operation.entry(entry.operation.clone()).or_default() += 1;
            *stats.by_source.entry(entry.source.clone()).or_default() += 1;
            if let Some(ms) = entry.duration_ms {
                timed += 1;
                duration_sum += ms;
            }
            if entry.level == LogLevel::Error {
                errors += 1;
                if stats.recent_errors.len() < RECENT_ERRORS {
                    stats.recent_errors.push(entry.clone());
                }
            }
        }
        if timed > 0 {
            stats.average_duration_ms = duration_sum as f64 / timed as f64;
        }
        if !entries.is_empty() {
            stats.error_rate = errors as f64 / entries.len() as f64;
        }
        Ok(stats)
    }

    /// Drops entries past retention, then any index id whose entry is gone.
    pub async fn cleanup_old_logs(&self) -> Result<u64, LoggerError> {
        let cutoff = now_millis() - self.config.retention.as_millis() as i64;
        let len = self.store.llen(ALL_KEY).await? as usize;
        let ids = self.store.lrange(ALL_KEY, 0, len).await?;

        let mut removed = 0;
        for id in ids {
            let commands = match self.load(&id).await {
                Ok(Some(entry)) if entry.timestamp >= cutoff => continue,
                Ok(Some(entry)) => {
                    let mut commands = vec![Command::del(entry_key(&id)), Command::lrem(ALL_KEY, &id)];
                    commands.extend(index_removals(&entry));
                    commands
                }
                Ok(None) | Err(LoggerError::Serialization(_)) => {
                    vec![Command::del(entry_key(&id)), Command::lrem(ALL_KEY, &id)]
                }
                Err(err) => return Err(err),
            };
            self.store.pipeline(commands).await?;
            removed += 1;
        }

        let swept = self.sweep_indexes().await?;
        if removed > 0 || swept > 0 {
            tracing::info!(removed, swept, "cleaned up old webhook logs");
        }
        Ok(removed)
    }

    pub(crate) async fn ping(&self) -> Result<u64, LoggerError> {
        Ok(self.store.llen(ALL_KEY).await?)
    }

    async fn persist(&self, entry: &LogEntry) -> Result<(), LoggerError> {
        let body = serde_json::to_string(entry)?;
        let correlation = correlation_key(&entry.correlation_id);
        let operation = operation_key(&entry.operation);
        let level = level_key(entry.level);
        let max_entries = self.config.max_entries;

        let mut replies = self
            .store
            .pipeline(vec![
                Command::set(entry_key(&entry.id), body, Some(self.config.retention)),
                Command::lpush(ALL_KEY, &entry.id),
                Command::LRange {
                    key: ALL_KEY.to_string(),
                    offset: max_entries,
                    limit: max_entries.max(1),
                },
                Command::ltrim(ALL_KEY, max_entries),
                Command::lpush(&correlation, &entry.id),
                Command::ltrim(&correlation, self.config.max_per_correlation),
                Command::lpush(&operation, &entry.id),
                Command::ltrim(&operation, self.config.max_per_index),
                Command::lpush(&level, &entry.id),
                Command::ltrim(&level, self.config.max_per_index),
            ])
            .await?
            .into_iter();

        let evicted = match replies.nth(2) {
            Some(reply) => reply.into_values("LRANGE")?,
            None => Vec::new(),
        };
        if !evicted.is_empty()
            && let Err(err) = self.evict(&evicted).await
        {
            tracing::warn!(evicted = evicted.len(), error = %err, "failed to evict trimmed log entries");
        }
        Ok(())
    }

    /// Drops entries that fell off the global list from every index.
    async fn evict(&self, ids: &[String]) -> Result<(), LoggerError> {
        let mut commands = Vec::with_capacity(ids.len() * 4);
        for id in ids {
            commands.push(Command::del(entry_key(id)));
            match self.load(id).await {
                Ok(Some(entry)) => commands.extend(index_removals(&entry)),
                Ok(None) | Err(LoggerError::Serialization(_)) => {}
                Err(err) => return Err(err),
            }
        }
        self.store.pipeline(commands).await?;
        Ok(())
    }

    /// Removes index ids whose entry no longer exists. Returns how many were removed.
    async fn sweep_indexes(&self) -> Result<u64, LoggerError> {
        let mut swept = 0;
        for prefix in [CORRELATION_PREFIX, OPERATION_PREFIX, LEVEL_PREFIX] {
            for key in self.store.keys(prefix).await? {
                let len = self.store.llen(&key).await? as usize;
                for id in self.store.lrange(&key, 0, len).await? {
                    if !self.store.exists(&entry_key(&id)).await? {
                        swept += self.store.lrem(&key, &id).await?;
                    }
                }
            }
        }
        Ok(swept)
    }

    async fn load(&self, id: &str) -> Result<Option<LogEntry>, LoggerError> {
        match self.store.get(&entry_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

fn emit(entry: &LogEntry) {
    let error = entry.error.as_ref().map(|err| err.message.as_str());
    match entry.level {
        LogLevel::Debug => tracing::debug!(
            correlation_id = %entry.correlation_id,
            operation = %entry.operation,
            duration_ms = entry.duration_ms,
            "{}",
            entry.message
        ),
        LogLevel::Info => tracing::info!(
            correlation_id = %entry.correlation_id,
            operation = %entry.operation,
            duration_ms = entry.duration_ms,
            "{}",
            entry.message
        ),
        LogLevel::Warn => tracing::warn!(
            correlation_id = %entry.correlation_id,
            operation = %entry.operation,
            error,
            "{}",
            entry.message
        ),
        LogLevel::Error => tracing::error!(
            correlation_id = %entry.correlation_id,
            operation = %entry.operation,
            error,
            "{}",
            entry.message
        ),
    }
}

fn index_removals(entry: &LogEntry) -> [Command; 3] {
    [
        Command::lrem(correlation_key(&entry.correlation_id), &entry.id),
        Command::lrem(operation_key(&entry.operation), &entry.id),
        Command::lrem(level_key(entry.level), &entry.id),
    ]
}

fn entry_key(id: &str) -> String {
    format!("{ENTRY_PREFIX}{id}")
}

fn correlation_key(correlation_id: &str) -> String {
    format!("{CORRELATION_PREFIX}{correlation_id}")
}

fn operation_key(operation: &str) -> String {
    format!("{OPERATION_PREFIX}{operation}")
}

fn level_key(level: LogLevel) -> String {
    format!("{LEVEL_PREFIX}{}", level.as_str())
}

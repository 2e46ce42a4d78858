//! Backing key-value store seam.
//!
//! Components never talk to a concrete store. They issue Redis-style
//! [`Command`]s through a [`GuardedStore`], which routes every call through the
//! shared circuit breaker. [`SqliteStore`] is the bundled implementation.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::circuit::CircuitError;

pub mod guarded;
pub mod sqlite;

pub use guarded::GuardedStore;
pub use sqlite::SqliteStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("circuit breaker open, retry in {retry_in_ms}ms")]
    CircuitOpen { retry_in_ms: u64 },
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: &'static str, reply: String },
}

impl From<CircuitError<StoreError>> for StoreError {
    fn from(err: CircuitError<StoreError>) -> Self {
        match err {
            CircuitError::Open { retry_in } => StoreError::CircuitOpen {
                retry_in_ms: retry_in.as_millis() as u64,
            },
            CircuitError::Inner(inner) => inner,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

impl ScoredMember {
    pub fn new(member: impl Into<String>, score: f64) -> Self {
        Self {
            member: member.into(),
            score,
        }
    }
}

/// One store primitive. Sorted sets are ordered by ascending score, lists are
/// ordered head-first (the most recent `LPush` is at offset 0).
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get { key: String },
    Set { key: String, value: String, ttl: Option<Duration> },
    SetNx { key: String, value: String, ttl: Option<Duration> },
    Del { key: String },
    Exists { key: String },
    Incr { key: String },
    Expire { key: String, ttl: Duration },
    /// Remaining time to live in milliseconds, `-1` without expiry, `-2` when missing.
    PTtl { key: String },
    Keys { prefix: String },
    ZAdd { key: String, member: String, score: f64 },
    ZRangeByScore { key: String, min: f64, max: f64, limit: Option<usize> },
    ZRange { key: String, offset: usize, limit: usize },
    ZScore { key: String, member: String },
    ZRem { key: String, member: String },
    ZCard { key: String },
    ZCount { key: String, min: f64, max: f64 },
    ZRemRangeByScore { key: String, min: f64, max: f64 },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    SMembers { key: String },
    LPush { key: String, value: String },
    LRange { key: String, offset: usize, limit: usize },
    /// Keeps the first `max_len` items of the list.
    LTrim { key: String, max_len: usize },
    LRem { key: String, value: String },
    LLen { key: String },
    Ping,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::SetNx { .. } => "SETNX",
            Command::Del { .. } => "DEL",
            Command::Exists { .. } => "EXISTS",
            Command::Incr { .. } => "INCR",
            Command::Expire { .. } => "EXPIRE",
            Command::PTtl { .. } => "PTTL",
            Command::Keys { .. } => "KEYS",
            Command::ZAdd { .. } => "ZADD",
            Command::ZRangeByScore { .. } => "ZRANGEBYSCORE",
            Command::ZRange { .. } => "ZRANGE",
            Command::ZScore { .. } => "ZSCORE",
            Command::ZRem { .. } => "ZREM",
            Command::ZCard { .. } => "ZCARD",
            Command::ZCount { .. } => "ZCOUNT",
            Command::ZRemRangeByScore { .. } => "ZREMRANGEBYSCORE",
            Command::SAdd { .. } => "SADD",
            Command::SRem { .. } => "SREM",
            Command::SMembers { .. } => "SMEMBERS",
            Command::LPush { .. } => "LPUSH",
            Command::LRange { .. } => "LRANGE",
            Command::LTrim { .. } => "LTRIM",
            Command::LRem { .. } => "LREM",
            Command::LLen { .. } => "LLEN",
            Command::Ping => "PING",
        }
    }

    pub fn set(key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Command::Del { key: key.into() }
    }

    pub fn incr(key: impl Into<String>) -> Self {
        Command::Incr { key: key.into() }
    }

    pub fn zadd(key: impl Into<String>, member: impl Into<String>, score: f64) -> Self {
        Command::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        }
    }

    pub fn zrem(key: impl Into<String>, member: impl Into<String>) -> Self {
        Command::ZRem {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn sadd(key: impl Into<String>, member: impl Into<String>) -> Self {
        Command::SAdd {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn srem(key: impl Into<String>, member: impl Into<String>) -> Self {
        Command::SRem {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn lpush(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::LPush {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn ltrim(key: impl Into<String>, max_len: usize) -> Self {
        Command::LTrim {
            key: key.into(),
            max_len,
        }
    }

    pub fn lrem(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::LRem {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Ok,
    Bool(bool),
    Int(i64),
    Score(f64),
    Value(String),
    Values(Vec<String>),
    Scored(Vec<ScoredMember>),
}

impl Reply {
    pub(crate) fn into_bool(self, command: &'static str) -> StoreResult<bool> {
        match self {
            Reply::Bool(value) => Ok(value),
            Reply::Int(value) => Ok(value > 0),
            other => Err(other.unexpected(command)),
        }
    }

    pub(crate) fn into_int(self, command: &'static str) -> StoreResult<i64> {
        match self {
            Reply::Int(value) => Ok(value),
            other => Err(other.unexpected(command)),
        }
    }

    pub(crate) fn into_value(self, command: &'static str) -> StoreResult<Option<String>> {
        match self {
            Reply::Value(value) => Ok(Some(value)),
            Reply::Nil => Ok(None),
            other => Err(other.unexpected(command)),
        }
    }

    pub(crate) fn into_score(self, command: &'static str) -> StoreResult<Option<f64>> {
        match self {
            Reply::Score(score) => Ok(Some(score)),
            Reply::Nil => Ok(None),
            other => Err(other.unexpected(command)),
        }
    }

    pub(crate) fn into_values(self, command: &'static str) -> StoreResult<Vec<String>> {
        match self {
            Reply::Values(values) => Ok(values),
            other => Err(other.unexpected(command)),
        }
    }

    pub(crate) fn into_scored(self, command: &'static str) -> StoreResult<Vec<ScoredMember>> {
        match self {
            Reply::Scored(members) => Ok(members),
            other => Err(other.unexpected(command)),
        }
    }

    pub(crate) fn into_unit(self, command: &'static str) -> StoreResult<()> {
        match self {
            Reply::Ok => Ok(()),
            other => Err(other.unexpected(command)),
        }
    }

    fn unexpected(self, command: &'static str) -> StoreError {
        StoreError::UnexpectedReply {
            command,
            reply: format!("{self:?}"),
        }
    }
}

/// A network key-value service.
///
/// `pipeline` must apply every command or none of them (MULTI/EXEC).
#[async_trait]
pub trait Store: Send + Sync {
    async fn execute(&self, command: Command) -> StoreResult<Reply>;

    async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>>;

    fn backend(&self) -> &'static str {
        "unknown"
    }
}

use std::sync::Arc;
use std::time::Duration;

use crate::circuit::CircuitBreaker;

use super::{Command, Reply, ScoredMember, Store, StoreResult};

/// Store handle shared by every pipeline component. All traffic passes
/// through the circuit breaker.
#[derive(Clone)]
pub struct GuardedStore {
    inner: Arc<dyn Store>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedStore {
    pub fn new(inner: Arc<dyn Store>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    pub async fn execute(&self, command: Command) -> StoreResult<Reply> {
        let inner = Arc::clone(&self.inner);
        self.breaker
            .execute(|| async move { inner.execute(command).await })
            .await
            .map_err(Into::into)
    }

    pub async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let inner = Arc::clone(&self.inner);
        self.breaker
            .execute(|| async move { inner.pipeline(commands).await })
            .await
            .map_err(Into::into)
    }

    pub async fn ping(&self) -> StoreResult<()> {
        self.execute(Command::Ping).await?.into_unit("PING")
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.execute(Command::Get { key: key.to_string() })
            .await?
            .into_value("GET")
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.execute(Command::set(key, value, ttl))
            .await?
            .into_unit("SET")
    }

    /// Set-if-absent. Returns `true` when this caller created the key.
    pub async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        self.execute(Command::SetNx {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        })
        .await?
        .into_bool("SETNX")
    }

    pub async fn del(&self, key: &str) -> StoreResult<bool> {
        self.execute(Command::del(key)).await?.into_bool("DEL")
    }

    pub async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.execute(Command::Exists { key: key.to_string() })
            .await?
            .into_bool("EXISTS")
    }

    pub async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.execute(Command::incr(key)).await?.into_int("INCR")
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.execute(Command::Expire {
            key: key.to_string(),
            ttl,
        })
        .await?
        .into_bool("EXPIRE")
    }

    /// Remaining lifetime of `key`; `None` when the key is missing or never expires.
    pub async fn pttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let millis = self
            .execute(Command::PTtl { key: key.to_string() })
            .await?
            .into_int("PTTL")?;
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }

    pub async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.execute(Command::Keys {
            prefix: prefix.to_string(),
        })
        .await?
        .into_values("KEYS")
    }

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.execute(Command::zadd(key, member, score))
            .await?
            .into_unit("ZADD")
    }

    pub async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<ScoredMember>> {
        self.execute(Command::ZRangeByScore {
            key: key.to_string(),
            min,
            max,
            limit,
        })
        .await?
        .into_scored("ZRANGEBYSCORE")
    }

    pub async fn zrange(&self, key: &str, offset: usize, limit: usize) -> StoreResult<Vec<ScoredMember>> {
        self.execute(Command::ZRange {
            key: key.to_string(),
            offset,
            limit,
        })
        .await?
        .into_scored("ZRANGE")
    }

    pub async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        self.execute(Command::ZScore {
            key: key.to_string(),
            member: member.to_string(),
        })
        .await?
        .into_score("ZSCORE")
    }

    pub async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.execute(Command::zrem(key, member))
            .await?
            .into_bool("ZREM")
    }

    pub async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let count = self
            .execute(Command::ZCard { key: key.to_string() })
            .await?
            .into_int("ZCARD")?;
        Ok(count.max(0) as u64)
    }

    pub async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let count = self
            .execute(Command::ZCount {
                key: key.to_string(),
                min,
                max,
            })
            .await?
            .into_int("ZCOUNT")?;
        Ok(count.max(0) as u64)
    }

    pub async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.execute(Command::sadd(key, member))
            .await?
            .into_bool("SADD")
    }

    pub async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.execute(Command::srem(key, member))
            .await?
            .into_bool("SREM")
    }

    pub async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.execute(Command::SMembers { key: key.to_string() })
            .await?
            .into_values("SMEMBERS")
    }

    /// Returns the list length after the push.
    pub async fn lpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        let len = self
            .execute(Command::lpush(key, value))
            .await?
            .into_int("LPUSH")?;
        Ok(len.max(0) as u64)
    }

    pub async fn lrange(&self, key: &str, offset: usize, limit: usize) -> StoreResult<Vec<String>> {
        self.execute(Command::LRange {
            key: key.to_string(),
            offset,
            limit,
        })
        .await?
        .into_values("LRANGE")
    }

    pub async fn lrem(&self, key: &str, value: &str) -> StoreResult<u64> {
        let removed = self
            .execute(Command::lrem(key, value))
            .await?
            .into_int("LREM")?;
        Ok(removed.max(0) as u64)
    }

    pub async fn llen(&self, key: &str) -> StoreResult<u64> {
        let len = self
            .execute(Command::LLen { key: key.to_string() })
            .await?
            .into_int("LLEN")?;
        Ok(len.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::config::CircuitConfig;
    use crate::store::StoreError;

    struct DownStore {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Store for DownStore {
        async fn execute(&self, _command: Command) -> StoreResult<Reply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn pipeline(&self, _commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn open_breaker_surfaces_as_circuit_open_without_round_trip() {
        let down = Arc::new(DownStore {
            calls: AtomicU32::new(0),
        });
        let breaker = Arc::new(CircuitBreaker::new(CircuitConfig {
            failure_threshold: 2,
            ..CircuitConfig::default()
        }));
        let store = GuardedStore::new(down.clone(), breaker);

        assert!(matches!(store.get("a").await, Err(StoreError::Unavailable(_))));
        assert!(matches!(store.get("a").await, Err(StoreError::Unavailable(_))));
        assert!(matches!(
            store.set("a", "1", None).await,
            Err(StoreError::CircuitOpen { .. })
        ));
        assert_eq!(down.calls.load(Ordering::SeqCst), 2);
    }
}

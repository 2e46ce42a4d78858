use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};

use super::{Command, Reply, ScoredMember, Store, StoreResult};

/// [`Store`] backed by SQLite tables (`kv_entries`, `sorted_set_members`,
/// `set_members`, `list_items`). Expired keys are filtered on read and purged
/// lazily on write.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if needed) the database at `database_url` and applies
    /// the schema.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn execute(&self, command: Command) -> StoreResult<Reply> {
        let mut conn = self.pool.acquire().await?;
        let now = Utc::now().timestamp_millis();
        Ok(apply(&mut conn, &command, now).await?)
    }

    async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let mut replies = Vec::with_capacity(commands.len());
        for command in &commands {
            replies.push(apply(&mut tx, command, now).await?);
        }
        tx.commit().await?;
        Ok(replies)
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

fn expiry(now: i64, ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now.saturating_add(ttl.as_millis() as i64))
}

fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map_or(-1, |limit| limit as i64)
}

async fn apply(
    conn: &mut SqliteConnection,
    command: &Command,
    now: i64,
) -> Result<Reply, sqlx::Error> {
    match command {
        Command::Get { key } => {
            let value: Option<String> = sqlx::query_scalar(
                r#"
                SELECT value
                FROM kv_entries
                WHERE key = ?
                  AND (expires_at IS NULL OR expires_at > ?)
                "#,
            )
            .bind(key)
            .bind(now)
            .fetch_optional(&mut *conn)
            .await?;
            Ok(value.map_or(Reply::Nil, Reply::Value))
        }
        Command::Set { key, value, ttl } => {
            sqlx::query(
                r#"
                INSERT INTO kv_entries (key, value, expires_at)
                VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expires_at = excluded.expires_at
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(expiry(now, *ttl))
            .execute(&mut *conn)
            .await?;
            Ok(Reply::Ok)
        }
        Command::SetNx { key, value, ttl } => {
            let result = sqlx::query(
                r#"
                INSERT INTO kv_entries (key, value, expires_at)
                VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expires_at = excluded.expires_at
                WHERE kv_entries.expires_at IS NOT NULL
                  AND kv_entries.expires_at <= ?
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(expiry(now, *ttl))
            .bind(now)
            .execute(&mut *conn)
            .await?;
            Ok(Reply::Bool(result.rows_affected() > 0))
        }
        Command::Del { key } => {
            let mut removed = sqlx::query(
                r#"
                DELETE FROM kv_entries
                WHERE key = ?
                  AND (expires_at IS NULL OR expires_at > ?)
                "#,
            )
            .bind(key)
            .bind(now)
            .execute(&mut *conn)
            .await?
            .rows_affected();
            // Expired leftovers go too but do not count as a deletion.
            sqlx::query("DELETE FROM kv_entries WHERE key = ?")
                .bind(key)
                .execute(&mut *conn)
                .await?;
            for table in ["sorted_set_members", "set_members", "list_items"] {
                removed += sqlx::query(&format!("DELETE FROM {table} WHERE key = ?"))
                    .bind(key)
                    .execute(&mut *conn)
                    .await?
                    .rows_affected();
            }
            Ok(Reply::Bool(removed > 0))
        }
        Command::Exists { key } => {
            let exists: i64 = sqlx::query_scalar(
                r#"
                SELECT
                    EXISTS(SELECT 1 FROM kv_entries
                           WHERE key = ? AND (expires_at IS NULL OR expires_at > ?))
                    OR EXISTS(SELECT 1 FROM sorted_set_members WHERE key = ?)
                    OR EXISTS(SELECT 1 FROM set_members WHERE key = ?)
                    OR EXISTS(SELECT 1 FROM list_items WHERE key = ?)
                "#,
            )
            .bind(key)
            .bind(now)
            .bind(key)
            .bind(key)
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
            Ok(Reply::Bool(exists != 0))
        }
        Command::Incr { key } => {
            let value: String = sqlx::query_scalar(
                r#"
                INSERT INTO kv_entries (key, value, expires_at)
                VALUES (?, '1', NULL)
                ON CONFLICT(key) DO UPDATE SET
                    value = CASE
                        WHEN kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= ? THEN '1'
                        ELSE CAST(CAST(kv_entries.value AS INTEGER) + 1 AS TEXT)
                    END,
                    expires_at = CASE
                        WHEN kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= ? THEN NULL
                        ELSE kv_entries.expires_at
                    END
                RETURNING value
                "#,
            )
            .bind(key)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *conn)
            .await?;
            let parsed = value
                .parse::<i64>()
                .map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
            Ok(Reply::Int(parsed))
        }
        Command::Expire { key, ttl } => {
            let result = sqlx::query(
                r#"
                UPDATE kv_entries
                SET expires_at = ?
                WHERE key = ?
                  AND (expires_at IS NULL OR expires_at > ?)
                "#,
            )
            .bind(expiry(now, Some(*ttl)))
            .bind(key)
            .bind(now)
            .execute(&mut *conn)
            .await?;
            Ok(Reply::Bool(result.rows_affected() > 0))
        }
        Command::PTtl { key } => {
            let row: Option<Option<i64>> = sqlx::query_scalar(
                r#"
                SELECT expires_at
                FROM kv_entries
                WHERE key = ?
                  AND (expires_at IS NULL OR expires_at > ?)
                "#,
            )
            .bind(key)
            .bind(now)
            .fetch_optional(&mut *conn)
            .await?;
            Ok(Reply::Int(match row {
                None => -2,
                Some(None) => -1,
                Some(Some(expires_at)) => expires_at - now,
            }))
        }
        Command::Keys { prefix } => {
            purge_expired(conn, now).await?;
            let pattern = like_prefix(prefix);
            let keys: Vec<String> = sqlx::query_scalar(
                r#"
                SELECT key FROM kv_entries WHERE key LIKE ? ESCAPE '\'
                UNION
                SELECT key FROM sorted_set_members WHERE key LIKE ? ESCAPE '\'
                UNION
                SELECT key FROM set_members WHERE key LIKE ? ESCAPE '\'
                UNION
                SELECT key FROM list_items WHERE key LIKE ? ESCAPE '\'
                ORDER BY key ASC
                "#,
            )
            .bind(&pattern)
            .bind(&pattern)
            .bind(&pattern)
            .bind(&pattern)
            .fetch_all(&mut *conn)
            .await?;
            Ok(Reply::Values(keys))
        }
        Command::ZAdd { key, member, score } => {
            sqlx::query(
                r#"
                INSERT INTO sorted_set_members (key, member, score)
                VALUES (?, ?, ?)
                ON CONFLICT(key, member) DO UPDATE SET score = excluded.score
                "#,
            )
            .bind(key)
            .bind(member)
            .bind(*score)
            .execute(&mut *conn)
            .await?;
            Ok(Reply::Ok)
        }
        Command::ZRangeByScore {
            key,
            min,
            max,
            limit,
        } => {
            let rows: Vec<(String, f64)> = sqlx::query_as(
                r#"
                SELECT member, score
                FROM sorted_set_members
                WHERE key = ? AND score >= ? AND score <= ?
                ORDER BY score ASC, member ASC
                LIMIT ?
                "#,
            )
            .bind(key)
            .bind(*min)
            .bind(*max)
            .bind(sql_limit(*limit))
            .fetch_all(&mut *conn)
            .await?;
            Ok(scored(rows))
        }
        Command::ZRange { key, offset, limit } => {
            let rows: Vec<(String, f64)> = sqlx::query_as(
                r#"
                SELECT member, score
                FROM sorted_set_members
                WHERE key = ?
                ORDER BY score ASC, member ASC
                LIMIT ? OFFSET ?
                "#,
            )
            .bind(key)
            .bind(*limit as i64)
            .bind(*offset as i64)
            .fetch_all(&mut *conn)
            .await?;
            Ok(scored(rows))
        }
        Command::ZScore { key, member } => {
            let score: Option<f64> = sqlx::query_scalar(
                "SELECT score FROM sorted_set_members WHERE key = ? AND member = ?",
            )
            .bind(key)
            .bind(member)
            .fetch_optional(&mut *conn)
            .await?;
            Ok(score.map_or(Reply::Nil, Reply::Score))
        }
        Command::ZRem { key, member } => {
            let result = sqlx::query("DELETE FROM sorted_set_members WHERE key = ? AND member = ?")
                .bind(key)
                .bind(member)
                .execute(&mut *conn)
                .await?;
            Ok(Reply::Bool(result.rows_affected() > 0))
        }
        Command::ZCard { key } => {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM sorted_set_members WHERE key = ?")
                    .bind(key)
                    .fetch_one(&mut *conn)
                    .await?;
            Ok(Reply::Int(count))
        }
        Command::ZCount { key, min, max } => {
            let count: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*)
                FROM sorted_set_members
                WHERE key = ? AND score >= ? AND score <= ?
                "#,
            )
            .bind(key)
            .bind(*min)
            .bind(*max)
            .fetch_one(&mut *conn)
            .await?;
            Ok(Reply::Int(count))
        }
        Command::ZRemRangeByScore { key, min, max } => {
            let result = sqlx::query(
                "DELETE FROM sorted_set_members WHERE key = ? AND score >= ? AND score <= ?",
            )
            .bind(key)
            .bind(*min)
            .bind(*max)
            .execute(&mut *conn)
            .await?;
            Ok(Reply::Int(result.rows_affected() as i64))
        }
        Command::SAdd { key, member } => {
            let result = sqlx::query(
                "INSERT INTO set_members (key, member) VALUES (?, ?) ON CONFLICT(key, member) DO NOTHING",
            )
            .bind(key)
            .bind(member)
            .execute(&mut *conn)
            .await?;
            Ok(Reply::Bool(result.rows_affected() > 0))
        }
        Command::SRem { key, member } => {
            let result = sqlx::query("DELETE FROM set_members WHERE key = ? AND member = ?")
                .bind(key)
                .bind(member)
                .execute(&mut *conn)
                .await?;
            Ok(Reply::Bool(result.rows_affected() > 0))
        }
        Command::SMembers { key } => {
            let members: Vec<String> = sqlx::query_scalar(
                "SELECT member FROM set_members WHERE key = ? ORDER BY member ASC",
            )
            .bind(key)
            .fetch_all(&mut *conn)
            .await?;
            Ok(Reply::Values(members))
        }
        Command::LPush { key, value } => {
            sqlx::query(
                r#"
                INSERT INTO list_items (key, position, value)
                SELECT ?, COALESCE(MIN(position), 0) - 1, ?
                FROM list_items
                WHERE key = ?
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(key)
            .execute(&mut *conn)
            .await?;
            Ok(Reply::Int(list_len(conn, key).await?))
        }
        Command::LRange { key, offset, limit } => {
            let values: Vec<String> = sqlx::query_scalar(
                r#"
                SELECT value
                FROM list_items
                WHERE key = ?
                ORDER BY position ASC
                LIMIT ? OFFSET ?
                "#,
            )
            .bind(key)
            .bind(*limit as i64)
            .bind(*offset as i64)
            .fetch_all(&mut *conn)
            .await?;
            Ok(Reply::Values(values))
        }
        Command::LTrim { key, max_len } => {
            let result = sqlx::query(
                r#"
                DELETE FROM list_items
                WHERE key = ?
                  AND id NOT IN (
                      SELECT id FROM list_items
                      WHERE key = ?
                      ORDER BY position ASC
                      LIMIT ?
                  )
                "#,
            )
            .bind(key)
            .bind(key)
            .bind(*max_len as i64)
            .execute(&mut *conn)
            .await?;
            Ok(Reply::Int(result.rows_affected() as i64))
        }
        Command::LRem { key, value } => {
            let result = sqlx::query("DELETE FROM list_items WHERE key = ? AND value = ?")
                .bind(key)
                .bind(value)
                .execute(&mut *conn)
                .await?;
            Ok(Reply::Int(result.rows_affected() as i64))
        }
        Command::LLen { key } => Ok(Reply::Int(list_len(conn, key).await?)),
        Command::Ping => {
            sqlx::query("SELECT 1").execute(&mut *conn).await?;
            Ok(Reply::Ok)
        }
    }
}

async fn list_len(conn: &mut SqliteConnection, key: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM list_items WHERE key = ?")
        .bind(key)
        .fetch_one(&mut *conn)
        .await
}

async fn purge_expired(conn: &mut SqliteConnection, now: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= ?")
        .bind(now)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

fn scored(rows: Vec<(String, f64)>) -> Reply {
    Reply::Scored(
        rows.into_iter()
            .map(|(member, score)| ScoredMember { member, score })
            .collect(),
    )
}

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};

use super::{BoundedAdd, KvStore, StoreError, StoreResult, Ttl, now_millis};

const MAX_ATTEMPTS: usize = 64;

/// Store backed by a single SQLite table. Several processes may share one
/// database file; writes are compare-and-swap on the stored JSON so each
/// command stays atomic without holding a transaction open.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn expires_at(now: i64, secs: u64) -> i64 {
    now.saturating_add((secs as i64).saturating_mul(1000))
}

fn parse(key: &str, text: &str) -> StoreResult<Value> {
    serde_json::from_str(text).map_err(|source| StoreError::Malformed {
        key: key.to_owned(),
        source,
    })
}

impl SqliteStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> StoreResult<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                expires_at INTEGER
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    async fn load(&self, key: &str, now: i64) -> StoreResult<Option<(String, Option<i64>)>> {
        Ok(sqlx::query_as::<_, (String, Option<i64>)>(
            "SELECT value,expires_at FROM kv WHERE key=? AND (expires_at IS NULL OR expires_at>?)",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Writes `next` only if the row still holds `expected` (or is absent/expired when `None`).
    /// `expires_at` replaces the expiry when given; otherwise a live row keeps its own
    /// and a fresh row is persistent.
    async fn swap(
        &self,
        key: &str,
        expected: Option<&str>,
        next: &Value,
        expires_at: Option<i64>,
        now: i64,
    ) -> StoreResult<bool> {
        let next = next.to_string();

        let result = match expected {
            Some(expected) => {
                sqlx::query(
                    "UPDATE kv SET value=?, expires_at=COALESCE(?,expires_at)
                    WHERE key=? AND value=? AND (expires_at IS NULL OR expires_at>?)",
                )
                .bind(next)
                .bind(expires_at)
                .bind(key)
                .bind(expected)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "INSERT INTO kv (key,value,expires_at) VALUES (?,?,?)
                    ON CONFLICT(key) DO UPDATE SET value=excluded.value, expires_at=excluded.expires_at
                    WHERE kv.expires_at IS NOT NULL AND kv.expires_at<=?",
                )
                .bind(key)
                .bind(next)
                .bind(expires_at)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }

    async fn mutate<T, F>(&self, key: &str, apply: F) -> StoreResult<T>
    where
        F: FnMut(Option<&Value>) -> StoreResult<(T, Option<Value>)> + Send,
        T: Send,
    {
        self.mutate_expiring(key, None, apply).await
    }

    /// Optimistic read-modify-write. `apply` returns the caller's result and
    /// the value to store, or `None` to leave the row untouched. With `ttl`,
    /// the write also resets the expiry to that many seconds from now.
    async fn mutate_expiring<T, F>(&self, key: &str, ttl: Option<u64>, mut apply: F) -> StoreResult<T>
    where
        F: FnMut(Option<&Value>) -> StoreResult<(T, Option<Value>)> + Send,
        T: Send,
    {
        for _ in 0..MAX_ATTEMPTS {
            let now = now_millis();
            let current = self.load(key, now).await?;
            let expected = current.map(|(text, _)| text);
            let parsed = expected.as_deref().map(|text| parse(key, text)).transpose()?;

            let (result, next) = apply(parsed.as_ref())?;
            let Some(next) = next else {
                return Ok(result);
            };

            let deadline = ttl.map(|secs| expires_at(now, secs));
            if self.swap(key, expected.as_deref(), &next, deadline, now).await? {
                return Ok(result);
            }
        }

        Err(StoreError::Contention {
            key: key.to_owned(),
            attempts: MAX_ATTEMPTS,
        })
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn hset(&self, key: &str, fields: Map<String, Value>) -> StoreResult<()> {
        self.mutate(key, |current| {
            Ok(((), Some(super::merge_hash(key, current, fields.clone())?)))
        })
        .await
    }

    async fn hset_ex(&self, key: &str, fields: Map<String, Value>, secs: u64) -> StoreResult<()> {
        if secs == 0 {
            self.del(&[key]).await?;
            return Ok(());
        }

        self.mutate_expiring(key, Some(secs), |current| {
            Ok(((), Some(super::merge_hash(key, current, fields.clone())?)))
        })
        .await
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Value>> {
        Ok(self.hgetall(key).await?.and_then(|mut hash| hash.remove(field)))
    }

    async fn hgetall(&self, key: &str) -> StoreResult<Option<Map<String, Value>>> {
        let Some((text, _)) = self.load(key, now_millis()).await? else {
            return Ok(None);
        };

        let value = parse(key, &text)?;
        Ok(Some(super::as_hash(key, &value)?.clone()))
    }

    async fn hadd_bounded(
        &self,
        key: &str,
        field: &str,
        member: &str,
        limit: usize,
    ) -> StoreResult<BoundedAdd> {
        self.mutate(key, |current| super::bounded_add(key, current, field, member, limit))
            .await
    }

    async fn expire(&self, key: &str, secs: u64) -> StoreResult<bool> {
        let now = now_millis();

        let result = if secs == 0 {
            sqlx::query("DELETE FROM kv WHERE key=? AND (expires_at IS NULL OR expires_at>?)")
                .bind(key)
                .bind(now)
                .execute(&self.pool)
                .await?
        } else {
            sqlx::query("UPDATE kv SET expires_at=? WHERE key=? AND (expires_at IS NULL OR expires_at>?)")
                .bind(expires_at(now, secs))
                .bind(key)
                .bind(now)
                .execute(&self.pool)
                .await?
        };

        Ok(result.rows_affected() == 1)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Ttl> {
        let now = now_millis();

        Ok(match self.load(key, now).await? {
            None => Ttl::Missing,
            Some((_, None)) => Ttl::Persistent,
            Some((_, Some(at))) => Ttl::Remaining(((at - now) / 1000) as u64),
        })
    }

    async fn rpush(&self, key: &str, value: Value) -> StoreResult<usize> {
        self.mutate(key, |current| {
            let list = super::push_item(key, current, value.clone())?;
            let len = super::as_list(key, &list)?.len();
            Ok((len, Some(list)))
        })
        .await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Value>> {
        let Some((text, _)) = self.load(key, now_millis()).await? else {
            return Ok(Vec::new());
        };

        super::slice_list(key, &parse(key, &text)?, start, stop)
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()> {
        self.mutate(key, |current| {
            let Some(current) = current else {
                return Ok(((), None));
            };

            let kept = super::slice_list(key, current, start, stop)?;
            if kept.len() == super::as_list(key, current)?.len() {
                return Ok(((), None));
            }

            Ok(((), Some(Value::Array(kept))))
        })
        .await
    }

    async fn del(&self, keys: &[&str]) -> StoreResult<usize> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;

        for key in keys {
            let result = sqlx::query("DELETE FROM kv WHERE key=? AND (expires_at IS NULL OR expires_at>?)")
                .bind(*key)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            deleted += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(deleted)
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let result = sqlx::query("DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at<=?")
            .bind(now_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() as usize)
    }
}

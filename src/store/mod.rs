//! TTL-capable key-value storage for room-scoped records.
//!
//! Records are JSON values: a hash is an object, a list is an array. Every
//! method is atomic on its own; sequences of calls are not.
//!
//! ```text
//! meta:{room_id}      -> { "connected": [token, ..], "createdAt": millis }
//! messages:{room_id}  -> [ message, .. ]
//! session:{id}        -> { "data": {..}, "expiresAt": secs }
//! ```

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("malformed record at {key}: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{key} does not hold a {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("gave up on {key} after {attempts} conflicting writes")]
    Contention { key: String, attempts: usize },
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Missing,
    Persistent,
    /// Whole seconds left, rounded down.
    Remaining(u64),
}

impl Ttl {
    /// Seconds left, with anything that is not a positive countdown reported as 0.
    pub fn secs_or_zero(self) -> u64 {
        match self {
            Ttl::Remaining(secs) => secs,
            Ttl::Missing | Ttl::Persistent => 0,
        }
    }
}

/// Result of [`KvStore::hadd_bounded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundedAdd {
    /// Member appended; carries the new set size.
    Added(usize),
    AlreadyMember,
    Full,
    /// The hash does not exist (never created, expired or deleted).
    Missing,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Merges `fields` into the hash at `key`, creating it if absent. The TTL is kept.
    async fn hset(&self, key: &str, fields: Map<String, Value>) -> StoreResult<()>;

    /// Like [`KvStore::hset`], but the same write also sets the key to expire
    /// after `secs`. Zero deletes the key.
    async fn hset_ex(&self, key: &str, fields: Map<String, Value>, secs: u64) -> StoreResult<()>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Value>>;

    async fn hgetall(&self, key: &str) -> StoreResult<Option<Map<String, Value>>>;

    /// Appends `member` to the array held in `field` of an existing hash,
    /// unless it is already present or the array has `limit` or more entries.
    async fn hadd_bounded(
        &self,
        key: &str,
        field: &str,
        member: &str,
        limit: usize,
    ) -> StoreResult<BoundedAdd>;

    /// Sets the key to expire after `secs`. Zero deletes the key right away.
    /// Returns whether the key existed.
    async fn expire(&self, key: &str, secs: u64) -> StoreResult<bool>;

    async fn ttl(&self, key: &str) -> StoreResult<Ttl>;

    /// Appends to the list at `key`, creating it without a TTL. Returns the new length.
    async fn rpush(&self, key: &str, value: Value) -> StoreResult<usize>;

    /// Inclusive range with negative indexes counting from the end.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Value>>;

    /// Keeps only the inclusive range of the list.
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()>;

    async fn del(&self, keys: &[&str]) -> StoreResult<usize>;

    /// Physically drops expired keys. Reads already treat them as absent.
    async fn purge_expired(&self) -> StoreResult<usize>;
}

/// Wall-clock unix millis, as stored in records and the SQLite expiry column.
pub(crate) fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Purges expired keys every `every` until the last handle to the store is dropped.
pub fn spawn_sweeper(store: &Arc<dyn KvStore>, every: Duration) -> JoinHandle<()> {
    let store: Weak<dyn KvStore> = Arc::downgrade(store);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(store) = store.upgrade() else {
                break;
            };

            match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "swept expired keys"),
                Err(err) => tracing::warn!(error = %err, "sweeping expired keys failed"),
            }
        }
    })
}

/// Resolves a list range the way `LRANGE`/`LTRIM` do.
pub(crate) fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if len == 0 || start > stop || start >= len {
        return None;
    }

    Some((start as usize, stop as usize))
}

pub(crate) fn as_hash<'a>(key: &str, value: &'a Value) -> StoreResult<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| StoreError::WrongType {
        key: key.to_owned(),
        expected: "hash",
    })
}

pub(crate) fn as_list<'a>(key: &str, value: &'a Value) -> StoreResult<&'a Vec<Value>> {
    value.as_array().ok_or_else(|| StoreError::WrongType {
        key: key.to_owned(),
        expected: "list",
    })
}

pub(crate) fn merge_hash(key: &str, current: Option<&Value>, fields: Map<String, Value>) -> StoreResult<Value> {
    let mut hash = match current {
        Some(value) => as_hash(key, value)?.clone(),
        None => Map::new(),
    };
    hash.extend(fields);
    Ok(Value::Object(hash))
}

/// Computes the hash after a bounded add, or `None` when nothing should be written.
pub(crate) fn bounded_add(
    key: &str,
    current: Option<&Value>,
    field: &str,
    member: &str,
    limit: usize,
) -> StoreResult<(BoundedAdd, Option<Value>)> {
    let Some(current) = current else {
        return Ok((BoundedAdd::Missing, None));
    };

    let mut hash = as_hash(key, current)?.clone();
    let mut members = match hash.get(field) {
        Some(Value::Array(members)) => members.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(_) => {
            return Err(StoreError::WrongType {
                key: format!("{key}.{field}"),
                expected: "list",
            });
        }
    };

    if members.iter().any(|m| m.as_str() == Some(member)) {
        return Ok((BoundedAdd::AlreadyMember, None));
    }
    if members.len() >= limit {
        return Ok((BoundedAdd::Full, None));
    }

    members.push(Value::String(member.to_owned()));
    let size = members.len();
    hash.insert(field.to_owned(), Value::Array(members));

    Ok((BoundedAdd::Added(size), Some(Value::Object(hash))))
}

pub(crate) fn push_item(key: &str, current: Option<&Value>, item: Value) -> StoreResult<Value> {
    let mut list = match current {
        Some(value) => as_list(key, value)?.clone(),
        None => Vec::new(),
    };
    list.push(item);
    Ok(Value::Array(list))
}

pub(crate) fn slice_list(key: &str, value: &Value, start: i64, stop: i64) -> StoreResult<Vec<Value>> {
    let list = as_list(key, value)?;
    Ok(match resolve_range(list.len(), start, stop) {
        Some((from, to)) => list[from..=to].to_vec(),
        None => Vec::new(),
    })
}

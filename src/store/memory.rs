use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::{sync::Mutex, time::Instant};

use super::{BoundedAdd, KvStore, StoreResult, Ttl};

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process store. Expired keys vanish from reads immediately and are
/// dropped from memory by [`super::spawn_sweeper`].
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn hset(&self, key: &str, fields: Map<String, Value>) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        match live(&mut entries, key, now) {
            Some(entry) => {
                entry.value = super::merge_hash(key, Some(&entry.value), fields)?;
            }
            None => {
                let value = super::merge_hash(key, None, fields)?;
                entries.insert(key.to_owned(), Entry { value, expires_at: None });
            }
        }

        Ok(())
    }

    async fn hset_ex(&self, key: &str, fields: Map<String, Value>, secs: u64) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        if secs == 0 {
            entries.remove(key);
            return Ok(());
        }

        let current = live(&mut entries, key, now).map(|entry| &entry.value);
        let value = super::merge_hash(key, current, fields)?;
        entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: Some(now + Duration::from_secs(secs)),
            },
        );

        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Value>> {
        Ok(self.hgetall(key).await?.and_then(|mut hash| hash.remove(field)))
    }

    async fn hgetall(&self, key: &str) -> StoreResult<Option<Map<String, Value>>> {
        let mut entries = self.entries.lock().await;

        match live(&mut entries, key, Instant::now()) {
            Some(entry) => Ok(Some(super::as_hash(key, &entry.value)?.clone())),
            None => Ok(None),
        }
    }

    async fn hadd_bounded(
        &self,
        key: &str,
        field: &str,
        member: &str,
        limit: usize,
    ) -> StoreResult<BoundedAdd> {
        let mut entries = self.entries.lock().await;
        let entry = live(&mut entries, key, Instant::now());

        let (outcome, written) =
            super::bounded_add(key, entry.as_ref().map(|e| &e.value), field, member, limit)?;

        if let (Some(entry), Some(value)) = (entry, written) {
            entry.value = value;
        }

        Ok(outcome)
    }

    async fn expire(&self, key: &str, secs: u64) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        if live(&mut entries, key, now).is_none() {
            return Ok(false);
        }

        if secs == 0 {
            entries.remove(key);
        } else if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(now + Duration::from_secs(secs));
        }

        Ok(true)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Ttl> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        Ok(match live(&mut entries, key, now) {
            None => Ttl::Missing,
            Some(Entry { expires_at: None, .. }) => Ttl::Persistent,
            Some(Entry { expires_at: Some(at), .. }) => Ttl::Remaining((*at - now).as_secs()),
        })
    }

    async fn rpush(&self, key: &str, value: Value) -> StoreResult<usize> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        match live(&mut entries, key, now) {
            Some(entry) => {
                entry.value = super::push_item(key, Some(&entry.value), value)?;
                Ok(super::as_list(key, &entry.value)?.len())
            }
            None => {
                let value = super::push_item(key, None, value)?;
                entries.insert(key.to_owned(), Entry { value, expires_at: None });
                Ok(1)
            }
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Value>> {
        let mut entries = self.entries.lock().await;

        match live(&mut entries, key, Instant::now()) {
            Some(entry) => super::slice_list(key, &entry.value, start, stop),
            None => Ok(Vec::new()),
        }
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;

        let Some(entry) = live(&mut entries, key, Instant::now()) else {
            return Ok(());
        };

        entry.value = Value::Array(super::slice_list(key, &entry.value, start, stop)?);
        Ok(())
    }

    async fn del(&self, keys: &[&str]) -> StoreResult<usize> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        Ok(keys
            .iter()
            .filter_map(|key| entries.remove(*key))
            .filter(|entry| entry.is_live(now))
            .count())
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(before - entries.len())
    }
}

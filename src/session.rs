//! Session records kept in the room store, so every process sharing the store
//! recognises the same cookie.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use tower_sessions::{
    SessionStore,
    session::{Id, Record},
    session_store,
};

use crate::store::{KvStore, StoreError, Ttl};

pub const SESSION_COOKIE: &str = "burnchat.sid";

/// Session key holding the admission token of the last room entered.
pub const AUTH_TOKEN: &str = "x-auth-token";

const DATA: &str = "data";
const EXPIRES: &str = "expiresAt";

fn session_key(id: &Id) -> String {
    format!("session:{id}")
}

fn decode(err: impl fmt::Display) -> session_store::Error {
    session_store::Error::Decode(err.to_string())
}

fn backend(err: StoreError) -> session_store::Error {
    session_store::Error::Backend(err.to_string())
}

/// `session:{id} -> { "data": {..}, "expiresAt": unix secs }`, expiring with the session.
#[derive(Clone)]
pub struct KvSessionStore {
    kv: Arc<dyn KvStore>,
}

impl KvSessionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }
}

impl fmt::Debug for KvSessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvSessionStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionStore for KvSessionStore {
    async fn create(&self, record: &mut Record) -> session_store::Result<()> {
        while self.kv.ttl(&session_key(&record.id)).await.map_err(backend)? != Ttl::Missing {
            record.id = Id::default();
        }
        self.save(record).await
    }

    async fn save(&self, record: &Record) -> session_store::Result<()> {
        let key = session_key(&record.id);
        let left = (record.expiry_date - OffsetDateTime::now_utc()).whole_milliseconds();
        // rounded up so a session never dies before its cookie says it should
        let secs = if left > 0 { ((left + 999) / 1000) as u64 } else { 0 };

        let data = serde_json::to_value(&record.data)
            .map_err(|err| session_store::Error::Encode(err.to_string()))?;
        let mut fields = Map::new();
        fields.insert(DATA.to_owned(), data);
        fields.insert(EXPIRES.to_owned(), json!(record.expiry_date.unix_timestamp()));

        self.kv.hset_ex(&key, fields, secs).await.map_err(backend)
    }

    async fn load(&self, session_id: &Id) -> session_store::Result<Option<Record>> {
        let Some(mut hash) = self.kv.hgetall(&session_key(session_id)).await.map_err(backend)? else {
            return Ok(None);
        };

        let data: HashMap<String, Value> =
            serde_json::from_value(hash.remove(DATA).unwrap_or(Value::Null)).map_err(decode)?;
        let expires = hash
            .get(EXPIRES)
            .and_then(Value::as_i64)
            .ok_or_else(|| decode("missing expiry"))?;
        let expiry_date = OffsetDateTime::from_unix_timestamp(expires).map_err(decode)?;

        Ok(Some(Record {
            id: *session_id,
            data,
            expiry_date,
        }))
    }

    async fn delete(&self, session_id: &Id) -> session_store::Result<()> {
        self.kv.del(&[&session_key(session_id)]).await.map_err(backend)?;
        Ok(())
    }
}

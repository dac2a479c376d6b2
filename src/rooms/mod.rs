//! Ephemeral rooms: admission, token checks, lifetime and message relay.
//!
//! All room state lives in the [`KvStore`]; nothing is cached in process, so
//! any number of servers can share one store. Every room-scoped key expires
//! with the room's metadata record.

mod admission;
mod guard;
mod lifecycle;
mod relay;
mod ws;

pub use admission::Admission;
pub use guard::RoomAuth;
pub use relay::{Message, NewMessage};

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    AppState,
    config::RoomPolicy,
    events::EventChannel,
    ids::IdGenerator,
    store::{KvStore, StoreError},
};

const CONNECTED: &str = "connected";

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("room not found")]
    NotFound,

    #[error("room is full")]
    Full,

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub(crate) fn meta_key(room_id: &str) -> String {
    format!("meta:{room_id}")
}

pub(crate) fn messages_key(room_id: &str) -> String {
    format!("messages:{room_id}")
}

#[derive(Debug, Deserialize)]
pub(crate) struct RoomMeta {
    #[serde(default)]
    pub(crate) connected: Vec<String>,
}

impl RoomMeta {
    pub(crate) fn admits(&self, token: &str) -> bool {
        self.connected.iter().any(|t| t == token)
    }
}

/// Handle to the room engine. Cheap to clone; every clone shares the same store and channel.
#[derive(Clone)]
pub struct Rooms {
    store: Arc<dyn KvStore>,
    events: Arc<dyn EventChannel>,
    ids: Arc<dyn IdGenerator>,
    policy: RoomPolicy,
}

impl Rooms {
    pub fn new(
        store: Arc<dyn KvStore>,
        events: Arc<dyn EventChannel>,
        ids: Arc<dyn IdGenerator>,
        policy: RoomPolicy,
    ) -> Self {
        Self { store, events, ids, policy }
    }

    pub fn policy(&self) -> &RoomPolicy {
        &self.policy
    }

    pub fn events(&self) -> &Arc<dyn EventChannel> {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// `None` when the room never existed, expired or was destroyed.
    pub(crate) async fn meta(&self, room_id: &str) -> Result<Option<RoomMeta>, RoomError> {
        let key = meta_key(room_id);
        let Some(hash) = self.store.hgetall(&key).await? else {
            return Ok(None);
        };

        serde_json::from_value(Value::Object(hash))
            .map(Some)
            .map_err(|source| StoreError::Malformed { key, source }.into())
    }

    /// Fire-and-forget publish; the store stays the source of truth if this fails.
    pub(crate) async fn publish(&self, room_id: &str, event: &str, payload: Value) {
        match self.events.publish(room_id, event, payload).await {
            Ok(reached) => tracing::debug!(room_id, event, reached, "published"),
            Err(err) => tracing::warn!(room_id, event, error = %err, "publish failed"),
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/room/create", post(lifecycle::create_room))
        .route("/room/ttl", get(lifecycle::room_ttl))
        .route("/room/events", get(ws::room_events))
        .route("/room", delete(lifecycle::destroy_room))
        .route("/room/{room_id}", get(admission::enter_room))
        .route("/messages", get(relay::history).post(relay::post_message))
}

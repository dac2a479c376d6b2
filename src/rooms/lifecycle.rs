use axum::{
    Json, debug_handler,
    extract::State,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Map, json};

use crate::{
    AppResult, AppState,
    events::CHAT_DESTROY,
    store::{Ttl, now_millis},
};

use super::{CONNECTED, RoomAuth, RoomError, Rooms, guard::Credentials, messages_key, meta_key};

impl Rooms {
    pub async fn create(&self) -> Result<String, RoomError> {
        let room_id = self.ids.room_id();
        let key = meta_key(&room_id);

        let mut fields = Map::new();
        fields.insert(CONNECTED.to_owned(), json!([]));
        fields.insert("createdAt".to_owned(), json!(now_millis()));

        self.store.hset_ex(&key, fields, self.policy.room_ttl).await?;

        tracing::info!(room_id, ttl = self.policy.room_ttl, "room created");
        Ok(room_id)
    }

    /// Seconds until the room self-destructs; 0 once it is gone or going.
    pub async fn remaining_ttl(&self, auth: &RoomAuth) -> Result<u64, RoomError> {
        Ok(self.store.ttl(&meta_key(&auth.room_id)).await?.secs_or_zero())
    }

    /// Gives `keys` whatever lifetime the room's metadata has left right now,
    /// so nothing belonging to the room outlives it.
    pub async fn cascade_ttl(&self, room_id: &str, keys: &[&str]) -> Result<(), RoomError> {
        match self.store.ttl(&meta_key(room_id)).await? {
            Ttl::Remaining(secs) => {
                for key in keys {
                    self.store.expire(key, secs).await?;
                }
                tracing::debug!(room_id, secs, "cascaded ttl");
            }
            Ttl::Missing => {
                self.store.del(keys).await?;
            }
            Ttl::Persistent => {}
        }

        Ok(())
    }

    /// Tells subscribers the room is going away, then deletes everything it owns.
    /// Destroying a room that is already gone succeeds; a token that was never
    /// admitted to a live room is rejected.
    pub async fn destroy(&self, room_id: Option<&str>, token: Option<&str>) -> Result<(), RoomError> {
        let (Some(room_id), Some(token)) = (room_id, token) else {
            return Err(RoomError::Unauthorized);
        };

        let Some(meta) = self.meta(room_id).await? else {
            tracing::debug!(room_id, "destroy of a room that is already gone");
            return Ok(());
        };

        if !meta.admits(token) {
            return Err(RoomError::Unauthorized);
        }

        self.publish(room_id, CHAT_DESTROY, json!({ "isDestroyed": true })).await;
        self.store.del(&[&meta_key(room_id), &messages_key(room_id)]).await?;
        self.events.close(room_id);

        tracing::info!(room_id, "room destroyed");
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreatedRoom {
    room_id: String,
}

#[derive(Serialize)]
pub(crate) struct RoomTtl {
    ttl: u64,
}

#[debug_handler(state = AppState)]
pub(crate) async fn create_room(State(rooms): State<Rooms>) -> AppResult<Json<CreatedRoom>> {
    let room_id = rooms.create().await?;
    Ok(Json(CreatedRoom { room_id }))
}

#[debug_handler(state = AppState)]
pub(crate) async fn room_ttl(State(rooms): State<Rooms>, auth: RoomAuth) -> AppResult<Json<RoomTtl>> {
    let ttl = rooms.remaining_ttl(&auth).await?;
    Ok(Json(RoomTtl { ttl }))
}

#[debug_handler(state = AppState)]
pub(crate) async fn destroy_room(
    State(rooms): State<Rooms>,
    Credentials { room_id, token }: Credentials,
) -> AppResult<Response> {
    rooms.destroy(room_id.as_deref(), token.as_deref()).await?;
    Ok(().into_response())
}

use axum::{
    Json, debug_handler,
    extract::State,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    AppResult, AppState,
    events::CHAT_MESSAGE,
    store::{StoreError, Ttl, now_millis},
};

use super::{RoomAuth, RoomError, Rooms, messages_key, meta_key};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub text: String,
    pub timestamp: i64,
    pub room_id: String,
    /// Author's admission token. Stored, but only ever shown back to its owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Message {
    fn redacted_for(mut self, token: &str) -> Self {
        if self.token.as_deref() != Some(token) {
            self.token = None;
        }
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMessage {
    pub sender: String,
    pub text: String,
}

fn bounded(field: &str, value: &str, max: usize) -> Result<String, RoomError> {
    let value = value.trim();

    if value.is_empty() {
        return Err(RoomError::Validation(format!("{field} must not be empty")));
    }
    if value.chars().count() > max {
        return Err(RoomError::Validation(format!("{field} must be at most {max} characters")));
    }

    Ok(value.to_owned())
}

fn encode(key: &str, message: &Message) -> Result<serde_json::Value, RoomError> {
    serde_json::to_value(message).map_err(|source| {
        StoreError::Malformed {
            key: key.to_owned(),
            source,
        }
        .into()
    })
}

impl Rooms {
    /// Appends to the room's log, broadcasts it without the token and pulls
    /// the log's TTL in line with the room's.
    pub async fn post(&self, auth: &RoomAuth, new: NewMessage) -> Result<Message, RoomError> {
        let sender = bounded("sender", &new.sender, self.policy.sender_max_len)?;
        let text = bounded("text", &new.text, self.policy.text_max_len)?;

        // the room may have expired since the guard looked
        if self.store.ttl(&meta_key(&auth.room_id)).await? == Ttl::Missing {
            return Err(RoomError::NotFound);
        }

        let message = Message {
            id: Uuid::now_v7().to_string(),
            sender,
            text,
            timestamp: now_millis(),
            room_id: auth.room_id.clone(),
            token: Some(auth.token.clone()),
        };

        let key = messages_key(&auth.room_id);
        let len = self.store.rpush(&key, encode(&key, &message)?).await?;
        if let Some(cap) = self.policy.history_cap.filter(|cap| len > *cap) {
            self.store.ltrim(&key, -(cap as i64), -1).await?;
        }

        let public = Message { token: None, ..message.clone() };
        self.publish(&auth.room_id, CHAT_MESSAGE, encode(&key, &public)?).await;

        self.cascade_ttl(&auth.room_id, &[&key]).await?;

        Ok(message)
    }

    /// The room's log in append order, with other participants' tokens removed.
    pub async fn history(&self, auth: &RoomAuth) -> Result<Vec<Message>, RoomError> {
        let key = messages_key(&auth.room_id);
        let start = self.policy.history_cap.map_or(0, |cap| -(cap as i64));

        let messages = self
            .store
            .lrange(&key, start, -1)
            .await?
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<Message>(raw) {
                Ok(message) => Some(message.redacted_for(&auth.token)),
                Err(err) => {
                    tracing::warn!(room_id = %auth.room_id, error = %err, "skipping malformed message");
                    None
                }
            })
            .collect();

        Ok(messages)
    }
}

#[derive(Serialize)]
pub(crate) struct History {
    messages: Vec<Message>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn history(State(rooms): State<Rooms>, auth: RoomAuth) -> AppResult<Json<History>> {
    let messages = rooms.history(&auth).await?;
    Ok(Json(History { messages }))
}

#[debug_handler(state = AppState)]
pub(crate) async fn post_message(
    State(rooms): State<Rooms>,
    auth: RoomAuth,
    Json(new): Json<NewMessage>,
) -> AppResult<Response> {
    rooms.post(&auth, new).await?;
    Ok(().into_response())
}

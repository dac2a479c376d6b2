use anyhow::anyhow;
use axum::{
    extract::{FromRequestParts, Query},
    http::request::Parts,
};
use serde::Deserialize;
use tower_sessions::Session;

use crate::{AppError, AppState, session::AUTH_TOKEN};

use super::{RoomError, Rooms};

/// A request whose token is admitted to `room_id`. Holding one is the only
/// way into room-scoped operations; extraction fails the request with 401.
#[derive(Debug, Clone)]
pub struct RoomAuth {
    pub room_id: String,
    pub token: String,
    pub connected: Vec<String>,
}

impl Rooms {
    pub async fn authorize(&self, room_id: Option<&str>, token: Option<&str>) -> Result<RoomAuth, RoomError> {
        let (Some(room_id), Some(token)) = (
            room_id.filter(|r| !r.is_empty()),
            token.filter(|t| !t.is_empty()),
        ) else {
            return Err(RoomError::Unauthorized);
        };

        let Some(meta) = self.meta(room_id).await? else {
            return Err(RoomError::Unauthorized);
        };

        if !meta.admits(token) {
            return Err(RoomError::Unauthorized);
        }

        Ok(RoomAuth {
            room_id: room_id.to_owned(),
            token: token.to_owned(),
            connected: meta.connected,
        })
    }
}

#[derive(Deserialize)]
struct RoomQuery {
    #[serde(rename = "roomId")]
    room_id: Option<String>,
}

/// `roomId` from the query string and the admission token from the session,
/// both unchecked.
pub(crate) struct Credentials {
    pub(crate) room_id: Option<String>,
    pub(crate) token: Option<String>,
}

impl FromRequestParts<AppState> for Credentials {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let room_id = Query::<RoomQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(query)| query.room_id);

        let session = Session::from_request_parts(parts, state)
            .await
            .map_err(|(_, reason)| anyhow!(reason))?;
        let token = session.get::<String>(AUTH_TOKEN).await?;

        Ok(Credentials { room_id, token })
    }
}

impl FromRequestParts<AppState> for RoomAuth {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Credentials { room_id, token } = Credentials::from_request_parts(parts, state).await?;

        Ok(state.rooms.authorize(room_id.as_deref(), token.as_deref()).await?)
    }
}

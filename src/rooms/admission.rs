use axum::{
    debug_handler,
    extract::{Path, State},
    response::{IntoResponse, Redirect, Response},
};
use tower_sessions::Session;

use crate::{AppResult, AppState, res, session::AUTH_TOKEN, store::BoundedAdd};

use super::{CONNECTED, RoomError, Rooms, meta_key};

/// Outcome of a successful room entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The presented token was already admitted; nothing changed.
    Member(String),
    /// A seat was free and this fresh token took it.
    Admitted(String),
}

impl Admission {
    pub fn token(&self) -> &str {
        match self {
            Admission::Member(token) | Admission::Admitted(token) => token,
        }
    }
}

impl Rooms {
    /// Lets `credential` in if it already holds a seat, otherwise hands out a
    /// new token as long as fewer than `max_participants` were ever admitted.
    ///
    /// The seat is taken with the store's atomic bounded add, so concurrent
    /// entries cannot push the room past capacity.
    pub async fn admit(&self, room_id: &str, credential: Option<&str>) -> Result<Admission, RoomError> {
        let Some(meta) = self.meta(room_id).await? else {
            return Err(RoomError::NotFound);
        };

        if let Some(token) = credential.filter(|token| meta.admits(token)) {
            return Ok(Admission::Member(token.to_owned()));
        }

        let limit = self.policy.max_participants;
        if meta.connected.len() >= limit {
            tracing::warn!(room_id, "entry refused, room full");
            return Err(RoomError::Full);
        }

        let token = self.ids.token();
        match self.store.hadd_bounded(&meta_key(room_id), CONNECTED, &token, limit).await? {
            BoundedAdd::Added(participants) => {
                tracing::info!(room_id, participants, "participant admitted");
                Ok(Admission::Admitted(token))
            }
            BoundedAdd::AlreadyMember => Ok(Admission::Admitted(token)),
            BoundedAdd::Full => {
                tracing::warn!(room_id, "entry refused, room filled up concurrently");
                Err(RoomError::Full)
            }
            BoundedAdd::Missing => Err(RoomError::NotFound),
        }
    }
}

#[debug_handler(state = AppState)]
pub(crate) async fn enter_room(
    State(rooms): State<Rooms>,
    session: Session,
    Path(room_id): Path<String>,
) -> AppResult<Response> {
    let credential = session.get::<String>(AUTH_TOKEN).await?;

    match rooms.admit(&room_id, credential.as_deref()).await {
        Ok(Admission::Member(_)) => {}
        Ok(Admission::Admitted(token)) => session.insert(AUTH_TOKEN, token).await?,
        Err(RoomError::NotFound) => return Ok(Redirect::to("/?error=room-not-found").into_response()),
        Err(RoomError::Full) => return Ok(Redirect::to("/?error=room-full").into_response()),
        Err(err) => return Err(err.into()),
    }

    Ok(res::room_page(&room_id).into_response())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::RoomPolicy,
        events::BroadcastChannels,
        ids::RandomIds,
        rooms::testing::fixture,
        store::{KvStore, MemoryStore},
    };

    #[tokio::test]
    async fn fills_up_to_capacity_then_refuses() {
        let f = fixture(RoomPolicy::default());
        let room_id = f.rooms.create().await.unwrap();

        for expected in ["t1", "t2", "t3"] {
            assert_eq!(f.rooms.admit(&room_id, None).await.unwrap(), Admission::Admitted(expected.to_owned()));
        }

        assert!(matches!(f.rooms.admit(&room_id, None).await, Err(RoomError::Full)));
        assert!(matches!(f.rooms.admit(&room_id, Some("stranger")).await, Err(RoomError::Full)));
    }

    #[tokio::test]
    async fn returning_member_is_let_in_without_a_new_seat() {
        let f = fixture(RoomPolicy::default());
        let room_id = f.rooms.create().await.unwrap();
        let token = f.rooms.admit(&room_id, None).await.unwrap().token().to_owned();

        for _ in 0..5 {
            assert_eq!(f.rooms.admit(&room_id, Some(&token)).await.unwrap(), Admission::Member(token.clone()));
        }

        let meta = f.rooms.meta(&room_id).await.unwrap().unwrap();
        assert_eq!(meta.connected, vec![token]);
    }

    #[tokio::test]
    async fn unknown_room_is_not_found_and_not_created() {
        let f = fixture(RoomPolicy::default());

        assert!(matches!(f.rooms.admit("nope", None).await, Err(RoomError::NotFound)));
        assert!(f.store.hgetall(&meta_key("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn token_from_another_room_gets_a_fresh_seat() {
        let f = fixture(RoomPolicy::default());
        let a = f.rooms.create().await.unwrap();
        let b = f.rooms.create().await.unwrap();

        let token_a = f.rooms.admit(&a, None).await.unwrap().token().to_owned();
        let entry_b = f.rooms.admit(&b, Some(&token_a)).await.unwrap();

        assert!(matches!(&entry_b, Admission::Admitted(t) if *t != token_a));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_entries_never_exceed_capacity() {
        let policy = RoomPolicy { max_participants: 3, ..RoomPolicy::default() };
        let rooms = Rooms::new(
            Arc::new(MemoryStore::new()),
            Arc::new(BroadcastChannels::new(8)),
            Arc::new(RandomIds),
            policy,
        );
        let room_id = rooms.create().await.unwrap();

        let joins: Vec<_> = (0..40)
            .map(|_| {
                let rooms = rooms.clone();
                let room_id = room_id.clone();
                tokio::spawn(async move { rooms.admit(&room_id, None).await })
            })
            .collect();

        let (mut admitted, mut full) = (0, 0);
        for join in joins {
            match join.await.unwrap() {
                Ok(Admission::Admitted(_)) => admitted += 1,
                Err(RoomError::Full) => full += 1,
                other => panic!("unexpected {other:?}"),
            }
        }

        assert_eq!(admitted, 3);
        assert_eq!(full, 37);
        assert_eq!(rooms.meta(&room_id).await.unwrap().unwrap().connected.len(), 3);
    }
}

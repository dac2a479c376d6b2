use axum::{
    debug_handler,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, Stream, StreamExt, stream};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{
    AppState,
    events::{CHAT_DESTROY, Event},
};

use super::{RoomAuth, Rooms};

/// Streams the room's events to an admitted participant until the room is
/// destroyed or either side hangs up. Incoming frames are ignored.
#[debug_handler(state = AppState)]
pub(crate) async fn room_events(
    State(rooms): State<Rooms>,
    auth: RoomAuth,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // subscribe before upgrading so nothing published meanwhile is lost
    let rx = rooms.events().subscribe(&auth.room_id);

    ws.on_upgrade(move |socket| forward(socket, rx, auth.room_id))
}

/// The room's events as WebSocket text frames. Ends after `chat.destroy` or
/// once the channel is closed.
fn outgoing(rx: broadcast::Receiver<Event>, room_id: String) -> impl Stream<Item = String> {
    stream::unfold(Some(rx), move |rx| {
        let room_id = room_id.clone();
        async move {
            let Some(mut rx) = rx else {
                return None;
            };
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        let rest = (event.event != CHAT_DESTROY).then_some(rx);
                        return Some((text, rest));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(room_id = %room_id, skipped, "subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        }
    })
}

async fn forward(socket: WebSocket, rx: broadcast::Receiver<Event>, room_id: String) {
    let (mut sender, mut receiver) = socket.split();

    let mut broadcast_task = tokio::spawn(async move {
        let mut frames = std::pin::pin!(outgoing(rx, room_id));
        while let Some(text) = frames.next().await {
            if sender.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }

        let _ = sender.close().await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let WsMessage::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut broadcast_task => recv_task.abort(),
        _ = &mut recv_task => broadcast_task.abort(),
    };
}

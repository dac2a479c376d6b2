//! Per-room event fan-out to connected clients.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

pub const CHAT_MESSAGE: &str = "chat.message";
pub const CHAT_DESTROY: &str = "chat.destroy";

/// What subscribers receive, serialized as `{"event": .., "data": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub event: String,
    pub data: Value,
}

/// Best-effort, at-most-once delivery to whoever is subscribed right now.
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Returns how many subscribers the event was handed to.
    async fn publish(&self, channel: &str, event: &str, payload: Value) -> anyhow::Result<usize>;

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Event>;

    /// Drops the channel; subscribers see the stream end after draining.
    fn close(&self, channel: &str);
}

pub struct BroadcastChannels {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<Event>>>,
}

impl BroadcastChannels {
    /// `capacity` is how many events a slow subscriber may lag before it starts missing some.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<Event>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EventChannel for BroadcastChannels {
    async fn publish(&self, channel: &str, event: &str, payload: Value) -> anyhow::Result<usize> {
        let mut channels = self.channels();

        let Some(tx) = channels.get(channel) else {
            return Ok(0);
        };

        let event = Event {
            event: event.to_owned(),
            data: payload,
        };

        match tx.send(event) {
            Ok(reached) => Ok(reached),
            Err(_) => {
                // everyone unsubscribed
                channels.remove(channel);
                Ok(0)
            }
        }
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Event> {
        let mut channels = self.channels();

        // rooms that expired on their own are never closed; drop them once nobody listens
        channels.retain(|_, tx| tx.receiver_count() > 0);

        channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    fn close(&self, channel: &str) {
        self.channels().remove(channel);
    }
}

/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Redis pub/sub backend for the status bus.
//!
//! Frames are published on one Redis channel per room
//! (`{ns}:room:{room}`); each web server runs one pattern subscriber that
//! fans incoming payloads out to the local connections joined to the room.
//! Cross-process delivery therefore costs one Redis hop regardless of
//! which server holds the subscriber's socket.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{StatusBus, StatusFrame};
use crate::error::BusError;

/// Payload exchanged on the wire: the derived channel plus the frame.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WirePayload {
    pub channel: String,
    pub frame: StatusFrame,
}

/// Redis implementation of [`StatusBus`].
#[derive(Clone)]
pub struct RedisStatusBus {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisStatusBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            namespace: "nivaran".to_string(),
        })
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn room_channel(&self, room: &str) -> String {
        format!("{}:room:{}", self.namespace, room)
    }
}

#[async_trait]
impl StatusBus for RedisStatusBus {
    async fn publish(
        &self,
        room: &str,
        channel: &str,
        frame: &StatusFrame,
    ) -> Result<(), BusError> {
        let payload = serde_json::to_string(&WirePayload {
            channel: channel.to_string(),
            frame: frame.clone(),
        })?;
        let mut conn = self.conn.clone();
        let _: () = conn.publish(self.room_channel(room), payload).await?;
        metrics::counter!("nivaran_bus_frames_published").increment(1);
        Ok(())
    }
}

type Connections = Vec<(u64, mpsc::UnboundedSender<String>)>;

#[derive(Default)]
struct Rooms {
    next_connection_id: u64,
    rooms: HashMap<String, Connections>,
}

/// Tracks which local connections have joined which rooms.
///
/// The registry lives on the web tier; one subscriber task per process
/// feeds it from Redis. Send failures (client went away) detach the
/// connection; frames published to empty rooms are dropped silently.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<RwLock<Rooms>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins a connection to a room, returning its id and the stream of
    /// raw frame payloads.
    pub fn join(&self, room: &str) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.inner.write();
        let id = rooms.next_connection_id;
        rooms.next_connection_id += 1;
        rooms.rooms.entry(room.to_string()).or_default().push((id, tx));
        debug!(room, connection = id, "Client joined room");
        (id, rx)
    }

    /// Detaches a connection from a room.
    pub fn leave(&self, room: &str, connection_id: u64) {
        let mut rooms = self.inner.write();
        if let Some(connections) = rooms.rooms.get_mut(room) {
            connections.retain(|(id, _)| *id != connection_id);
            if connections.is_empty() {
                rooms.rooms.remove(room);
            }
        }
        debug!(room, connection = connection_id, "Client left room");
    }

    /// Fans a payload out to every connection in the room. Dead
    /// connections are pruned; empty rooms swallow the payload.
    pub fn deliver(&self, room: &str, payload: &str) {
        let mut rooms = self.inner.write();
        if let Some(connections) = rooms.rooms.get_mut(room) {
            connections.retain(|(_, tx)| tx.send(payload.to_string()).is_ok());
            if connections.is_empty() {
                rooms.rooms.remove(room);
            }
        }
    }

    pub fn connection_count(&self, room: &str) -> usize {
        self.inner
            .read()
            .rooms
            .get(room)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Runs the per-process pattern subscriber, feeding the room registry
/// until the connection drops.
pub async fn run_subscriber(
    url: &str,
    namespace: &str,
    registry: RoomRegistry,
) -> Result<(), BusError> {
    let client = redis::Client::open(url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    let pattern = format!("{}:room:*", namespace);
    pubsub.psubscribe(&pattern).await?;
    let prefix = format!("{}:room:", namespace);

    let mut stream = pubsub.on_message();
    while let Some(message) = stream.next().await {
        let channel = message.get_channel_name().to_string();
        let Some(room) = channel.strip_prefix(&prefix) else {
            continue;
        };
        match message.get_payload::<String>() {
            Ok(payload) => registry.deliver(room, &payload),
            Err(e) => warn!(error = %e, "Undecodable bus payload"),
        }
    }

    warn!("Status bus subscriber stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_deliver_leave() {
        let registry = RoomRegistry::new();
        let (id, mut rx) = registry.join("GR-X-A");
        assert_eq!(registry.connection_count("GR-X-A"), 1);

        registry.deliver("GR-X-A", "payload-1");
        assert_eq!(rx.try_recv().unwrap(), "payload-1");

        registry.leave("GR-X-A", id);
        assert_eq!(registry.connection_count("GR-X-A"), 0);
    }

    #[test]
    fn test_deliver_to_empty_room_is_silent() {
        let registry = RoomRegistry::new();
        registry.deliver("GR-NOBODY-A", "payload");
        assert_eq!(registry.connection_count("GR-NOBODY-A"), 0);
    }

    #[test]
    fn test_dead_connections_are_pruned() {
        let registry = RoomRegistry::new();
        let (_id, rx) = registry.join("GR-X-A");
        drop(rx);
        registry.deliver("GR-X-A", "payload");
        assert_eq!(registry.connection_count("GR-X-A"), 0);
    }

    #[test]
    fn test_multiple_connections_same_room() {
        let registry = RoomRegistry::new();
        let (_a, mut rx_a) = registry.join("GR-X-A");
        let (_b, mut rx_b) = registry.join("GR-X-A");

        registry.deliver("GR-X-A", "frame");
        assert_eq!(rx_a.try_recv().unwrap(), "frame");
        assert_eq!(rx_b.try_recv().unwrap(), "frame");
    }
}

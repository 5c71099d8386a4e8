//! WebSocket connection and room registry.
//!
//! Tracks upgraded connections and their room memberships, and routes
//! stream events between sockets and a worker-backed forwarder. Outbound
//! delivery goes through a per-connection queue so a slow peer cannot
//! stall the registry or other peers.

use crate::error::{MembraneError, Result};
use crate::protocol::message::{self, StreamHeaders, EVENT_CLOSE, EVENT_CONNECT, EVENT_MESSAGE};
use crate::protocol::wire::{Frame, TYPE_STREAM_DATA};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-connection outbound queue depth.
pub const OUTBOUND_QUEUE: usize = 64;

/// Something that relays a stream frame to a worker and returns its reply.
///
/// Implemented by the worker pool; tests substitute their own.
pub trait StreamForwarder: Send + Sync + 'static {
    fn forward(&self, frame: Frame) -> impl Future<Output = Result<Frame>> + Send;
}

struct Connection {
    remote_addr: String,
    rooms: HashSet<String>,
    tx: mpsc::Sender<Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<String, Connection>,
    rooms: HashMap<String, HashSet<String>>,
}

/// Point-in-time registry metrics.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub total_rooms: usize,
}

/// Registry of live WebSocket connections and rooms.
pub struct Registry<F> {
    inner: RwLock<Inner>,
    forwarder: F,
    /// 0 means unlimited.
    max_connections: usize,
}

impl<F: StreamForwarder> Registry<F> {
    pub fn new(forwarder: F, max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            forwarder,
            max_connections,
        }
    }

    /// Register a connection and notify the worker. Returns the assigned
    /// connection id.
    pub async fn add(&self, remote_addr: String, tx: mpsc::Sender<Vec<u8>>) -> Result<String> {
        let id = generate_conn_id();
        {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            if self.max_connections > 0 && inner.connections.len() >= self.max_connections {
                return Err(MembraneError::ConnectionLimit {
                    max: self.max_connections,
                });
            }
            inner.connections.insert(
                id.clone(),
                Connection {
                    remote_addr,
                    rooms: HashSet::new(),
                    tx,
                },
            );
        }
        debug!(conn_id = %id, "websocket connection registered");

        let frame = message::encode_stream_data(
            0,
            &StreamHeaders {
                connection_id: id.clone(),
                event: EVENT_CONNECT.to_string(),
                room: String::new(),
            },
            Vec::new(),
        )?;
        if let Err(e) = self.forwarder.forward(frame).await {
            warn!(conn_id = %id, error = %e, "forwarding connect event");
        }
        Ok(id)
    }

    /// Drop a connection, purge its room memberships, and notify the
    /// worker. Unknown ids are ignored.
    pub async fn remove(&self, id: &str) {
        let existed = {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            match inner.connections.remove(id) {
                Some(conn) => {
                    for room in &conn.rooms {
                        let now_empty = inner
                            .rooms
                            .get_mut(room)
                            .map(|members| {
                                members.remove(id);
                                members.is_empty()
                            })
                            .unwrap_or(false);
                        if now_empty {
                            inner.rooms.remove(room);
                        }
                    }
                    true
                }
                None => false,
            }
        };
        if !existed {
            return;
        }
        debug!(conn_id = %id, "websocket connection removed");

        let frame = match message::encode_stream_data(
            0,
            &StreamHeaders {
                connection_id: id.to_string(),
                event: EVENT_CLOSE.to_string(),
                room: String::new(),
            },
            Vec::new(),
        ) {
            Ok(f) => f,
            Err(e) => {
                warn!(conn_id = %id, error = %e, "encoding close event");
                return;
            }
        };
        if let Err(e) = self.forwarder.forward(frame).await {
            warn!(conn_id = %id, error = %e, "forwarding close event");
        }
    }

    /// Relay an incoming message to the worker and route its reply: a
    /// non-empty room broadcasts, a non-empty connection id unicasts,
    /// anything else is dropped.
    pub async fn handle_message(&self, id: &str, data: Vec<u8>) -> Result<()> {
        let frame = message::encode_stream_data(
            0,
            &StreamHeaders {
                connection_id: id.to_string(),
                event: EVENT_MESSAGE.to_string(),
                room: String::new(),
            },
            data,
        )?;

        let reply = self.forwarder.forward(frame).await?;
        if reply.frame_type != TYPE_STREAM_DATA {
            return Ok(());
        }
        let (headers, payload) = message::decode_stream_data(reply)?;
        if !headers.room.is_empty() {
            self.broadcast_room(&headers.room, &payload, "");
        } else if !headers.connection_id.is_empty() {
            self.unicast(&headers.connection_id, &payload);
        }
        Ok(())
    }

    /// Add a connection to a room. Unknown connection ids are ignored.
    pub fn join(&self, id: &str, room: &str) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let inner = &mut *inner;
        let Some(conn) = inner.connections.get_mut(id) else {
            return;
        };
        inner
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(id.to_string());
        conn.rooms.insert(room.to_string());
    }

    /// Remove a connection from a room, deleting the room if it empties.
    pub fn leave(&self, id: &str, room: &str) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let inner = &mut *inner;
        let Some(conn) = inner.connections.get_mut(id) else {
            return;
        };
        conn.rooms.remove(room);
        let now_empty = inner
            .rooms
            .get_mut(room)
            .map(|members| {
                members.remove(id);
                members.is_empty()
            })
            .unwrap_or(false);
        if now_empty {
            inner.rooms.remove(room);
        }
    }

    /// Send to every member of a room except `exclude_id`. A failing send
    /// is logged and does not affect delivery to other members.
    pub fn broadcast_room(&self, room: &str, data: &[u8], exclude_id: &str) {
        let targets: Vec<(String, mpsc::Sender<Vec<u8>>)> = {
            let inner = self.inner.read().expect("registry lock poisoned");
            let Some(members) = inner.rooms.get(room) else {
                return;
            };
            members
                .iter()
                .filter(|m| m.as_str() != exclude_id)
                .filter_map(|m| inner.connections.get(m).map(|c| (m.clone(), c.tx.clone())))
                .collect()
        };
        for (conn_id, tx) in targets {
            if tx.try_send(data.to_vec()).is_err() {
                warn!(conn_id = %conn_id, room = %room, "broadcast send failed");
            }
        }
    }

    /// Send to a single connection.
    pub fn unicast(&self, id: &str, data: &[u8]) {
        let tx = {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner.connections.get(id).map(|c| c.tx.clone())
        };
        let Some(tx) = tx else {
            return;
        };
        if tx.try_send(data.to_vec()).is_err() {
            warn!(conn_id = %id, "send to connection failed");
        }
    }

    /// Send to every connection except `exclude_id`.
    pub fn broadcast_all(&self, data: &[u8], exclude_id: &str) {
        let targets: Vec<(String, mpsc::Sender<Vec<u8>>)> = {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner
                .connections
                .iter()
                .filter(|(id, _)| id.as_str() != exclude_id)
                .map(|(id, c)| (id.clone(), c.tx.clone()))
                .collect()
        };
        for (conn_id, tx) in targets {
            if tx.try_send(data.to_vec()).is_err() {
                warn!(conn_id = %conn_id, "broadcast send failed");
            }
        }
    }

    /// Remote address of a connection, if it is still registered.
    pub fn remote_addr(&self, id: &str) -> Option<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.connections.get(id).map(|c| c.remote_addr.clone())
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().expect("registry lock poisoned");
        RegistryStats {
            total_connections: inner.connections.len(),
            total_rooms: inner.rooms.len(),
        }
    }

    #[cfg(test)]
    fn rooms_of(&self, id: &str) -> HashSet<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .connections
            .get(id)
            .map(|c| c.rooms.clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn room_members(&self, room: &str) -> HashSet<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.rooms.get(room).cloned().unwrap_or_default()
    }
}

/// 128-bit random connection id, hex encoded.
fn generate_conn_id() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::encode_stream_data;

    /// Forwarder that answers every event with a frame of the configured
    /// shape.
    struct ScriptedForwarder {
        reply_room: String,
        reply_conn: String,
        reply_payload: Vec<u8>,
    }

    impl ScriptedForwarder {
        fn silent() -> Self {
            Self {
                reply_room: String::new(),
                reply_conn: String::new(),
                reply_payload: Vec::new(),
            }
        }
    }

    impl StreamForwarder for ScriptedForwarder {
        async fn forward(&self, _frame: Frame) -> Result<Frame> {
            encode_stream_data(
                0,
                &StreamHeaders {
                    connection_id: self.reply_conn.clone(),
                    event: EVENT_MESSAGE.to_string(),
                    room: self.reply_room.clone(),
                },
                self.reply_payload.clone(),
            )
            .map_err(Into::into)
        }
    }

    fn channel() -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        mpsc::channel(OUTBOUND_QUEUE)
    }

    #[tokio::test]
    async fn test_add_assigns_unique_hex_ids() {
        let registry = Registry::new(ScriptedForwarder::silent(), 0);
        let (tx, _rx) = channel();
        let a = registry.add("10.0.0.1:1".into(), tx.clone()).await.unwrap();
        let b = registry.add("10.0.0.2:2".into(), tx).await.unwrap();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
        assert_eq!(registry.stats().total_connections, 2);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let registry = Registry::new(ScriptedForwarder::silent(), 1);
        let (tx, _rx) = channel();
        registry.add("10.0.0.1:1".into(), tx.clone()).await.unwrap();
        let err = registry.add("10.0.0.2:2".into(), tx).await.unwrap_err();
        assert!(matches!(err, MembraneError::ConnectionLimit { max: 1 }));
    }

    #[tokio::test]
    async fn test_room_membership_stays_symmetric() {
        let registry = Registry::new(ScriptedForwarder::silent(), 0);
        let (tx, _rx) = channel();
        let id = registry.add("10.0.0.1:1".into(), tx).await.unwrap();

        registry.join(&id, "lobby");
        registry.join(&id, "game-7");
        assert!(registry.rooms_of(&id).contains("lobby"));
        assert!(registry.room_members("lobby").contains(&id));
        assert!(registry.room_members("game-7").contains(&id));

        registry.leave(&id, "lobby");
        assert!(!registry.rooms_of(&id).contains("lobby"));
        assert!(registry.room_members("lobby").is_empty());
        // The emptied room is deleted outright.
        assert_eq!(registry.stats().total_rooms, 1);
    }

    #[tokio::test]
    async fn test_remove_purges_all_rooms() {
        let registry = Registry::new(ScriptedForwarder::silent(), 0);
        let (tx, _rx) = channel();
        let id = registry.add("10.0.0.1:1".into(), tx.clone()).await.unwrap();
        let other = registry.add("10.0.0.2:2".into(), tx).await.unwrap();

        registry.join(&id, "lobby");
        registry.join(&id, "game-7");
        registry.join(&other, "lobby");

        registry.remove(&id).await;
        assert!(!registry.room_members("lobby").contains(&id));
        assert!(registry.room_members("lobby").contains(&other));
        // game-7 emptied and was deleted.
        assert_eq!(registry.stats().total_rooms, 1);
        assert_eq!(registry.stats().total_connections, 1);
    }

    #[tokio::test]
    async fn test_broadcast_room_excludes_sender_and_survives_dead_peer() {
        let registry = Registry::new(ScriptedForwarder::silent(), 0);
        let (tx_a, mut rx_a) = channel();
        let (tx_b, rx_b) = channel();
        let (tx_c, mut rx_c) = channel();
        let a = registry.add("10.0.0.1:1".into(), tx_a).await.unwrap();
        let b = registry.add("10.0.0.2:2".into(), tx_b).await.unwrap();
        let c = registry.add("10.0.0.3:3".into(), tx_c).await.unwrap();
        registry.join(&a, "lobby");
        registry.join(&b, "lobby");
        registry.join(&c, "lobby");

        // b's receiver is gone; its sends fail.
        drop(rx_b);

        registry.broadcast_room("lobby", b"announcement", &a);
        assert_eq!(rx_c.recv().await.unwrap(), b"announcement");
        assert!(rx_a.try_recv().is_err(), "sender must not receive its own broadcast");
    }

    #[tokio::test]
    async fn test_handle_message_routes_room_reply() {
        let forwarder = ScriptedForwarder {
            reply_room: "lobby".to_string(),
            reply_conn: String::new(),
            reply_payload: b"from-worker".to_vec(),
        };
        let registry = Registry::new(forwarder, 0);
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        let a = registry.add("10.0.0.1:1".into(), tx_a).await.unwrap();
        let b = registry.add("10.0.0.2:2".into(), tx_b).await.unwrap();
        registry.join(&a, "lobby");
        registry.join(&b, "lobby");

        registry.handle_message(&a, b"hello".to_vec()).await.unwrap();
        assert_eq!(rx_a.recv().await.unwrap(), b"from-worker");
        assert_eq!(rx_b.recv().await.unwrap(), b"from-worker");
    }

    /// Forwarder that unicasts the payload back to whoever sent it.
    struct EchoForwarder;

    impl StreamForwarder for EchoForwarder {
        async fn forward(&self, frame: Frame) -> Result<Frame> {
            let (headers, payload) = message::decode_stream_data(frame)?;
            if headers.event != EVENT_MESSAGE {
                return encode_stream_data(0, &StreamHeaders::default(), Vec::new())
                    .map_err(Into::into);
            }
            encode_stream_data(
                0,
                &StreamHeaders {
                    connection_id: headers.connection_id,
                    event: EVENT_MESSAGE.to_string(),
                    room: String::new(),
                },
                payload,
            )
            .map_err(Into::into)
        }
    }

    #[tokio::test]
    async fn test_handle_message_routes_unicast_reply() {
        let registry = Registry::new(EchoForwarder, 0);
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        let a = registry.add("10.0.0.1:1".into(), tx_a).await.unwrap();
        let _b = registry.add("10.0.0.2:2".into(), tx_b).await.unwrap();

        registry.handle_message(&a, b"just me".to_vec()).await.unwrap();
        assert_eq!(rx_a.recv().await.unwrap(), b"just me");
        assert!(rx_b.try_recv().is_err(), "unicast must not reach other peers");
    }

    #[tokio::test]
    async fn test_broadcast_all_excludes_one() {
        let registry = Registry::new(ScriptedForwarder::silent(), 0);
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        let a = registry.add("10.0.0.1:1".into(), tx_a).await.unwrap();
        let _b = registry.add("10.0.0.2:2".into(), tx_b).await.unwrap();

        registry.broadcast_all(b"tick", &a);
        assert_eq!(rx_b.recv().await.unwrap(), b"tick");
        assert!(rx_a.try_recv().is_err());
    }
}

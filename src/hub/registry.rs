//! Connection Registry
//!
//! Tracks every live connection: its outbound queue, receive buffer,
//! handshake state, subscriptions and activity timestamps.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::channel::ChannelManager;
use crate::protocol::MessageAssembler;

/// Unique identifier for a connection, allocated in increasing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a connection's I/O tasks
///
/// Bytes pushed through [`send`](Self::send) are written in order by the
/// connection's writer task. Dropping the handle closes the queue, which lets
/// the writer flush what is left and shut the socket down, and aborts the
/// reader task.
#[derive(Debug)]
pub struct ConnectionHandle {
    sender: mpsc::UnboundedSender<Bytes>,
    reader: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            sender,
            reader: None,
        }
    }

    pub fn with_reader(sender: mpsc::UnboundedSender<Bytes>, reader: JoinHandle<()>) -> Self {
        Self {
            sender,
            reader: Some(reader),
        }
    }

    /// Queue bytes for writing; false once the writer has gone away
    pub fn send(&self, bytes: Bytes) -> bool {
        self.sender.send(bytes).is_ok()
    }

    /// Stop reading and let the writer drain and shut down
    pub fn close(self) {}
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// A live connection
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub peer: Option<SocketAddr>,
    handle: ConnectionHandle,
    /// Set once the HTTP Upgrade has been answered with 101
    pub handshake_complete: bool,
    /// Inbound bytes not yet consumed by the handshake or frame decoder
    pub receive_buffer: BytesMut,
    pub subscribed_channels: HashSet<String>,
    pub last_activity: Instant,
    /// When the keepalive ping for the current idle period went out
    pub last_ping_sent: Option<Instant>,
    pub connected_at: DateTime<Utc>,
    pub assembler: MessageAssembler,
}

impl Connection {
    pub fn new(id: ConnectionId, handle: ConnectionHandle, max_message_size: usize) -> Self {
        Self {
            id,
            peer: None,
            handle,
            handshake_complete: false,
            receive_buffer: BytesMut::new(),
            subscribed_channels: HashSet::new(),
            last_activity: Instant::now(),
            last_ping_sent: None,
            connected_at: Utc::now(),
            assembler: MessageAssembler::new(max_message_size),
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn send(&self, bytes: impl Into<Bytes>) -> bool {
        self.handle.send(bytes.into())
    }

    /// Record inbound activity
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_ping_sent = None;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscribed_channels.contains(channel)
    }

    pub fn into_handle(self) -> ConnectionHandle {
        self.handle
    }
}

/// All live connections, keyed by id
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    next_id: u64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            next_id: 1,
        }
    }

    /// Reserve the next id; ids are never reused
    pub fn allocate_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn register(&mut self, connection: Connection) {
        tracing::info!(
            connection_id = %connection.id,
            peer = ?connection.peer,
            total = self.connections.len() + 1,
            "Connection registered"
        );
        self.connections.insert(connection.id, connection);
    }

    /// Remove a connection and detach it from every channel it joined
    ///
    /// Returns the removed connection so the caller can close its handle.
    /// Unknown ids return `None`, which makes repeated calls harmless.
    pub fn unregister(
        &mut self,
        id: ConnectionId,
        channels: &mut ChannelManager,
    ) -> Option<Connection> {
        let connection = self.connections.remove(&id)?;
        channels.remove_connection(id, &connection.subscribed_channels);

        tracing::debug!(
            connection_id = %id,
            remaining = self.connections.len(),
            "Connection unregistered"
        );
        Some(connection)
    }

    pub fn touch(&mut self, id: ConnectionId) -> bool {
        match self.connections.get_mut(&id) {
            Some(connection) => {
                connection.touch();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Snapshot of live ids, safe to iterate while disconnecting
    pub fn all(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connections with no inbound activity for longer than `threshold`
    pub fn idle_connections(&self, now: Instant, threshold: Duration) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .connections
            .values()
            .filter(|c| c.idle_for(now) > threshold)
            .map(|c| c.id)
            .collect();
        ids.sort();
        ids
    }

    /// Queue bytes for one connection; false if unknown or its writer is gone
    pub fn send_to(&self, id: ConnectionId, bytes: impl Into<Bytes>) -> bool {
        self.connections
            .get(&id)
            .map_or(false, |connection| connection.send(bytes))
    }
}

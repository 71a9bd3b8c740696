//! Hub state
//!
//! [`Hub`] bundles the registry, channels and dispatcher, and implements the
//! application half of the server: envelope dispatch, publishing, the
//! disconnection procedure and keepalive sweeps. It never touches sockets;
//! bytes go out through each connection's queue.

use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use std::fmt;
use std::time::{Duration, Instant};

use super::channel::{BroadcastOptions, ChannelManager, ChannelOptions, UserId};
use super::error::{HubError, HubResult};
use super::events::{self, EventDispatcher, EventHook, HookContext, HookId};
use super::messages::{ClientMessage, ServerMessage};
use super::registry::{ConnectionId, ConnectionRegistry};
use crate::config::Config;
use crate::protocol::{close_code, frame, HandshakeError, ProtocolError};

/// Limits and timers the hub enforces
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of concurrent connections
    pub max_clients: usize,
    /// Largest accepted message, after reassembly
    pub max_message_size: usize,
    /// Idle time before a keepalive ping; twice this evicts
    pub ping_interval: Duration,
    /// Whether idle connections are pinged before eviction
    pub keepalive_pings: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_clients: 1000,
            max_message_size: 1024 * 1024,
            ping_interval: Duration::from_secs(30),
            keepalive_pings: true,
        }
    }
}

impl From<&Config> for HubConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_clients: config.server.max_clients,
            max_message_size: config.security.max_message_size,
            ping_interval: Duration::from_secs(config.server.ping_interval_secs),
            keepalive_pings: config.server.keepalive_pings,
        }
    }
}

/// Why a connection went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the TCP stream
    PeerClosed,
    /// The peer sent a close frame, with its status code if any
    CloseFrame(Option<u16>),
    ReadError(String),
    WriteError(String),
    Tls(String),
    Protocol(ProtocolError),
    HandshakeRejected(HandshakeError),
    Timeout,
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::PeerClosed => write!(f, "peer closed connection"),
            DisconnectReason::CloseFrame(Some(code)) => write!(f, "close frame ({})", code),
            DisconnectReason::CloseFrame(None) => write!(f, "close frame"),
            DisconnectReason::ReadError(e) => write!(f, "read error: {}", e),
            DisconnectReason::WriteError(e) => write!(f, "write error: {}", e),
            DisconnectReason::Tls(e) => write!(f, "TLS error: {}", e),
            DisconnectReason::Protocol(e) => write!(f, "protocol error: {}", e),
            DisconnectReason::HandshakeRejected(e) => write!(f, "handshake rejected: {}", e),
            DisconnectReason::Timeout => write!(f, "idle timeout"),
            DisconnectReason::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// Everything the reactor owns
#[derive(Debug)]
pub struct Hub {
    pub registry: ConnectionRegistry,
    pub channels: ChannelManager,
    pub dispatcher: EventDispatcher,
    config: HubConfig,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            channels: ChannelManager::new(),
            dispatcher: EventDispatcher::new(),
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Whether a new connection would exceed `max_clients`
    pub fn is_full(&self) -> bool {
        self.registry.len() >= self.config.max_clients
    }

    /// Register a global hook
    pub fn on<F>(&mut self, event: &str, hook: F) -> HookId
    where
        F: Fn(&HookContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_hook(event, hook, None)
    }

    /// Register a hook scoped to one channel
    pub fn on_channel<F>(&mut self, channel: &str, event: &str, hook: F) -> HookId
    where
        F: Fn(&HookContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_hook(event, hook, Some(channel))
    }

    /// Register any [`EventHook`] implementation
    pub fn on_hook<H>(&mut self, event: &str, hook: H, channel: Option<&str>) -> HookId
    where
        H: EventHook + 'static,
    {
        self.dispatcher
            .on(&mut self.channels, event, Box::new(hook), channel)
    }

    pub fn off(&mut self, id: HookId) -> bool {
        self.dispatcher.off(&mut self.channels, id)
    }

    pub fn define_function<F>(&mut self, name: &str, function: F)
    where
        F: Fn(Value, ConnectionId) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.dispatcher.define_function(name, Box::new(function));
    }

    pub fn create_channel(&mut self, name: &str, options: ChannelOptions) -> bool {
        self.channels.create(name, options)
    }

    pub fn trigger(&self, event: &str, data: &Value, connection: Option<ConnectionId>) -> usize {
        self.dispatcher
            .trigger(&self.registry, &self.channels, event, data, connection)
    }

    /// Subscribe and fire `channel.subscribe` if the connection was not
    /// already a member
    ///
    /// Returns whether the connection was newly added.
    pub fn subscribe(
        &mut self,
        id: ConnectionId,
        channel: &str,
        user_id: Option<UserId>,
    ) -> HubResult<bool> {
        let added = self
            .channels
            .subscribe(&mut self.registry, id, channel, user_id.clone())?;
        if added {
            self.trigger(
                events::CHANNEL_SUBSCRIBE,
                &json!({ "channel": channel, "connection": id, "userId": user_id }),
                Some(id),
            );
        }
        Ok(added)
    }

    /// Fire `channel.unsubscribe` while still subscribed, then leave
    pub fn unsubscribe(&mut self, id: ConnectionId, channel: &str, user_id: Option<&str>) -> bool {
        if !self.channels.is_subscribed(id, channel) {
            return false;
        }
        self.trigger(
            events::CHANNEL_UNSUBSCRIBE,
            &json!({ "channel": channel, "connection": id, "userId": user_id }),
            Some(id),
        );
        self.channels
            .unsubscribe(&mut self.registry, id, channel, user_id)
    }

    /// Broadcast `data` wrapped in a `message` envelope
    pub fn broadcast(&self, channel: &str, data: Value, options: &BroadcastOptions) -> usize {
        match ServerMessage::message(channel, data).to_json() {
            Ok(payload) => self
                .channels
                .broadcast(&self.registry, channel, &payload, options),
            Err(e) => {
                tracing::error!(channel = %channel, error = %e, "Failed to serialize broadcast");
                0
            }
        }
    }

    /// Send `data` in a `message` envelope to every upgraded connection
    ///
    /// `only_users` filters on the user ids connections subscribed with, on
    /// any channel.
    pub fn broadcast_all(&self, data: Value, options: &BroadcastOptions) -> usize {
        let payload = match ServerMessage::message_to_all(data).to_json() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize broadcast");
                return 0;
            }
        };

        let bytes = Bytes::from(frame::text(&payload));
        let mut delivered = 0;
        for connection in self.registry.iter() {
            if !connection.handshake_complete || options.exclude.contains(&connection.id) {
                continue;
            }
            if let Some(users) = &options.only_users {
                let tracked = connection.subscribed_channels.iter().any(|name| {
                    self.channels
                        .get(name)
                        .and_then(|channel| channel.user_of(connection.id))
                        .map_or(false, |user| users.contains(user))
                });
                if !tracked {
                    continue;
                }
            }
            if connection.send(bytes.clone()) {
                delivered += 1;
            }
        }

        tracing::trace!(delivered, "Broadcast to all connections");
        delivered
    }

    /// Send a named event to the subscribers of the channel of the same name
    pub fn emit(&self, event: &str, data: Value, options: &BroadcastOptions) -> usize {
        match ServerMessage::event(event, data).to_json() {
            Ok(payload) => self
                .channels
                .broadcast(&self.registry, event, &payload, options),
            Err(e) => {
                tracing::error!(event = %event, error = %e, "Failed to serialize event");
                0
            }
        }
    }

    /// Publish on behalf of a client and fire `message.sent`
    pub fn publish(
        &mut self,
        from: ConnectionId,
        channel: &str,
        data: Value,
        exclude_self: bool,
    ) -> HubResult<usize> {
        if let Some(existing) = self.channels.get(channel) {
            if existing.options.private && !existing.has_subscriber(from) {
                return Err(HubError::PrivateChannel(channel.to_string()));
            }
        }

        let options = if exclude_self {
            BroadcastOptions::default().excluding(from)
        } else {
            BroadcastOptions::default()
        };
        let delivered = self.broadcast(channel, data.clone(), &options);

        self.trigger(
            events::MESSAGE_SENT,
            &json!({ "channel": channel, "data": data, "recipients": delivered }),
            Some(from),
        );
        Ok(delivered)
    }

    /// Queue an envelope for one connection
    pub fn send(&self, id: ConnectionId, message: &ServerMessage) -> bool {
        match message.to_json() {
            Ok(payload) => self.registry.send_to(id, frame::text(&payload)),
            Err(e) => {
                tracing::error!(connection_id = %id, error = %e, "Failed to serialize message");
                false
            }
        }
    }

    /// Send an `error` envelope and fire the `error` event
    pub fn send_error(&self, id: ConnectionId, message: &str) {
        tracing::debug!(connection_id = %id, error = message, "Sending error to client");
        self.send(id, &ServerMessage::error(message));
        self.trigger(
            events::ERROR,
            &json!({ "connection": id, "message": message }),
            Some(id),
        );
    }

    /// Act on one decoded client envelope
    ///
    /// `raw` is the envelope as received and is what `message.received`
    /// hooks see.
    pub fn handle_client_message(&mut self, id: ConnectionId, raw: &Value, message: ClientMessage) {
        self.trigger(events::MESSAGE_RECEIVED, raw, Some(id));

        match message {
            ClientMessage::Subscribe { channel, user_id } => {
                match self.subscribe(id, &channel, user_id) {
                    Ok(_) => {
                        self.send(id, &ServerMessage::Subscribed { channel });
                    }
                    Err(e) => self.send_error(id, &e.to_string()),
                }
            }
            ClientMessage::Unsubscribe { channel, user_id } => {
                self.unsubscribe(id, &channel, user_id.as_deref());
                self.send(id, &ServerMessage::Unsubscribed { channel });
            }
            ClientMessage::Publish {
                channel,
                data,
                exclude_self,
            } => {
                if let Err(e) = self.publish(id, &channel, data, exclude_self) {
                    self.send_error(id, &e.to_string());
                }
            }
            ClientMessage::Call { function, params } => {
                match self.dispatcher.call_function(&function, params, id) {
                    Ok(result) => {
                        self.send(id, &ServerMessage::FunctionResult { function, result });
                    }
                    Err(e) => self.send_error(id, &e.to_string()),
                }
            }
            ClientMessage::Event { name, data } => {
                self.trigger(&name, &data, Some(id));
            }
            ClientMessage::CreateChannel { channel, options } => {
                let created = self.channels.create(&channel, options);
                self.send(id, &ServerMessage::ChannelCreated { channel, created });
            }
            ClientMessage::Unrecognized => {
                tracing::debug!(connection_id = %id, "Ignoring unrecognized message type");
            }
        }
    }

    /// Send a close frame if the connection is upgraded, then disconnect
    pub fn close(&mut self, id: ConnectionId, code: u16, reason: DisconnectReason) -> bool {
        if let Some(connection) = self.registry.get(id) {
            if connection.handshake_complete {
                connection.send(frame::close(code, &reason.to_string()));
            }
        }
        self.disconnect(id, reason)
    }

    /// Leave every channel, drop from the registry, close the handle and
    /// fire `connection.close`
    ///
    /// Returns false if the connection was already gone.
    pub fn disconnect(&mut self, id: ConnectionId, reason: DisconnectReason) -> bool {
        let Some(connection) = self.registry.unregister(id, &mut self.channels) else {
            return false;
        };

        let mut channels: Vec<String> = connection.subscribed_channels.iter().cloned().collect();
        channels.sort();
        let opened = connection.handshake_complete;
        let lifetime = (Utc::now() - connection.connected_at).num_seconds();
        connection.into_handle().close();

        tracing::info!(
            connection_id = %id,
            reason = %reason,
            channels = channels.len(),
            lifetime_secs = lifetime,
            "Connection closed"
        );

        self.trigger(
            events::CONNECTION_CLOSE,
            &json!({
                "connection": id,
                "reason": reason.to_string(),
                "channels": channels,
                "handshake": opened,
            }),
            Some(id),
        );
        true
    }

    /// Evict connections idle past twice the ping interval, and ping those
    /// idle past it once per idle period
    ///
    /// Returns the evicted ids.
    pub fn sweep(&mut self, now: Instant) -> Vec<ConnectionId> {
        let interval = self.config.ping_interval;
        let evicted = self.registry.idle_connections(now, interval * 2);
        for id in &evicted {
            tracing::warn!(connection_id = %id, "Evicting idle connection");
            self.close(*id, close_code::GOING_AWAY, DisconnectReason::Timeout);
        }

        if self.config.keepalive_pings {
            for connection in self.registry.iter_mut() {
                if connection.handshake_complete
                    && connection.last_ping_sent.is_none()
                    && connection.idle_for(now) > interval
                {
                    tracing::trace!(connection_id = %connection.id, "Sending keepalive ping");
                    connection.send(frame::ping(&[]));
                    connection.last_ping_sent = Some(now);
                }
            }
        }

        evicted
    }

    /// Close every connection with 1001
    pub fn shutdown(&mut self) {
        let ids = self.registry.all();
        tracing::info!(connections = ids.len(), "Closing all connections");
        for id in ids {
            self.close(id, close_code::GOING_AWAY, DisconnectReason::Shutdown);
        }
    }
}

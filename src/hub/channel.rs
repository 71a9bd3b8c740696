//! Channels and Subscriptions
//!
//! A channel is a named group of subscribers that receive scoped broadcasts.
//! Membership is kept in step on both sides: every method that changes a
//! channel's subscriber map also updates the connection's
//! `subscribed_channels`, which is why they take the registry by `&mut`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::error::{HubError, HubResult};
use super::events::HookTable;
use super::registry::{ConnectionId, ConnectionRegistry};
use crate::protocol::frame;

/// Application-level user identity attached to a subscription
pub type UserId = String;

/// Per-channel options, as sent in `createChannel`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelOptions {
    /// Subscriber limit; 0 means unlimited
    pub max_clients: usize,
    /// Only subscribers may publish
    pub private: bool,
    /// Keep the channel when its last subscriber leaves
    pub persistent: bool,
}

/// A named subscriber group
#[derive(Debug)]
pub struct Channel {
    pub name: String,
    pub options: ChannelOptions,
    pub created_at: DateTime<Utc>,
    /// Subscriber → user id it subscribed under
    subscribers: HashMap<ConnectionId, Option<UserId>>,
    pub(crate) hooks: HookTable,
}

impl Channel {
    fn new(name: &str, options: ChannelOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            created_at: Utc::now(),
            subscribers: HashMap::new(),
            hooks: HookTable::default(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn has_subscriber(&self, id: ConnectionId) -> bool {
        self.subscribers.contains_key(&id)
    }

    pub fn user_of(&self, id: ConnectionId) -> Option<&str> {
        self.subscribers.get(&id).and_then(|user| user.as_deref())
    }

    pub fn subscribers(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.subscribers.keys().copied()
    }

    fn is_full(&self) -> bool {
        self.options.max_clients > 0 && self.subscribers.len() >= self.options.max_clients
    }

    /// Empty channels are dropped unless persistent or carrying hooks
    fn is_collectable(&self) -> bool {
        self.subscribers.is_empty() && !self.options.persistent && self.hooks.is_empty()
    }
}

/// Delivery filter for [`ChannelManager::broadcast`]
#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    pub exclude: HashSet<ConnectionId>,
    /// When set, only subscribers tracked under one of these user ids
    pub only_users: Option<HashSet<UserId>>,
}

impl BroadcastOptions {
    pub fn excluding(mut self, id: ConnectionId) -> Self {
        self.exclude.insert(id);
        self
    }

    pub fn only_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        self.only_users = Some(users.into_iter().map(Into::into).collect());
        self
    }

    fn admits(&self, id: ConnectionId, user: Option<&str>) -> bool {
        if self.exclude.contains(&id) {
            return false;
        }
        match &self.only_users {
            Some(users) => user.map_or(false, |u| users.contains(u)),
            None => true,
        }
    }
}

/// Owns every channel by name
#[derive(Debug, Default)]
pub struct ChannelManager {
    channels: HashMap<String, Channel>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a channel; returns false (and keeps the old options) if it exists
    pub fn create(&mut self, name: &str, options: ChannelOptions) -> bool {
        if self.channels.contains_key(name) {
            return false;
        }
        tracing::info!(channel = %name, ?options, "Channel created");
        self.channels
            .insert(name.to_string(), Channel::new(name, options));
        true
    }

    pub(crate) fn get_or_create(&mut self, name: &str) -> &mut Channel {
        self.channels.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(channel = %name, "Channel created on demand");
            Channel::new(name, ChannelOptions::default())
        })
    }

    /// Subscribe a connection, creating the channel with default options if needed
    ///
    /// Returns whether the connection was newly added. Subscribing twice
    /// succeeds without change, except that a later subscribe with a user id
    /// updates the tracked user.
    pub fn subscribe(
        &mut self,
        registry: &mut ConnectionRegistry,
        id: ConnectionId,
        name: &str,
        user_id: Option<UserId>,
    ) -> HubResult<bool> {
        let connection = registry
            .get_mut(id)
            .ok_or(HubError::ConnectionNotFound(id))?;
        let channel = self.get_or_create(name);

        if let Some(tracked) = channel.subscribers.get_mut(&id) {
            if user_id.is_some() {
                *tracked = user_id;
            }
            return Ok(false);
        }

        if channel.is_full() {
            tracing::warn!(
                connection_id = %id,
                channel = %name,
                limit = channel.options.max_clients,
                "Channel is full"
            );
            return Err(HubError::ChannelFull {
                channel: name.to_string(),
                limit: channel.options.max_clients,
            });
        }

        channel.subscribers.insert(id, user_id);
        connection.subscribed_channels.insert(name.to_string());

        tracing::debug!(
            connection_id = %id,
            channel = %name,
            subscribers = channel.subscribers.len(),
            "Subscribed"
        );
        Ok(true)
    }

    /// Remove a subscription from both sides; false if there was none
    ///
    /// A `user_id` that differs from the tracked one is logged; the
    /// subscription is removed either way.
    pub fn unsubscribe(
        &mut self,
        registry: &mut ConnectionRegistry,
        id: ConnectionId,
        name: &str,
        user_id: Option<&str>,
    ) -> bool {
        if let Some(connection) = registry.get_mut(id) {
            connection.subscribed_channels.remove(name);
        }

        let Some(channel) = self.channels.get_mut(name) else {
            return false;
        };
        let Some(tracked) = channel.subscribers.remove(&id) else {
            return false;
        };

        if let (Some(given), Some(tracked)) = (user_id, tracked.as_deref()) {
            if given != tracked {
                tracing::debug!(
                    connection_id = %id,
                    channel = %name,
                    given,
                    tracked,
                    "Unsubscribe user id does not match subscription"
                );
            }
        }

        tracing::debug!(connection_id = %id, channel = %name, "Unsubscribed");
        self.collect(name);
        true
    }

    /// Send a text payload to every admitted subscriber
    ///
    /// The frame is encoded once. Returns how many subscribers it was queued
    /// for; a failed queue does not stop delivery to the rest.
    pub fn broadcast(
        &self,
        registry: &ConnectionRegistry,
        name: &str,
        payload: &str,
        options: &BroadcastOptions,
    ) -> usize {
        let Some(channel) = self.channels.get(name) else {
            tracing::warn!(channel = %name, "Broadcast to unknown channel");
            return 0;
        };

        let bytes = Bytes::from(frame::text(payload));
        let mut delivered = 0;
        for (id, user) in &channel.subscribers {
            if !options.admits(*id, user.as_deref()) {
                continue;
            }
            if registry.send_to(*id, bytes.clone()) {
                delivered += 1;
            } else {
                tracing::debug!(connection_id = %id, channel = %name, "Broadcast delivery failed");
            }
        }

        tracing::trace!(channel = %name, delivered, "Broadcast");
        delivered
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.channels
            .get(name)
            .map(Channel::subscriber_count)
            .unwrap_or(0)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.get_mut(name)
    }

    /// Channel names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn is_subscribed(&self, id: ConnectionId, name: &str) -> bool {
        self.channels
            .get(name)
            .map_or(false, |channel| channel.has_subscriber(id))
    }

    /// Drop a departing connection from the given channels
    ///
    /// Called by the registry while unregistering, after the connection has
    /// already left the registry.
    pub(crate) fn remove_connection(&mut self, id: ConnectionId, names: &HashSet<String>) {
        for name in names {
            if let Some(channel) = self.channels.get_mut(name) {
                channel.subscribers.remove(&id);
            }
            self.collect(name);
        }
    }

    /// Remove the channel if it has become collectable
    pub(crate) fn collect(&mut self, name: &str) {
        if self
            .channels
            .get(name)
            .map_or(false, Channel::is_collectable)
        {
            self.channels.remove(name);
            tracing::debug!(channel = %name, "Empty channel removed");
        }
    }
}

//! Application Message Types
//!
//! JSON envelopes carried in text frames between clients and the server.

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::channel::ChannelOptions;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join a channel, creating it if needed
    Subscribe {
        channel: String,
        #[serde(default, rename = "userId", deserialize_with = "user_id")]
        user_id: Option<String>,
    },
    /// Leave a channel
    Unsubscribe {
        channel: String,
        #[serde(default, rename = "userId", deserialize_with = "user_id")]
        user_id: Option<String>,
    },
    /// Broadcast `data` to the channel's subscribers
    Publish {
        channel: String,
        #[serde(default)]
        data: Value,
        #[serde(default, rename = "excludeSelf")]
        exclude_self: bool,
    },
    /// Invoke a registered function
    Call {
        function: String,
        #[serde(default)]
        params: Value,
    },
    /// Fire a custom event through the dispatcher
    Event {
        #[serde(alias = "event")]
        name: String,
        #[serde(default)]
        data: Value,
    },
    /// Create a channel with options
    CreateChannel {
        channel: String,
        #[serde(default)]
        options: ChannelOptions,
    },
    /// Any other `type`
    #[serde(other)]
    Unrecognized,
}

/// User ids may arrive as strings or numbers
fn user_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    }))
}

/// Parse a text payload into its raw JSON and typed envelope
///
/// Returns `None` for anything that is not a JSON object with a string `type`,
/// or whose fields do not match the declared type.
pub fn parse_envelope(text: &str) -> Option<(Value, ClientMessage)> {
    let value: Value = serde_json::from_str(text).ok()?;
    if !value.get("type").map_or(false, Value::is_string) {
        return None;
    }
    let message = serde_json::from_value(value.clone()).ok()?;
    Some((value, message))
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "subscribed")]
    Subscribed { channel: String },

    #[serde(rename = "unsubscribed")]
    Unsubscribed { channel: String },

    #[serde(rename = "channel.created")]
    ChannelCreated { channel: String, created: bool },

    #[serde(rename = "function.result")]
    FunctionResult { function: String, result: Value },

    #[serde(rename = "error")]
    Error { message: String },

    /// Broadcast; `channel` is null when sent to every client and
    /// `timestamp` is Unix seconds
    #[serde(rename = "message")]
    Message {
        channel: Option<String>,
        data: Value,
        timestamp: i64,
    },

    /// Server-emitted named event; `timestamp` is RFC 3339
    #[serde(rename = "event")]
    Event {
        event: String,
        data: Value,
        timestamp: String,
    },
}

impl ServerMessage {
    /// Broadcast envelope stamped with the current time
    pub fn message(channel: &str, data: Value) -> Self {
        ServerMessage::Message {
            channel: Some(channel.to_string()),
            data,
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Broadcast envelope for every connected client
    pub fn message_to_all(data: Value) -> Self {
        ServerMessage::Message {
            channel: None,
            data,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn event(event: &str, data: Value) -> Self {
        ServerMessage::Event {
            event: event.to_string(),
            data,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

//! Pub/Sub Hub
//!
//! The application layer above the wire protocol.
//!
//! ## Architecture
//!
//! - **ConnectionRegistry**: live connections and their per-connection state
//! - **ChannelManager**: named channels, subscriptions and scoped broadcast
//! - **EventDispatcher**: event hooks and RPC-style server functions
//! - **Hub**: owns all three and dispatches client envelopes
//!
//! A single task owns the [`Hub`], so none of it is behind a lock.
//!
//! ## Client envelopes
//!
//! ```javascript
//! ws.send(JSON.stringify({type: 'subscribe', channel: 'lobby', userId: 'u1'}));
//! ws.send(JSON.stringify({type: 'publish', channel: 'lobby', data: {text: 'hi'}}));
//! ws.send(JSON.stringify({type: 'call', function: 'sum', params: [1, 2]}));
//! ws.send(JSON.stringify({type: 'event', name: 'typing', data: true}));
//! ws.send(JSON.stringify({type: 'createChannel', channel: 'vip', options: {maxClients: 10}}));
//! ```

pub mod channel;
pub mod error;
pub mod events;
pub mod messages;
pub mod registry;
mod state;

pub use channel::{BroadcastOptions, Channel, ChannelManager, ChannelOptions, UserId};
pub use error::{CallError, HubError, HubResult};
pub use events::{EventDispatcher, EventHook, HookContext, HookId, ServerFunction, DEFAULT_EVENTS};
pub use messages::{parse_envelope, ClientMessage, ServerMessage};
pub use registry::{Connection, ConnectionHandle, ConnectionId, ConnectionRegistry};
pub use state::{DisconnectReason, Hub, HubConfig};

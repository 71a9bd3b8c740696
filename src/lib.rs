//! # Pubsock
//!
//! RFC 6455 WebSocket server with channel-based publish/subscribe, event
//! hooks and RPC-style function calls.
//!
//! ## Features
//!
//! - **Wire protocol**: frame codec, fragment reassembly, HTTP upgrade
//! - **Channels**: capacity limits, private channels, user-scoped broadcast
//! - **Hooks**: global and per-channel event hooks, isolated from each other
//! - **Keepalive**: idle pings and eviction
//! - **TLS**: explicit certificates or discovery in standard locations
//!
//! ## Modules
//!
//! - [`protocol`]: frames, messages and the handshake, free of I/O
//! - [`hub`]: connections, channels, events and envelope dispatch
//! - [`server`]: reactor loop, connection tasks and TLS
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pubsock::config::Config;
//! use pubsock::hub::ChannelOptions;
//! use pubsock::server::WebSocketServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = WebSocketServer::new(Config::load_default());
//!
//!     // Channel that survives with no subscribers
//!     server.create_channel(
//!         "announcements",
//!         ChannelOptions { persistent: true, ..Default::default() },
//!     );
//!
//!     server.on_channel("announcements", "channel.subscribe", |ctx| {
//!         tracing::info!("New listener: {}", ctx.data);
//!         Ok(())
//!     });
//!
//!     server.start().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod hub;
pub mod protocol;
pub mod server;

pub use config::Config;
pub use hub::{Hub, HubConfig};
pub use server::{ServerHandle, WebSocketServer};

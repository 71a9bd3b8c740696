//! WebSocket Server
//!
//! Runs the hub over TCP (optionally TLS).
//!
//! ## Architecture
//!
//! - **Reactor**: single task owning the [`Hub`](crate::hub::Hub); accepts,
//!   handshakes, decodes frames and runs keepalive sweeps
//! - **Connection tasks**: one reader and one writer per socket, moving raw
//!   bytes between the socket and the reactor
//! - **TLS**: certificate discovery and `rustls` acceptor setup
//!
//! ## Example
//!
//! ```rust,no_run
//! use pubsock::config::Config;
//! use pubsock::server::WebSocketServer;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = WebSocketServer::new(Config::default());
//!     server.on("connection.open", |ctx| {
//!         tracing::info!("Client {:?} connected", ctx.connection);
//!         Ok(())
//!     });
//!     server.define_function("echo", |params, _connection| Ok(json!({ "echo": params })));
//!
//!     let handle = server.handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         handle.stop();
//!     });
//!
//!     server.start().await?;
//!     Ok(())
//! }
//! ```

mod connection;
pub mod error;
mod reactor;
mod service;
pub mod tls;

pub use error::{ServerError, ServerResult};
pub use service::{ServerHandle, WebSocketServer};
pub use tls::{discover_certificates, CertificatePair, CertificateSearch};

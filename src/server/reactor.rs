//! Reactor loop
//!
//! One task owns the [`Hub`] and reacts to four sources: the listener, bytes
//! and closures reported by connection tasks, commands from
//! [`ServerHandle`](super::ServerHandle)s, and a periodic tick for keepalive.
//! Per connection it runs the handshake, decodes frames in arrival order and
//! hands complete messages to the hub.

use bytes::{Buf, Bytes};
use serde_json::json;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_rustls::TlsAcceptor;

use super::connection::{self, ConnectionEvent, ConnectionIo};
use super::error::ServerResult;
use crate::config::Config;
use crate::hub::events::CONNECTION_OPEN;
use crate::hub::{parse_envelope, Connection, ConnectionHandle, ConnectionId, DisconnectReason, Hub};
use crate::protocol::{
    close_code, decode_with_limit, find_header_end, frame, perform_handshake, AllowedOrigins,
    Decoded, FrameError, HandshakeError, Message, ProtocolError, ProtocolResult, MAX_HANDSHAKE_SIZE,
};

/// Capacity of the connection-task → reactor queue
const EVENT_QUEUE_SIZE: usize = 1024;

/// Work sent to the reactor from outside
pub(crate) enum Command {
    /// Run a closure against the hub on the reactor task
    Run(Box<dyn FnOnce(&mut Hub) + Send>),
    /// Close every connection and return from the loop
    Stop,
}

/// Reactor knobs taken from [`Config`]
#[derive(Debug, Clone)]
pub(crate) struct ReactorSettings {
    pub allowed_origins: AllowedOrigins,
    pub max_message_size: usize,
    pub read_buffer_size: usize,
    pub tick_interval: Duration,
}

impl From<&Config> for ReactorSettings {
    fn from(config: &Config) -> Self {
        Self {
            allowed_origins: config.security.allowed_origins.clone(),
            max_message_size: config.security.max_message_size,
            read_buffer_size: config.server.read_buffer_size,
            tick_interval: Duration::from_millis(config.server.tick_interval_ms),
        }
    }
}

enum Wake {
    Tick,
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
    Event(ConnectionEvent),
    Command(Command),
}

/// Result of decoding from a connection's buffer
enum Step {
    Message(Message),
    /// A non-final fragment was absorbed
    Fragment,
    NeedMore,
}

pub(crate) struct Reactor {
    hub: Hub,
    settings: ReactorSettings,
    tls: Option<TlsAcceptor>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    events_rx: mpsc::Receiver<ConnectionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Reactor {
    pub(crate) fn new(
        hub: Hub,
        settings: ReactorSettings,
        tls: Option<TlsAcceptor>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        Self {
            hub,
            settings,
            tls,
            events_tx,
            events_rx,
            commands,
        }
    }

    /// Serve until a stop command arrives, then close every connection
    pub(crate) async fn run(mut self, listener: TcpListener) -> ServerResult<()> {
        let local_addr = listener.local_addr()?;
        let scheme = if self.tls.is_some() { "wss" } else { "ws" };
        tracing::info!("WebSocket server listening on {}://{}", scheme, local_addr);

        let mut tick = tokio::time::interval(self.settings.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                _ = tick.tick() => Wake::Tick,
                accepted = listener.accept() => Wake::Accepted(accepted),
                Some(event) = self.events_rx.recv() => Wake::Event(event),
                Some(command) = self.commands.recv() => Wake::Command(command),
            };

            match wake {
                Wake::Tick => {
                    self.hub.sweep(Instant::now());
                }
                Wake::Accepted(Ok((stream, peer))) => self.accept(stream, peer),
                Wake::Accepted(Err(e)) => {
                    tracing::error!("TCP accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Wake::Event(event) => self.handle_event(event),
                Wake::Command(Command::Run(f)) => f(&mut self.hub),
                Wake::Command(Command::Stop) => break,
            }
        }

        self.hub.shutdown();
        tracing::info!("WebSocket server stopped");
        Ok(())
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.hub.is_full() {
            tracing::warn!(
                %peer,
                limit = self.hub.config().max_clients,
                "Server full, closing new connection"
            );
            drop(stream);
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let id = self.hub.registry.allocate_id();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(connection::run(
            stream,
            self.tls.clone(),
            ConnectionIo {
                id,
                outbound: outbound_rx,
                events: self.events_tx.clone(),
                read_buffer_size: self.settings.read_buffer_size,
            },
        ));

        let connection = Connection::new(
            id,
            ConnectionHandle::with_reader(outbound_tx, task),
            self.settings.max_message_size,
        )
        .with_peer(peer);
        self.hub.registry.register(connection);
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Data { id, bytes } => self.on_data(id, &bytes),
            ConnectionEvent::Closed { id, reason } => {
                self.hub.disconnect(id, reason);
            }
        }
    }

    fn on_data(&mut self, id: ConnectionId, bytes: &[u8]) {
        let upgraded = match self.hub.registry.get_mut(id) {
            Some(connection) => {
                connection.receive_buffer.extend_from_slice(bytes);
                connection.handshake_complete
            }
            // data racing a disconnect
            None => return,
        };

        if !upgraded && !self.try_handshake(id) {
            return;
        }
        self.process_frames(id);
    }

    /// Answer the upgrade request once the header block is complete
    ///
    /// Returns true when the connection is upgraded and still registered.
    fn try_handshake(&mut self, id: ConnectionId) -> bool {
        let Some(connection) = self.hub.registry.get_mut(id) else {
            return false;
        };

        let end = match find_header_end(&connection.receive_buffer) {
            Some(end) if end <= MAX_HANDSHAKE_SIZE => end,
            Some(end) => {
                self.reject(id, HandshakeError::RequestTooLarge(end));
                return false;
            }
            None => {
                let buffered = connection.receive_buffer.len();
                if buffered > MAX_HANDSHAKE_SIZE {
                    self.reject(id, HandshakeError::RequestTooLarge(buffered));
                }
                return false;
            }
        };

        match perform_handshake(&connection.receive_buffer[..end], &self.settings.allowed_origins) {
            Ok(handshake) => {
                connection.send(Bytes::from(handshake.response));
                connection.receive_buffer.advance(end);
                connection.handshake_complete = true;
                connection.touch();
                let peer = connection.peer.map(|p| p.to_string());

                tracing::info!(
                    connection_id = %id,
                    origin = ?handshake.origin,
                    "WebSocket handshake complete"
                );
                self.hub.trigger(
                    CONNECTION_OPEN,
                    &json!({ "connection": id, "origin": handshake.origin, "peer": peer }),
                    Some(id),
                );
                true
            }
            Err(e) => {
                self.reject(id, e);
                false
            }
        }
    }

    fn reject(&mut self, id: ConnectionId, error: HandshakeError) {
        tracing::warn!(connection_id = %id, error = %error, "Handshake rejected");
        self.hub.registry.send_to(id, error.http_response());
        self.hub
            .disconnect(id, DisconnectReason::HandshakeRejected(error));
    }

    /// Decode and dispatch every complete message in the buffer, in order
    fn process_frames(&mut self, id: ConnectionId) {
        let limit = self.settings.max_message_size as u64;
        loop {
            let Some(connection) = self.hub.registry.get_mut(id) else {
                return;
            };

            match next_message(connection, limit) {
                Ok(Step::Message(message)) => {
                    if !self.dispatch(id, message) {
                        return;
                    }
                }
                Ok(Step::Fragment) => continue,
                Ok(Step::NeedMore) => return,
                Err(e) => {
                    self.fail(id, e);
                    return;
                }
            }
        }
    }

    /// Handle one message; false once the connection is gone
    fn dispatch(&mut self, id: ConnectionId, message: Message) -> bool {
        match message {
            Message::Text(text) => {
                match parse_envelope(&text) {
                    Some((raw, envelope)) => self.hub.handle_client_message(id, &raw, envelope),
                    None => tracing::debug!(connection_id = %id, "Ignoring malformed message"),
                }
                true
            }
            Message::Binary(data) => {
                tracing::debug!(connection_id = %id, len = data.len(), "Ignoring binary message");
                true
            }
            Message::Ping(payload) => {
                self.hub.registry.send_to(id, frame::pong(&payload));
                true
            }
            Message::Pong(_) => true,
            Message::Close(status) => {
                let code = status.as_ref().map(|(code, _)| *code);
                tracing::debug!(connection_id = %id, ?code, "Client sent close");
                self.hub
                    .registry
                    .send_to(id, frame::close(echo_code(code), ""));
                self.hub.disconnect(id, DisconnectReason::CloseFrame(code));
                false
            }
        }
    }

    fn fail(&mut self, id: ConnectionId, error: ProtocolError) {
        tracing::warn!(connection_id = %id, error = %error, "Protocol error, closing connection");
        let code = error.close_code();
        self.hub.close(id, code, DisconnectReason::Protocol(error));
    }
}

fn next_message(connection: &mut Connection, limit: u64) -> ProtocolResult<Step> {
    let frame = match decode_with_limit(&connection.receive_buffer, limit) {
        // an extended length cut off by a TCP segment boundary is not fatal
        Decoded::Incomplete | Decoded::Malformed(FrameError::TruncatedLength { .. }) => {
            return Ok(Step::NeedMore)
        }
        Decoded::Malformed(e) => return Err(e.into()),
        Decoded::Complete { frame, consumed } => {
            connection.receive_buffer.advance(consumed);
            frame
        }
    };

    connection.touch();
    if !frame.masked {
        tracing::warn!(connection_id = %connection.id, "Client frame is not masked");
    }

    Ok(match connection.assembler.push(frame)? {
        Some(message) => Step::Message(message),
        None => Step::Fragment,
    })
}

/// Status code to send back for a peer's close; codes that must not appear
/// on the wire fall back to normal closure
fn echo_code(code: Option<u16>) -> u16 {
    code.filter(|c| (1000..5000).contains(c) && !matches!(c, 1004..=1006 | 1015))
        .unwrap_or(close_code::NORMAL)
}

//! Server entry point and control handle

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use super::error::{ServerError, ServerResult};
use super::reactor::{Command, Reactor, ReactorSettings};
use super::tls;
use crate::config::Config;
use crate::hub::{
    BroadcastOptions, ChannelOptions, ConnectionId, HookContext, HookId, Hub, HubConfig,
};

/// WebSocket pub/sub server
///
/// Hooks, functions and channels registered before [`start`](Self::start)
/// move onto the reactor with the hub. Afterwards, use a [`ServerHandle`].
pub struct WebSocketServer {
    config: Config,
    hub: Hub,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
}

impl WebSocketServer {
    pub fn new(config: Config) -> Self {
        let hub = Hub::new(HubConfig::from(&config));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            config,
            hub,
            commands_tx,
            commands_rx,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn hub_mut(&mut self) -> &mut Hub {
        &mut self.hub
    }

    /// Register a global event hook
    pub fn on<F>(&mut self, event: &str, hook: F) -> HookId
    where
        F: Fn(&HookContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hub.on(event, hook)
    }

    /// Register a hook that only fires for events on `channel`
    pub fn on_channel<F>(&mut self, channel: &str, event: &str, hook: F) -> HookId
    where
        F: Fn(&HookContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hub.on_channel(channel, event, hook)
    }

    pub fn off(&mut self, id: HookId) -> bool {
        self.hub.off(id)
    }

    /// Expose a function to clients' `call` messages
    pub fn define_function<F>(&mut self, name: &str, function: F)
    where
        F: Fn(Value, ConnectionId) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.hub.define_function(name, function);
    }

    pub fn create_channel(&mut self, name: &str, options: ChannelOptions) -> bool {
        self.hub.create_channel(name, options)
    }

    /// Handle for controlling the server once it runs
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// Bind the configured address and serve until stopped
    pub async fn start(self) -> ServerResult<()> {
        let host = self.config.server.host.clone();
        let port = self.config.server.port;
        self.serve(&host, port).await
    }

    pub async fn serve(self, host: &str, port: u16) -> ServerResult<()> {
        let addr = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.serve_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve_listener(self, listener: TcpListener) -> ServerResult<()> {
        self.config.validate()?;
        let acceptor = tls::acceptor(&self.config.tls)?;
        let settings = ReactorSettings::from(&self.config);

        let Self {
            hub, commands_rx, ..
        } = self;
        Reactor::new(hub, settings, acceptor, commands_rx)
            .run(listener)
            .await
    }
}

/// Cloneable control handle for a running server
#[derive(Debug, Clone)]
pub struct ServerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ServerHandle {
    /// Ask the server to close all connections and return
    ///
    /// Returns false if it already stopped.
    pub fn stop(&self) -> bool {
        self.commands.send(Command::Stop).is_ok()
    }

    /// Run `f` against the hub on the reactor task and return its result
    pub async fn with_hub<F, R>(&self, f: F) -> ServerResult<R>
    where
        F: FnOnce(&mut Hub) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let command = Command::Run(Box::new(move |hub: &mut Hub| {
            let _ = tx.send(f(hub));
        }));
        self.commands
            .send(command)
            .map_err(|_| ServerError::Stopped)?;
        rx.await.map_err(|_| ServerError::Stopped)
    }

    /// Publish server-originated data to every subscriber of `channel`
    pub async fn broadcast(&self, channel: &str, data: Value) -> ServerResult<usize> {
        self.broadcast_with(channel, data, BroadcastOptions::default())
            .await
    }

    pub async fn broadcast_with(
        &self,
        channel: &str,
        data: Value,
        options: BroadcastOptions,
    ) -> ServerResult<usize> {
        let channel = channel.to_string();
        self.with_hub(move |hub| hub.broadcast(&channel, data, &options))
            .await
    }

    /// Send data to every connected client, regardless of channel
    pub async fn broadcast_all(&self, data: Value, options: BroadcastOptions) -> ServerResult<usize> {
        self.with_hub(move |hub| hub.broadcast_all(data, &options))
            .await
    }

    /// Send a named event to the subscribers of the channel named `event`
    pub async fn emit(&self, event: &str, data: Value) -> ServerResult<usize> {
        self.emit_with(event, data, BroadcastOptions::default()).await
    }

    pub async fn emit_with(
        &self,
        event: &str,
        data: Value,
        options: BroadcastOptions,
    ) -> ServerResult<usize> {
        let event = event.to_string();
        self.with_hub(move |hub| hub.emit(&event, data, &options))
            .await
    }

    pub async fn connection_count(&self) -> ServerResult<usize> {
        self.with_hub(|hub| hub.registry.len()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, encode_masked, AllowedOrigins, Decoded, OpCode};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::{self, Message};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server.tick_interval_ms = 20;
        config
    }

    async fn spawn(server: WebSocketServer) -> (String, ServerHandle, JoinHandle<ServerResult<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let handle = server.handle();
        let task = tokio::spawn(server.serve_listener(listener));
        (url, handle, task)
    }

    async fn connect(url: &str) -> Client {
        let (ws, response) = tokio::time::timeout(WAIT, connect_async(url))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        assert_eq!(response.status(), 101);
        ws
    }

    async fn next_message(ws: &mut Client) -> Message {
        tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .expect("read failed")
    }

    async fn next_json(ws: &mut Client) -> Value {
        loop {
            match next_message(ws).await {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("Expected text, got {:?}", other),
            }
        }
    }

    async fn send_json(ws: &mut Client, value: Value) {
        ws.send(Message::text(value.to_string())).await.unwrap();
    }

    async fn wait_for_connections(handle: &ServerHandle, expected: usize) {
        for _ in 0..100 {
            if handle.connection_count().await.unwrap() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("Connection count never reached {}", expected);
    }

    #[tokio::test]
    async fn test_subscribe_and_publish_between_clients() {
        let (url, handle, _task) = spawn(WebSocketServer::new(test_config())).await;

        let mut alice = connect(&url).await;
        let mut bob = connect(&url).await;

        for ws in [&mut alice, &mut bob] {
            send_json(ws, json!({ "type": "subscribe", "channel": "chat" })).await;
            let reply = next_json(ws).await;
            assert_eq!(reply, json!({ "type": "subscribed", "channel": "chat" }));
        }

        send_json(
            &mut alice,
            json!({ "type": "publish", "channel": "chat", "data": { "text": "hi" }, "excludeSelf": true }),
        )
        .await;

        let received = next_json(&mut bob).await;
        assert_eq!(received["type"], "message");
        assert_eq!(received["channel"], "chat");
        assert_eq!(received["data"], json!({ "text": "hi" }));
        assert!(received["timestamp"].is_i64());

        // the server-side broadcast reaches both
        let delivered = handle
            .broadcast("chat", json!("from server"))
            .await
            .unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(next_json(&mut alice).await["data"], "from server");
        assert_eq!(next_json(&mut bob).await["data"], "from server");
    }

    #[tokio::test]
    async fn test_emit_and_broadcast_all() {
        let (url, handle, _task) = spawn(WebSocketServer::new(test_config())).await;

        let mut alice = connect(&url).await;
        let mut bob = connect(&url).await;
        send_json(&mut bob, json!({ "type": "subscribe", "channel": "alerts", "userId": "bob" })).await;
        assert_eq!(next_json(&mut bob).await["type"], "subscribed");

        assert_eq!(handle.emit("alerts", json!({ "level": 2 })).await.unwrap(), 1);
        let event = next_json(&mut bob).await;
        assert_eq!(event["type"], "event");
        assert_eq!(event["event"], "alerts");
        assert_eq!(event["data"], json!({ "level": 2 }));

        let ids = handle.with_hub(|hub| hub.registry.all()).await.unwrap();
        let delivered = handle
            .broadcast_all(json!("everyone"), BroadcastOptions::default().excluding(ids[1]))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        let message = next_json(&mut alice).await;
        assert_eq!(message["data"], "everyone");
        assert_eq!(message["channel"], Value::Null);
    }

    #[tokio::test]
    async fn test_function_call() {
        let mut server = WebSocketServer::new(test_config());
        server.define_function("add", |params, _connection| {
            let a = params["a"].as_i64().unwrap_or(0);
            let b = params["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });
        let (url, _handle, _task) = spawn(server).await;

        let mut ws = connect(&url).await;
        send_json(
            &mut ws,
            json!({ "type": "call", "function": "add", "params": { "a": 2, "b": 3 } }),
        )
        .await;
        assert_eq!(
            next_json(&mut ws).await,
            json!({ "type": "function.result", "function": "add", "result": 5 })
        );

        send_json(&mut ws, json!({ "type": "call", "function": "missing" })).await;
        assert_eq!(
            next_json(&mut ws).await,
            json!({ "type": "error", "message": "Function not found" })
        );
    }

    #[tokio::test]
    async fn test_hooks_fire_for_open_and_close() {
        let opened = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let mut server = WebSocketServer::new(test_config());
        let counter = opened.clone();
        server.on("connection.open", move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let counter = closed.clone();
        server.on("connection.close", move |ctx| {
            assert_eq!(ctx.data["handshake"], true);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let (url, handle, _task) = spawn(server).await;

        let mut ws = connect(&url).await;
        wait_for_connections(&handle, 1).await;
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        ws.close(None).await.unwrap();
        wait_for_connections(&handle, 0).await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_client_close_is_echoed() {
        let (url, _handle, _task) = spawn(WebSocketServer::new(test_config())).await;
        let mut ws = connect(&url).await;

        ws.send(Message::Close(Some(tungstenite::protocol::CloseFrame {
            code: 4000.into(),
            reason: "bye".into(),
        })))
        .await
        .unwrap();

        match next_message(&mut ws).await {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4000),
            other => panic!("Expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let (url, _handle, _task) = spawn(WebSocketServer::new(test_config())).await;
        let mut ws = connect(&url).await;

        ws.send(Message::Ping(vec![1, 2, 3].into())).await.unwrap();
        match next_message(&mut ws).await {
            Message::Pong(payload) => assert_eq!(&payload[..], &[1, 2, 3][..]),
            other => panic!("Expected pong, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idle_connection_is_pinged() {
        let mut config = test_config();
        config.server.ping_interval_secs = 1;
        let (url, _handle, _task) = spawn(WebSocketServer::new(config)).await;
        let mut ws = connect(&url).await;

        match next_message(&mut ws).await {
            Message::Ping(payload) => assert!(payload.is_empty()),
            other => panic!("Expected ping, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_message_closes_with_1009() {
        let mut config = test_config();
        config.security.max_message_size = 64;
        let (url, _handle, _task) = spawn(WebSocketServer::new(config)).await;
        let mut ws = connect(&url).await;

        ws.send(Message::text("x".repeat(200))).await.unwrap();
        match next_message(&mut ws).await {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1009),
            other => panic!("Expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disallowed_origin_is_rejected() {
        let mut config = test_config();
        config.security.allowed_origins = AllowedOrigins::parse("https://app.example.com");
        let (url, handle, _task) = spawn(WebSocketServer::new(config)).await;

        let mut request = url.as_str().into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Origin", "https://evil.example.com".parse().unwrap());

        let err = tokio::time::timeout(WAIT, connect_async(request))
            .await
            .unwrap()
            .unwrap_err();
        assert!(
            matches!(err, tungstenite::Error::Http(ref response) if response.status() == 403),
            "unexpected error: {:?}",
            err
        );
        wait_for_connections(&handle, 0).await;

        let mut request = url.as_str().into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Origin", "https://app.example.com".parse().unwrap());
        assert!(connect_async(request).await.is_ok());
    }

    #[tokio::test]
    async fn test_server_full_refuses_connection() {
        let mut config = test_config();
        config.server.max_clients = 1;
        let (url, handle, _task) = spawn(WebSocketServer::new(config)).await;

        let _first = connect(&url).await;
        let second = tokio::time::timeout(WAIT, connect_async(url.as_str()))
            .await
            .unwrap();
        assert!(second.is_err());
        assert_eq!(handle.connection_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stop_closes_connections() {
        let (url, handle, task) = spawn(WebSocketServer::new(test_config())).await;
        let mut ws = connect(&url).await;
        wait_for_connections(&handle, 1).await;

        assert!(handle.stop());
        match next_message(&mut ws).await {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1001),
            other => panic!("Expected close, got {:?}", other),
        }

        tokio::time::timeout(WAIT, task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(
            handle.connection_count().await,
            Err(ServerError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_raw_handshake_and_split_frame() {
        let (url, _handle, _task) = spawn(WebSocketServer::new(test_config())).await;
        let addr = url.trim_start_matches("ws://");
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let request = format!(
            "GET /chat HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
            addr
        );
        let (head, tail) = request.as_bytes().split_at(20);
        stream.write_all(head).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // rest of the request plus the first bytes of a frame in one write
        let payload = json!({ "type": "subscribe", "channel": "news" }).to_string();
        let frame = encode_masked(payload.as_bytes(), OpCode::Text, true, [9, 8, 7, 6]);
        let mut chunk = tail.to_vec();
        chunk.extend_from_slice(&frame[..3]);
        stream.write_all(&chunk).await.unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while !received.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "server closed during handshake");
            received.extend_from_slice(&buf[..n]);
        }
        let response = String::from_utf8_lossy(&received).to_string();
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(response.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        stream.write_all(&frame[3..]).await.unwrap();

        let header_end = received.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let mut pending = received.split_off(header_end);
        let reply = loop {
            if let Decoded::Complete { frame, .. } = decode(&pending) {
                break frame;
            }
            let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "server closed before replying");
            pending.extend_from_slice(&buf[..n]);
        };

        assert_eq!(reply.opcode, OpCode::Text);
        assert!(!reply.masked);
        let value: Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(value, json!({ "type": "subscribed", "channel": "news" }));
    }

    #[tokio::test]
    async fn test_bind_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = WebSocketServer::new(test_config())
            .serve("127.0.0.1", port)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
    }
}

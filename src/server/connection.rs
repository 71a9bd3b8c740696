//! Connection I/O tasks
//!
//! Each accepted socket gets a reader and a writer. The reader forwards raw
//! bytes to the reactor; the writer drains the connection's outbound queue.
//! Neither looks at the bytes: all protocol work happens on the reactor.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use crate::hub::{ConnectionId, DisconnectReason};

/// What connection tasks report to the reactor
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    Data { id: ConnectionId, bytes: Bytes },
    Closed { id: ConnectionId, reason: DisconnectReason },
}

/// Everything a connection task needs besides the socket
pub(crate) struct ConnectionIo {
    pub id: ConnectionId,
    pub outbound: mpsc::UnboundedReceiver<Bytes>,
    pub events: mpsc::Sender<ConnectionEvent>,
    pub read_buffer_size: usize,
}

/// Run a connection: TLS accept if configured, then pump bytes both ways
pub(crate) async fn run(stream: TcpStream, tls: Option<TlsAcceptor>, io: ConnectionIo) {
    match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => pump(stream, io).await,
            Err(e) => {
                tracing::warn!(connection_id = %io.id, error = %e, "TLS handshake failed");
                let _ = io
                    .events
                    .send(ConnectionEvent::Closed {
                        id: io.id,
                        reason: DisconnectReason::Tls(e.to_string()),
                    })
                    .await;
            }
        },
        None => pump(stream, io).await,
    }
}

async fn pump<S>(stream: S, io: ConnectionIo)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let ConnectionIo {
        id,
        outbound,
        events,
        read_buffer_size,
    } = io;
    let (mut reader, writer) = tokio::io::split(stream);

    tokio::spawn(write_loop(id, writer, outbound, events.clone()));

    let mut buf = vec![0u8; read_buffer_size];
    loop {
        let event = match reader.read(&mut buf).await {
            Ok(0) => ConnectionEvent::Closed {
                id,
                reason: DisconnectReason::PeerClosed,
            },
            Ok(n) => ConnectionEvent::Data {
                id,
                bytes: Bytes::copy_from_slice(&buf[..n]),
            },
            Err(e) => ConnectionEvent::Closed {
                id,
                reason: DisconnectReason::ReadError(e.to_string()),
            },
        };

        let done = matches!(event, ConnectionEvent::Closed { .. });
        if events.send(event).await.is_err() || done {
            break;
        }
    }
}

/// Write queued bytes in order until the queue closes, then shut down
async fn write_loop<W>(
    id: ConnectionId,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::Sender<ConnectionEvent>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = outbound.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            tracing::debug!(connection_id = %id, error = %e, "Write failed");
            let _ = events
                .send(ConnectionEvent::Closed {
                    id,
                    reason: DisconnectReason::WriteError(e.to_string()),
                })
                .await;
            return;
        }
    }
    let _ = writer.shutdown().await;
}

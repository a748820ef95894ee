//! Tunnel listener
//!
//! Accepts tunnel clients over WebSocket (optionally inside TLS), assigns
//! each one a public name and pumps frames between the socket and its
//! [`ClientConnection`].

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use rtunnel_shared::protocol::MAX_FRAME_SIZE;
use rtunnel_shared::{Command, CommandKind, Error, TunnelInfo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::ClientRegistry;
use crate::tunnel::ClientConnection;

const OUTBOUND_QUEUE: usize = 64;

/// Frame limits sized for the largest tunnelled body
pub fn websocket_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_FRAME_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..Default::default()
    }
}

pub struct TunnelServer {
    registry: Arc<ClientRegistry>,
    domain: Option<String>,
    acceptor: Option<TlsAcceptor>,
}

impl TunnelServer {
    pub fn new(
        registry: Arc<ClientRegistry>,
        domain: Option<String>,
        acceptor: Option<TlsAcceptor>,
    ) -> Self {
        Self {
            registry,
            domain,
            acceptor,
        }
    }

    pub fn public_url(&self, name: &str) -> Option<String> {
        self.domain
            .as_ref()
            .map(|domain| format!("https://{}.{}", name, domain))
    }

    /// Accept tunnel clients until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        info!(
            "Tunnel listener on {:?} (tls: {})",
            listener.local_addr().ok(),
            self.acceptor.is_some()
        );

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            let server = self.clone();
            let shutdown = shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = server.handle_stream(stream, peer, shutdown).await {
                    warn!(%peer, "Tunnel connection ended: {}", e);
                }
            });
        }

        info!("Tunnel listener stopped");
    }

    async fn handle_stream(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<()> {
        match &self.acceptor {
            Some(acceptor) => {
                let stream = acceptor.accept(stream).await?;
                self.handle_socket(stream, peer, shutdown).await
            }
            None => self.handle_socket(stream, peer, shutdown).await,
        }
    }

    async fn handle_socket<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ws = tokio_tungstenite::accept_async_with_config(stream, Some(websocket_config())).await?;
        let (mut sink, mut source) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);

        let conn = match self.registry.register(tx).await {
            Ok(conn) => conn,
            Err(Error::NameExhausted) => {
                warn!(%peer, "Rejecting client: no more subdomains available");
                let notice = Command::echo(Error::NameExhausted.to_string());
                sink.send(Message::Binary(notice.encode())).await?;
                sink.close().await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let connected = self.registry.len().await;
        info!(client = %conn.name(), %peer, connected, "Tunnel client connected");

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(Message::Binary(frame)).await {
                    debug!("Tunnel write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        if let Some(url) = self.public_url(conn.name()) {
            let info = Command::json(CommandKind::TunnelInfo, &TunnelInfo { url: url.clone() })?;
            conn.send(info).await?;
            info!(client = %conn.name(), "Tunnel active: {}", url);
        }

        let result = read_loop(&conn, &mut source, &shutdown).await;

        info!(
            client = %conn.name(),
            pending = conn.pending_count(),
            "Tunnel client disconnected after {:?}",
            conn.created_at.elapsed()
        );
        conn.close();
        self.registry.unregister(conn.name(), conn.id()).await;
        writer.abort();

        result
    }
}

async fn read_loop<St>(
    conn: &ClientConnection,
    source: &mut St,
    shutdown: &CancellationToken,
) -> Result<()>
where
    St: futures_util::Stream<Item = tokio_tungstenite::tungstenite::Result<Message>> + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            msg = source.next() => msg,
        };

        match msg {
            Some(Ok(Message::Binary(data))) => match Command::decode(&data) {
                Ok(command) => conn.dispatch(command),
                Err(e) => warn!(client = %conn.name(), "Dropping frame: {}", e),
            },
            // tungstenite queues the pong itself
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(other)) => {
                debug!(client = %conn.name(), "Ignoring non-binary message ({} bytes)", other.len())
            }
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

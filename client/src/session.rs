//! Tunnel client session
//!
//! A [`Session`] owns one outbound connection to the relay. It connects
//! with a bounded retry policy, answers `HttpRequest` commands through the
//! [`Executor`] and reconnects when the relay goes away.
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected
//!      ▲               │              │
//!      └── backoff ◄───┴──────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rtunnel_shared::protocol::MAX_FRAME_SIZE;
use rtunnel_shared::{Command, CommandKind, Error, HttpRequestData, Result, TunnelInfo};
use tokio::net::TcpStream;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{tungstenite::Message, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{RetryConfig, TunnelSetting};
use crate::executor::Executor;
use crate::inspector::RequestLog;
use crate::tls;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frame limits sized for the largest tunnelled body
fn websocket_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_FRAME_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..Default::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Fixed-interval reconnect policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Negative means unlimited
    pub max_retries: i32,
    pub interval: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            interval: config.interval(),
        }
    }
}

impl RetryPolicy {
    /// Whether to try again after `failures` consecutive failed attempts.
    pub fn should_retry(&self, failures: u32) -> bool {
        self.max_retries < 0 || failures < self.max_retries as u32
    }
}

pub struct Session {
    setting: TunnelSetting,
    executor: Executor,
    connector: Option<Connector>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    state: watch::Sender<SessionState>,
    public_url: RwLock<Option<String>>,
    cancel: CancellationToken,
}

impl Session {
    /// `permits` is shared by every session of the process; `parent`
    /// cancels this session together with its siblings.
    pub fn new(
        setting: TunnelSetting,
        retry: RetryPolicy,
        permits: Arc<Semaphore>,
        log: RequestLog,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let executor = Executor::new(&setting, log)?;
        let connector = if setting.remote_url().starts_with("wss://") {
            Some(tls::connector(setting.allow_invalid_certificates)?)
        } else {
            None
        };
        let (state, _) = watch::channel(SessionState::Disconnected);

        Ok(Self {
            setting,
            executor,
            connector,
            retry,
            permits,
            state,
            public_url: RwLock::new(None),
            cancel: parent.child_token(),
        })
    }

    pub fn name(&self) -> &str {
        &self.setting.name
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub async fn public_url(&self) -> Option<String> {
        self.public_url.read().await.clone()
    }

    /// Stop the session; an executing request is aborted.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Connect and serve until stopped. Fails with `Error::Connection` once
    /// the retry policy gives up.
    pub async fn run(&self) -> Result<()> {
        let mut failures: u32 = 0;

        while !self.cancel.is_cancelled() {
            self.set_state(SessionState::Connecting);
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok(ws) => {
                    failures = 0;
                    self.set_state(SessionState::Connected);
                    info!(tunnel = %self.name(), "Connected to {}", self.setting.remote_url());

                    if let Err(e) = self.serve(ws).await {
                        warn!(tunnel = %self.name(), "Connection error: {}", e);
                    }
                    self.set_state(SessionState::Disconnected);
                    *self.public_url.write().await = None;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    info!(tunnel = %self.name(), "Disconnected from relay, reconnecting");
                }
                Err(Error::CertificateRejected(reason)) => {
                    self.set_state(SessionState::Disconnected);
                    error!(tunnel = %self.name(), "Relay certificate rejected: {}", reason);
                    return Err(Error::CertificateRejected(reason));
                }
                Err(e) => {
                    failures += 1;
                    self.set_state(SessionState::Disconnected);
                    warn!(tunnel = %self.name(), "Connection attempt {} failed: {}", failures, e);

                    if !self.retry.should_retry(failures) {
                        error!(tunnel = %self.name(), "Maximum retry attempts reached");
                        return Err(Error::Connection(format!(
                            "giving up after {} attempts: {}",
                            failures, e
                        )));
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.retry.interval) => {}
            }
        }

        self.set_state(SessionState::Disconnected);
        info!(tunnel = %self.name(), "Session stopped");
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    async fn connect(&self) -> Result<WsStream> {
        let url = self.setting.remote_url();
        debug!(tunnel = %self.name(), "Connecting to {}", url);
        let (ws, _) = tokio_tungstenite::connect_async_tls_with_config(
            url.as_str(),
            Some(websocket_config()),
            false,
            self.connector.clone(),
        )
        .await
        .map_err(tls::connect_error)?;
        Ok(ws)
    }

    /// Inbound loop; requests are handled one at a time per connection.
    async fn serve(&self, ws: WsStream) -> Result<()> {
        let (mut sink, mut source) = ws.split();

        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.close().await;
                    return Ok(());
                }
                msg = source.next() => msg,
            };

            match msg {
                Some(Ok(Message::Binary(data))) => {
                    let command = match Command::decode(&data) {
                        Ok(command) => command,
                        Err(e) => {
                            warn!(tunnel = %self.name(), "Dropping frame: {}", e);
                            continue;
                        }
                    };
                    if let Some(reply) = self.handle(command).await {
                        sink.send(Message::Binary(reply.encode()))
                            .await
                            .map_err(|e| Error::Connection(e.to_string()))?;
                    }
                }
                // tungstenite queues the pong itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(Error::Connection(e.to_string())),
            }
        }
    }

    async fn handle(&self, command: Command) -> Option<Command> {
        match command.kind {
            CommandKind::Echo => {
                info!(tunnel = %self.name(), "{}", command.payload);
                None
            }
            CommandKind::TunnelInfo => {
                match command.parse_payload::<TunnelInfo>() {
                    Ok(info) => {
                        print_banner(&self.setting, &info.url);
                        *self.public_url.write().await = Some(info.url);
                    }
                    Err(e) => warn!(tunnel = %self.name(), "Malformed tunnel info: {}", e),
                }
                None
            }
            CommandKind::HttpRequest => self.handle_request(command).await,
            CommandKind::HttpResponse => {
                debug!(tunnel = %self.name(), "Ignoring unexpected HttpResponse");
                None
            }
        }
    }

    async fn handle_request(&self, command: Command) -> Option<Command> {
        let request: HttpRequestData = match command.parse_payload() {
            Ok(request) => request,
            Err(e) => {
                warn!(tunnel = %self.name(), "Malformed request: {}", e);
                return None;
            }
        };

        let token = self.cancel.child_token();
        let public_url = self.public_url().await;
        let work = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| Error::Connection("request pool closed".into()))?;
            self.executor
                .execute(command.correlation_id, &request, public_url.as_deref())
                .await
        };

        let result = tokio::select! {
            _ = token.cancelled() => {
                warn!(tunnel = %self.name(), "{} {} aborted", request.method, request.path);
                return None;
            }
            result = work => result,
        };

        match result {
            Ok(response) => {
                debug!(
                    tunnel = %self.name(),
                    "{} {} -> {}",
                    request.method,
                    request.path,
                    response.status_code
                );
                match Command::json_reply(CommandKind::HttpResponse, command.correlation_id, &response)
                {
                    Ok(reply) => Some(reply),
                    Err(e) => {
                        error!(tunnel = %self.name(), "Failed to encode response: {}", e);
                        None
                    }
                }
            }
            Err(e) => {
                error!(
                    tunnel = %self.name(),
                    "{} {} failed: {}",
                    request.method,
                    request.path,
                    e
                );
                None
            }
        }
    }
}

fn print_banner(setting: &TunnelSetting, url: &str) {
    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  🚀 rtunnel active: {:<41} ║", setting.name);
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Public URL: {:<47} ║", url);
    println!("║  Local:      {:<47} ║", setting.local);
    println!("╚══════════════════════════════════════════════════════════════╝\n");
}

//! Tunnel connections held by the relay
//!
//! A [`ClientConnection`] is the relay's handle on one connected client.
//! Public HTTP requests borrow it through [`ClientConnection::exchange`],
//! which sends an `HttpRequest` command and waits for the `HttpResponse`
//! carrying the same correlation id. Replies are routed through a
//! correlation table, so each inbound frame completes at most one waiter.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rtunnel_shared::{Command, CommandKind, Error, HttpRequestData, HttpResponseData, Result};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique connection identifier
pub type ConnectionId = Uuid;

type Waiter = oneshot::Sender<Result<HttpResponseData>>;

/// Represents an active tunnel connection
pub struct ClientConnection {
    id: ConnectionId,
    name: String,
    /// Encoded frames for the socket writer task
    tx: mpsc::Sender<Vec<u8>>,
    /// One write in flight per connection
    send_lock: Mutex<()>,
    /// Pending request correlation map
    pending: DashMap<Uuid, Waiter>,
    closed: CancellationToken,
    pub created_at: Instant,
}

impl ClientConnection {
    pub fn new(name: String, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            tx,
            send_lock: Mutex::new(()),
            pending: DashMap::new(),
            closed: CancellationToken::new(),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a command that expects no reply (Echo, TunnelInfo).
    pub async fn send(&self, command: Command) -> Result<()> {
        let _guard = self.send_lock.lock().await;
        self.write(command.encode()).await
    }

    /// Forward an HTTP request to the client and wait for its matching reply.
    ///
    /// Resolves with `RequestTimeout` once `timeout` elapses and with
    /// `ConnectionLost` as soon as the connection closes. Dropping the
    /// returned future removes the pending entry.
    pub async fn exchange(
        &self,
        request: &HttpRequestData,
        timeout: Duration,
    ) -> Result<HttpResponseData> {
        let deadline = tokio::time::Instant::now() + timeout;
        if self.is_closed() {
            return Err(Error::ConnectionLost);
        }

        // the send lock covers registration and transmission, not the wait
        let sent = tokio::time::timeout_at(deadline, async {
            let _guard = self.send_lock.lock().await;
            let command = Command::json(CommandKind::HttpRequest, request)?;
            let (tx, rx) = oneshot::channel();
            let pending = PendingExchange::register(&self.pending, command.correlation_id, tx);
            self.write(command.encode()).await?;
            debug!(client = %self.name, id = %command.correlation_id, "HttpRequest sent");
            Ok::<_, Error>((pending, rx))
        })
        .await;
        let (_pending, rx) = match sent {
            Ok(sent) => sent?,
            Err(_) => {
                warn!(client = %self.name, "Request not sent within {:?}", timeout);
                return Err(Error::RequestTimeout);
            }
        };

        tokio::select! {
            biased;
            reply = rx => reply.unwrap_or(Err(Error::ConnectionLost)),
            _ = self.closed.cancelled() => Err(Error::ConnectionLost),
            _ = tokio::time::sleep_until(deadline) => {
                warn!(client = %self.name, "No response within {:?}", timeout);
                Err(Error::RequestTimeout)
            }
        }
    }

    /// Route an inbound command from this client.
    pub fn dispatch(&self, command: Command) {
        match command.kind {
            CommandKind::HttpResponse => {
                let Some((_, waiter)) = self.pending.remove(&command.correlation_id) else {
                    debug!(
                        client = %self.name,
                        id = %command.correlation_id,
                        "Reply for unknown or expired request dropped"
                    );
                    return;
                };
                let _ = waiter.send(command.parse_payload::<HttpResponseData>());
            }
            CommandKind::Echo => info!(client = %self.name, "{}", command.payload),
            kind => debug!(client = %self.name, ?kind, "Ignoring command from client"),
        }
    }

    /// Mark the connection closed, failing every in-flight exchange.
    pub fn close(&self) {
        self.closed.cancel();
        self.pending.clear();
    }

    async fn write(&self, frame: Vec<u8>) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| Error::ConnectionLost)
    }
}

/// Entry in the correlation table, removed when dropped.
struct PendingExchange<'a> {
    table: &'a DashMap<Uuid, Waiter>,
    id: Uuid,
}

impl<'a> PendingExchange<'a> {
    fn register(table: &'a DashMap<Uuid, Waiter>, id: Uuid, waiter: Waiter) -> Self {
        let previous = table.insert(id, waiter);
        debug_assert!(previous.is_none(), "correlation id reused");
        Self { table, id }
    }
}

impl Drop for PendingExchange<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    pub(crate) fn test_connection(name: &str) -> (Arc<ClientConnection>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(ClientConnection::new(name.to_string(), tx)), rx)
    }

    pub(crate) fn response(status: u16, body: &str) -> HttpResponseData {
        HttpResponseData {
            status_code: status,
            headers: HashMap::new(),
            content: Some(body.as_bytes().to_vec()),
            content_headers: HashMap::new(),
        }
    }

    fn request(path: &str) -> HttpRequestData {
        HttpRequestData {
            method: "GET".into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Answers every request with its own path as the body.
    fn spawn_echo_client(conn: Arc<ClientConnection>, mut rx: mpsc::Receiver<Vec<u8>>) {
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let cmd = Command::decode(&frame).unwrap();
                let req: HttpRequestData = cmd.parse_payload().unwrap();
                let body = format!("{}:{}", conn.name(), req.path);
                let reply = Command::json_reply(
                    CommandKind::HttpResponse,
                    cmd.correlation_id,
                    &response(200, &body),
                )
                .unwrap();
                conn.dispatch(reply);
            }
        });
    }

    #[tokio::test]
    async fn test_exchange_roundtrip() {
        let (conn, rx) = test_connection("foo");
        spawn_echo_client(conn.clone(), rx);

        let resp = conn
            .exchange(&request("/status"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.content.unwrap(), b"foo:/status");
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_removes_pending() {
        let (conn, _rx) = test_connection("silent");

        let start = Instant::now();
        let err = conn
            .exchange(&request("/"), Duration::from_millis(50))
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, Error::RequestTimeout));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stalled_writer_respects_deadline() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = ClientConnection::new("stuck".to_string(), tx);
        // queue full, nobody draining it
        conn.send(Command::echo("fill")).await.unwrap();

        let start = Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            conn.exchange(&request("/"), Duration::from_millis(50)),
        )
        .await
        .expect("exchange outlived its deadline")
        .unwrap_err();

        assert!(matches!(err, Error::RequestTimeout));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_immediately() {
        let (conn, mut rx) = test_connection("flaky");

        let waiting = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.exchange(&request("/"), Duration::from_secs(30)).await })
        };

        // request reached the wire
        rx.recv().await.unwrap();
        let start = Instant::now();
        conn.close();

        let result = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("exchange hung after disconnect")
            .unwrap();
        assert!(matches!(result, Err(Error::ConnectionLost)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_exchange_on_closed_connection() {
        let (conn, _rx) = test_connection("gone");
        conn.close();
        let err = conn
            .exchange(&request("/"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionLost));
    }

    #[tokio::test]
    async fn test_concurrent_clients_get_own_replies() {
        let (foo, foo_rx) = test_connection("foo");
        let (bar, bar_rx) = test_connection("bar");
        spawn_echo_client(foo.clone(), foo_rx);
        spawn_echo_client(bar.clone(), bar_rx);

        let mut handles = Vec::new();
        for i in 0..20 {
            let conn = if i % 2 == 0 { foo.clone() } else { bar.clone() };
            handles.push(tokio::spawn(async move {
                let path = format!("/req/{}", i);
                let resp = conn
                    .exchange(&request(&path), Duration::from_secs(5))
                    .await
                    .unwrap();
                (format!("{}:{}", conn.name(), path), resp.content.unwrap())
            }));
        }

        for handle in handles {
            let (expected, body) = handle.await.unwrap();
            assert_eq!(body, expected.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_out_of_order_replies_match_by_id() {
        let (conn, mut rx) = test_connection("foo");

        let first = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.exchange(&request("/a"), Duration::from_secs(5)).await })
        };
        let cmd_a = Command::decode(&rx.recv().await.unwrap()).unwrap();

        let second = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.exchange(&request("/b"), Duration::from_secs(5)).await })
        };
        let cmd_b = Command::decode(&rx.recv().await.unwrap()).unwrap();

        // answer b first, then a
        for (cmd, body) in [(&cmd_b, "b"), (&cmd_a, "a")] {
            conn.dispatch(
                Command::json_reply(
                    CommandKind::HttpResponse,
                    cmd.correlation_id,
                    &response(200, body),
                )
                .unwrap(),
            );
        }

        assert_eq!(first.await.unwrap().unwrap().content.unwrap(), b"a");
        assert_eq!(second.await.unwrap().unwrap().content.unwrap(), b"b");
    }

    #[tokio::test]
    async fn test_cancelled_caller_cleans_up() {
        let (conn, _rx) = test_connection("slow");

        let outer = tokio::time::timeout(
            Duration::from_millis(20),
            conn.exchange(&request("/"), Duration::from_secs(30)),
        )
        .await;

        assert!(outer.is_err());
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_dropped() {
        let (conn, _rx) = test_connection("foo");
        conn.dispatch(
            Command::json(CommandKind::HttpResponse, &response(200, "stray")).unwrap(),
        );
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_reply_payload() {
        let (conn, mut rx) = test_connection("foo");

        let waiting = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.exchange(&request("/"), Duration::from_secs(5)).await })
        };
        let cmd = Command::decode(&rx.recv().await.unwrap()).unwrap();
        conn.dispatch(Command::reply(
            CommandKind::HttpResponse,
            cmd.correlation_id,
            "not json",
        ));

        assert!(matches!(waiting.await.unwrap(), Err(Error::Json(_))));
    }
}

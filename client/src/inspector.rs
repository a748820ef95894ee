//! Request log and inspector API
//!
//! Every request handled by the client is kept in a bounded ring buffer.
//! When enabled, a small local HTTP API exposes the buffer as JSON.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use rtunnel_shared::encoding::ContentEncoding;
use rtunnel_shared::protocol::CONTENT_ENCODING;
use rtunnel_shared::{HttpRequestData, HttpResponseData};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Max entries kept in the ring buffer
pub const MAX_ENTRIES: usize = 500;

/// A single request/response pair
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: Uuid,
    pub tunnel: String,
    pub timestamp: String,
    pub latency_ms: u64,
    pub request: HttpRequestData,
    pub response: HttpResponseData,
}

/// Shared request log
#[derive(Clone)]
pub struct RequestLog {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl Default for RequestLog {
    fn default() -> Self {
        Self::with_capacity(MAX_ENTRIES)
    }
}

impl RequestLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    /// Record a new request/response pair, evicting the oldest when full
    pub async fn record(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity {
            entries.pop_back();
        }
        entries.push_front(entry);
    }

    /// Newest first
    pub async fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }
}

/// JSON shape served by `/api/entries`
#[derive(Debug, Serialize)]
struct EntryView {
    id: String,
    tunnel: String,
    timestamp: String,
    latency_ms: u64,
    method: String,
    path: String,
    request_headers: HashMap<String, String>,
    status: u16,
    response_headers: HashMap<String, String>,
    /// Response body, decompressed and lossily decoded as UTF-8
    body: String,
}

impl From<LogEntry> for EntryView {
    fn from(entry: LogEntry) -> Self {
        let response = entry.response;
        let mut response_headers = response.headers.clone();
        for (k, v) in &response.content_headers {
            response_headers.entry(k.clone()).or_insert_with(|| v.clone());
        }

        Self {
            id: entry.id.to_string(),
            tunnel: entry.tunnel,
            timestamp: entry.timestamp,
            latency_ms: entry.latency_ms,
            method: entry.request.method,
            path: entry.request.path,
            request_headers: entry.request.headers,
            status: response.status_code,
            body: readable_body(&response),
            response_headers,
        }
    }
}

fn readable_body(response: &HttpResponseData) -> String {
    let Some(body) = response.content.as_deref() else {
        return String::new();
    };
    let decoded = ContentEncoding::from_header(response.content_header(CONTENT_ENCODING))
        .and_then(|encoding| encoding.decode(body).ok());
    match decoded {
        Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        None => String::from_utf8_lossy(body).into_owned(),
    }
}

pub fn router(log: RequestLog) -> Router {
    Router::new()
        .route("/api/entries", get(entries_handler))
        .with_state(log)
}

/// Serve the inspector API on 127.0.0.1 until `shutdown` fires
pub async fn start_inspector(log: RequestLog, port: u16, shutdown: CancellationToken) {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to start inspector on port {}: {}", port, e);
            return;
        }
    };
    info!("Inspector API: http://localhost:{}/api/entries", port);

    if let Err(e) = serve(listener, log, shutdown).await {
        warn!("Inspector server error: {}", e);
    }
}

async fn serve(listener: TcpListener, log: RequestLog, shutdown: CancellationToken) -> std::io::Result<()> {
    axum::serve(listener, router(log))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Get all stored entries as JSON
async fn entries_handler(State(log): State<RequestLog>) -> Json<Vec<EntryView>> {
    Json(log.entries().await.into_iter().map(EntryView::from).collect())
}

//! Public HTTP surface of the relay
//!
//! Every inbound request is routed by the first label of its `Host` header
//! to a tunnel client, converted into an `HttpRequest` command and answered
//! with whatever the client sends back.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{
        header::{CONTENT_ENCODING, CONTENT_TYPE, HOST},
        HeaderMap, HeaderName, HeaderValue, Request, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use rtunnel_shared::protocol::{self, MAX_MESSAGE_SIZE};
use rtunnel_shared::{Error, HttpRequestData, HttpResponseData};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HttpListenerConfig;
use crate::headers::HeaderFilter;
use crate::registry::ClientRegistry;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Never forwarded back to the caller; they describe the tunnel hop only
const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "transfer-encoding", "upgrade"];

#[derive(Clone)]
pub struct BridgeState {
    registry: Arc<ClientRegistry>,
    filter: Arc<HeaderFilter>,
    permits: Arc<Semaphore>,
    default_status: StatusCode,
    timeout: Duration,
}

impl BridgeState {
    pub fn new(registry: Arc<ClientRegistry>, config: &HttpListenerConfig) -> Self {
        Self {
            registry,
            filter: Arc::new(HeaderFilter::new(&config.headers)),
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            default_status: StatusCode::from_u16(config.default_response_code)
                .unwrap_or(StatusCode::NOT_FOUND),
            timeout: config.timeout(),
        }
    }
}

pub fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/__rtunnel/health", get(|| async { "OK" }))
        .fallback(proxy_handler)
        .with_state(state)
}

/// Serve the public listener until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    state: BridgeState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!("HTTP listener on {}", listener.local_addr()?);
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}

async fn proxy_handler(
    State(state): State<BridgeState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    req: Request<Body>,
) -> Response {
    handle(&state, peer.map(|ConnectInfo(addr)| addr), req).await
}

/// How a request host selects its tunnel
#[derive(Debug, PartialEq, Eq)]
enum RouteKey<'a> {
    Any,
    Name(&'a str),
}

fn route_key(host: &str) -> RouteKey<'_> {
    let host = strip_port(host);
    if host.eq_ignore_ascii_case("localhost") || host.parse::<IpAddr>().is_ok() {
        return RouteKey::Any;
    }
    RouteKey::Name(host.split('.').next().unwrap_or(host))
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [::1]:8080
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.parse::<u16>().is_ok() => name,
        _ => host,
    }
}

fn request_host(req: &Request<Body>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or("")
        .to_string()
}

pub async fn handle(state: &BridgeState, peer: Option<SocketAddr>, req: Request<Body>) -> Response {
    let host = request_host(&req);
    let client = match route_key(&host) {
        RouteKey::Any => state.registry.lookup_any().await,
        RouteKey::Name(name) => state.registry.lookup(name).await,
    };
    let Some(client) = client else {
        debug!("No tunnel for host '{}'", host);
        return state.default_status.into_response();
    };

    let Ok(_permit) = state.permits.clone().acquire_owned().await else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let method = parts.method.to_string();

    let body = match axum::body::to_bytes(body, MAX_MESSAGE_SIZE).await {
        Ok(b) => b,
        Err(e) => {
            warn!("Rejecting {} {}: {}", method, path, e);
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let filtered = state.filter.filter(&parts.headers);
    let client_ip = filtered
        .client_ip
        .or_else(|| peer.map(|p| p.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    let request = HttpRequestData {
        method: method.clone(),
        path: path.clone(),
        headers: filtered.headers,
        content_headers: content_headers(&parts.headers, body.len()),
        content: (!body.is_empty()).then(|| body.to_vec()),
    };

    info!("{} => {}: {}", client_ip, method, path);

    match client.exchange(&request, state.timeout).await {
        Ok(response) => build_response(response),
        Err(e) => {
            error!("{} {} via '{}' failed: {}", method, path, client.name(), e);
            error_status(&e).into_response()
        }
    }
}

fn content_headers(headers: &HeaderMap, len: usize) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_CONTENT_TYPE);
    out.insert(protocol::CONTENT_TYPE.to_string(), content_type.to_string());
    out.insert(protocol::CONTENT_LENGTH.to_string(), len.to_string());
    if let Some(encoding) = headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok()) {
        out.insert(protocol::CONTENT_ENCODING.to_string(), encoding.to_string());
    }
    out
}

fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn build_response(resp: HttpResponseData) -> Response {
    let Some(body) = resp.content.clone() else {
        warn!("Tunnel response without content");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let status = StatusCode::from_u16(resp.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);

    if let Some(headers_mut) = builder.headers_mut() {
        for (k, v) in &resp.headers {
            if HOP_BY_HOP.iter().any(|h| k.eq_ignore_ascii_case(h)) {
                continue;
            }
            match (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
                (Ok(name), Ok(value)) => {
                    headers_mut.append(name, value);
                }
                _ => debug!("Skipping invalid response header '{}'", k),
            }
        }

        // the body length is set from the body itself
        for (k, v) in &resp.content_headers {
            if k.eq_ignore_ascii_case(protocol::CONTENT_LENGTH) {
                continue;
            }
            match (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
                (Ok(name), Ok(value)) => {
                    headers_mut.insert(name, value);
                }
                _ => debug!("Skipping invalid content header '{}'", k),
            }
        }
        if !headers_mut.contains_key(CONTENT_TYPE) {
            headers_mut.insert(CONTENT_TYPE, HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
        }
    }

    match builder.body(Body::from(body)) {
        Ok(r) => r,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

//! Local request executor
//!
//! Replays a tunnelled [`HttpRequestData`] against the configured local
//! service and packs the answer into an [`HttpResponseData`].

use std::collections::HashMap;
use std::time::Instant;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use reqwest::Method;
use rtunnel_shared::protocol::{
    canonical_header_name, CONTENT_LENGTH, CONTENT_TYPE, MAX_MESSAGE_SIZE,
};
use rtunnel_shared::{Error, HttpRequestData, HttpResponseData, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::TunnelSetting;
use crate::inspector::{LogEntry, RequestLog};
use crate::rewrite::UrlRewriter;

/// Response headers reported as content headers
const CONTENT_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "content-encoding",
    "content-language",
    "content-location",
    "content-disposition",
    "content-range",
    "expires",
    "last-modified",
    "allow",
];

pub struct Executor {
    http: reqwest::Client,
    tunnel: String,
    local: String,
    host_header: Option<HeaderValue>,
    custom_headers: Vec<(HeaderName, HeaderValue)>,
    rewriter: Option<UrlRewriter>,
    log: RequestLog,
}

impl Executor {
    pub fn new(setting: &TunnelSetting, log: RequestLog) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {}", e)))?;

        let host_header = match setting.host_header.as_deref() {
            Some(host) => Some(
                HeaderValue::from_str(host)
                    .map_err(|_| Error::Config(format!("invalid host_header '{}'", host)))?,
            ),
            None => None,
        };

        let mut custom_headers = Vec::new();
        for (k, v) in &setting.custom_headers {
            match (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
                (Ok(name), Ok(value)) => custom_headers.push((name, value)),
                _ => warn!(tunnel = %setting.name, "Skipping invalid custom header '{}'", k),
            }
        }

        let rewriter = setting.rewrite_pattern().map(UrlRewriter::new).transpose()?;

        Ok(Self {
            http,
            tunnel: setting.name.clone(),
            local: setting.local.trim_end_matches('/').to_string(),
            host_header,
            custom_headers,
            rewriter,
            log,
        })
    }

    /// Call the local service. `public_url` enables URL rewriting once known.
    pub async fn execute(
        &self,
        id: Uuid,
        request: &HttpRequestData,
        public_url: Option<&str>,
    ) -> Result<HttpResponseData> {
        let start = Instant::now();
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| Error::Upstream(format!("invalid method '{}'", request.method)))?;
        let url = join_url(&self.local, &request.path);
        debug!(tunnel = %self.tunnel, "{} {}", method, url);

        let mut builder = self
            .http
            .request(method, &url)
            .headers(self.request_headers(request));

        if let Some(body) = request.content.as_ref().filter(|b| !b.is_empty()) {
            let mut content_headers = HeaderMap::new();
            for (k, v) in &request.content_headers {
                if k.eq_ignore_ascii_case(CONTENT_LENGTH) {
                    continue;
                }
                insert_header(&mut content_headers, k, v);
            }
            builder = builder.headers(content_headers).body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("{}: {}", url, e)))?;

        let status_code = response.status().as_u16();
        let mut headers = HashMap::new();
        let mut content_headers = HashMap::new();
        for name in response.headers().keys() {
            let joined = response
                .headers()
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect::<Vec<_>>()
                .join(",");
            let target = if CONTENT_HEADERS.contains(&name.as_str()) {
                &mut content_headers
            } else {
                &mut headers
            };
            target.insert(canonical_header_name(name.as_str()), joined);
        }

        let body = read_body(response, MAX_MESSAGE_SIZE)
            .await
            .map_err(|e| Error::Upstream(format!("{}: {}", url, e)))?;

        let mut result = match body {
            Some(body) => HttpResponseData {
                status_code,
                headers,
                content: Some(body),
                content_headers,
            },
            None => {
                warn!(
                    tunnel = %self.tunnel,
                    "{} {}: response exceeds {} bytes",
                    request.method,
                    request.path,
                    MAX_MESSAGE_SIZE
                );
                too_large()
            }
        };
        if result.content_header(CONTENT_LENGTH).is_none() {
            let len = result.content.as_ref().map_or(0, Vec::len);
            result.set_content_header(CONTENT_LENGTH, len.to_string());
        }

        if let (Some(rewriter), Some(public_url)) = (&self.rewriter, public_url) {
            if let Err(e) = rewriter.rewrite(&mut result, public_url) {
                warn!(tunnel = %self.tunnel, "URL rewrite failed for {}: {}", request.path, e);
            }
        }

        self.log
            .record(LogEntry {
                id,
                tunnel: self.tunnel.clone(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                latency_ms: start.elapsed().as_millis() as u64,
                request: request.clone(),
                response: result.clone(),
            })
            .await;

        Ok(result)
    }

    fn request_headers(&self, request: &HttpRequestData) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (k, v) in &request.headers {
            if k.eq_ignore_ascii_case("host") {
                if let Some(host) = &self.host_header {
                    headers.insert(HOST, host.clone());
                    continue;
                }
            }
            if k.eq_ignore_ascii_case("content-length") || k.eq_ignore_ascii_case("content-type") {
                continue;
            }
            insert_header(&mut headers, k, v);
        }

        for (name, value) in &self.custom_headers {
            headers.insert(name.clone(), value.clone());
        }

        headers
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => warn!("Skipping invalid header '{}'", name),
    }
}

/// Reads at most `limit` bytes; `None` when the body is larger.
async fn read_body(mut response: reqwest::Response, limit: usize) -> reqwest::Result<Option<Vec<u8>>> {
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Ok(None);
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > limit {
            return Ok(None);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Some(body))
}

/// Answer sent in place of a body that would not fit in one tunnel frame
fn too_large() -> HttpResponseData {
    let message = format!("Response from local service exceeds {} bytes", MAX_MESSAGE_SIZE);
    let mut content_headers = HashMap::new();
    content_headers.insert(CONTENT_TYPE.to_string(), "text/plain; charset=utf-8".to_string());
    HttpResponseData {
        status_code: 502,
        headers: HashMap::new(),
        content: Some(message.into_bytes()),
        content_headers,
    }
}

/// `http://localhost:3000/` + `/api?q=1` → `http://localhost:3000/api?q=1`
fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Bytes,
        http::{header, HeaderMap as AxumHeaders, StatusCode},
        response::IntoResponse,
        routing::{any, get},
        Json, Router,
    };
    use flate2::{read::GzDecoder, write::GzEncoder, Compression};
    use std::io::{Read, Write};
    use tokio::net::TcpListener;

    const HTML: &str = r#"<a href="http://internal.local/docs">docs</a>"#;

    async fn status() -> impl IntoResponse {
        ([(header::CONTENT_TYPE, "application/json")], r#"{"ok":true}"#)
    }

    async fn echo(headers: AxumHeaders, body: Bytes) -> Json<serde_json::Value> {
        let headers: HashMap<String, String> = headers
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        Json(serde_json::json!({
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
        }))
    }

    async fn gzipped_html() -> impl IntoResponse {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(HTML.as_bytes()).unwrap();
        (
            [
                (header::CONTENT_TYPE, "text/html"),
                (header::CONTENT_ENCODING, "gzip"),
            ],
            encoder.finish().unwrap(),
        )
    }

    async fn large() -> Vec<u8> {
        vec![b'x'; MAX_MESSAGE_SIZE + 1]
    }

    async fn redirect() -> impl IntoResponse {
        (StatusCode::FOUND, [(header::LOCATION, "/elsewhere")])
    }

    async fn local_service() -> String {
        let app = Router::new()
            .route("/status", get(status))
            .route("/echo", any(echo))
            .route("/page", get(gzipped_html))
            .route("/large", get(large))
            .route("/redirect", get(redirect));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    fn setting(local: &str) -> TunnelSetting {
        TunnelSetting::new("web", "localhost:8081", local)
    }

    fn request(method: &str, path: &str) -> HttpRequestData {
        HttpRequestData {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://a:1", "/x?y=1"), "http://a:1/x?y=1");
        assert_eq!(join_url("http://a:1/", "x"), "http://a:1/x");
        assert_eq!(join_url("http://a:1/base/", "/x"), "http://a:1/base/x");
    }

    #[tokio::test]
    async fn test_status_json() {
        let local = local_service().await;
        let log = RequestLog::default();
        let executor = Executor::new(&setting(&local), log.clone()).unwrap();

        let resp = executor
            .execute(Uuid::new_v4(), &request("GET", "/status"), None)
            .await
            .unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.content_header("Content-Type"), Some("application/json"));
        assert_eq!(resp.content_header("Content-Length"), Some("11"));
        assert_eq!(resp.content.as_deref().unwrap(), br#"{"ok":true}"#);

        let entries = log.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].request.path, "/status");
        assert_eq!(entries[0].tunnel, "web");
    }

    #[tokio::test]
    async fn test_request_headers_and_body() {
        let local = local_service().await;
        let mut setting = setting(&local);
        setting.host_header = Some("app.internal".into());
        setting
            .custom_headers
            .insert("X-Tunnel".into(), "web".into());
        let executor = Executor::new(&setting, RequestLog::default()).unwrap();

        let mut req = request("POST", "/echo");
        req.headers.insert("Host".into(), "foo.example.com".into());
        req.headers.insert("Accept".into(), "text/plain".into());
        req.headers.insert("Content-Type".into(), "text/bogus".into());
        req.headers.insert("Bad Header".into(), "x".into());
        req.content = Some(b"hello".to_vec());
        req.content_headers.insert("Content-Type".into(), "text/plain".into());
        req.content_headers.insert("Content-Length".into(), "999".into());

        let resp = executor.execute(Uuid::new_v4(), &req, None).await.unwrap();
        let echoed: serde_json::Value =
            serde_json::from_slice(resp.content.as_deref().unwrap()).unwrap();

        assert_eq!(echoed["body"], "hello");
        assert_eq!(echoed["headers"]["host"], "app.internal");
        assert_eq!(echoed["headers"]["accept"], "text/plain");
        assert_eq!(echoed["headers"]["x-tunnel"], "web");
        assert_eq!(echoed["headers"]["content-type"], "text/plain");
        assert_eq!(echoed["headers"]["content-length"], "5");
    }

    #[tokio::test]
    async fn test_gzip_html_rewritten() {
        let local = local_service().await;
        let mut setting = setting(&local);
        setting.rewrite_url_enabled = true;
        setting.rewrite_url_pattern = Some(r"http://internal\.local".into());
        let executor = Executor::new(&setting, RequestLog::default()).unwrap();

        // no public URL yet: body passes through untouched
        let untouched = executor
            .execute(Uuid::new_v4(), &request("GET", "/page"), None)
            .await
            .unwrap();
        let mut text = String::new();
        GzDecoder::new(untouched.content.as_deref().unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, HTML);

        let resp = executor
            .execute(
                Uuid::new_v4(),
                &request("GET", "/page"),
                Some("https://foo.example.com"),
            )
            .await
            .unwrap();
        let body = resp.content.as_deref().unwrap();
        assert_eq!(resp.content_header("Content-Encoding"), Some("gzip"));
        assert_eq!(
            resp.content_header("Content-Length").unwrap(),
            body.len().to_string()
        );
        let mut text = String::new();
        GzDecoder::new(body).read_to_string(&mut text).unwrap();
        assert_eq!(text, r#"<a href="https://foo.example.com/docs">docs</a>"#);
    }

    #[tokio::test]
    async fn test_redirect_not_followed() {
        let local = local_service().await;
        let executor = Executor::new(&setting(&local), RequestLog::default()).unwrap();
        let resp = executor
            .execute(Uuid::new_v4(), &request("GET", "/redirect"), None)
            .await
            .unwrap();
        assert_eq!(resp.status_code, 302);
        assert_eq!(resp.headers.get("Location").map(String::as_str), Some("/elsewhere"));
    }

    #[tokio::test]
    async fn test_oversize_response_answered_with_error() {
        let local = local_service().await;
        let log = RequestLog::default();
        let executor = Executor::new(&setting(&local), log.clone()).unwrap();

        let resp = executor
            .execute(Uuid::new_v4(), &request("GET", "/large"), None)
            .await
            .unwrap();
        assert_eq!(resp.status_code, 502);
        let body = resp.content.as_deref().unwrap();
        assert!(body.len() < 1024);
        assert_eq!(
            resp.content_header("Content-Length").unwrap(),
            body.len().to_string()
        );
        assert_eq!(log.entries().await[0].response.status_code, 502);
    }

    #[tokio::test]
    async fn test_invalid_method() {
        let executor = Executor::new(&setting("http://127.0.0.1:1"), RequestLog::default()).unwrap();
        let err = executor
            .execute(Uuid::new_v4(), &request("NOT A METHOD", "/"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
    }

    #[tokio::test]
    async fn test_unreachable_local_service() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let log = RequestLog::default();
        let executor =
            Executor::new(&setting(&format!("http://127.0.0.1:{}", port)), log.clone()).unwrap();
        let err = executor
            .execute(Uuid::new_v4(), &request("GET", "/"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
        assert!(log.entries().await.is_empty());
    }
}

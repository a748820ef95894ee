//! Request header filtering
//!
//! Strips blacklisted headers before a request enters the tunnel and pulls
//! the caller's address out of the configured forwarding header.

use std::collections::{HashMap, HashSet};

use axum::http::HeaderMap;
use rtunnel_shared::protocol::canonical_header_name;

use crate::config::HeaderConfig;

/// Headers that describe the body and travel as content headers instead
const CONTENT_HEADERS: &[&str] = &["content-type", "content-length", "content-encoding"];

/// Header filter configuration
#[derive(Debug, Clone)]
pub struct HeaderFilter {
    /// Exact names, lowercased
    blacklist: HashSet<String>,
    /// Name prefixes from `Prefix-*` entries, lowercased
    wildcards: Vec<String>,
    ip_header: String,
}

/// Result of filtering one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilteredHeaders {
    pub headers: HashMap<String, String>,
    pub client_ip: Option<String>,
}

impl Default for HeaderFilter {
    fn default() -> Self {
        Self::new(&HeaderConfig::default())
    }
}

impl HeaderFilter {
    pub fn new(config: &HeaderConfig) -> Self {
        let mut blacklist = HashSet::new();
        let mut wildcards = Vec::new();
        for entry in &config.blacklist {
            if entry.contains('*') {
                wildcards.push(entry.trim_end_matches('*').to_ascii_lowercase());
            } else {
                blacklist.insert(entry.to_ascii_lowercase());
            }
        }

        Self {
            blacklist,
            wildcards,
            ip_header: config.ip_header_name.to_ascii_lowercase(),
        }
    }

    pub fn is_blocked(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.blacklist.contains(&name) || self.wildcards.iter().any(|w| name.starts_with(w))
    }

    /// Copy the forwardable headers, joining repeated values with `,`.
    pub fn filter(&self, headers: &HeaderMap) -> FilteredHeaders {
        let mut out = FilteredHeaders::default();

        for name in headers.keys() {
            let key = name.as_str();
            if CONTENT_HEADERS.contains(&key) || self.is_blocked(key) {
                continue;
            }

            let values: Vec<&str> = headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            if values.is_empty() {
                continue;
            }
            let joined = values.join(",");

            if key == self.ip_header {
                // first hop of X-Forwarded-For style lists is the caller
                out.client_ip = joined.split(',').next().map(|ip| ip.trim().to_string());
                continue;
            }

            out.headers.insert(canonical_header_name(key), joined);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn filter(blacklist: &[&str]) -> HeaderFilter {
        HeaderFilter::new(&HeaderConfig {
            blacklist: blacklist.iter().map(|s| s.to_string()).collect(),
            ip_header_name: "X-Forwarded-For".into(),
        })
    }

    #[test]
    fn test_exact_and_wildcard_blacklist() {
        let f = filter(&["Authorization", "X-Internal-*"]);
        assert!(f.is_blocked("authorization"));
        assert!(f.is_blocked("AUTHORIZATION"));
        assert!(f.is_blocked("x-internal-token"));
        assert!(f.is_blocked("X-Internal-"));
        assert!(!f.is_blocked("X-Intern"));
        assert!(!f.is_blocked("Accept"));
    }

    #[test]
    fn test_filter_headers() {
        let f = filter(&["Authorization", "X-Internal-*"]);
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("x-internal-trace", HeaderValue::from_static("abc"));
        headers.insert("accept", HeaderValue::from_static("text/html"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, 10.0.0.1"));
        headers.append("cache-control", HeaderValue::from_static("no-cache"));
        headers.append("cache-control", HeaderValue::from_static("no-store"));

        let out = f.filter(&headers);
        assert_eq!(out.client_ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(out.headers.get("Accept").map(String::as_str), Some("text/html"));
        assert_eq!(
            out.headers.get("Cache-Control").map(String::as_str),
            Some("no-cache,no-store")
        );
        assert!(!out.headers.contains_key("Authorization"));
        assert!(!out.headers.contains_key("X-Internal-Trace"));
        assert!(!out.headers.contains_key("Content-Type"));
        assert!(!out.headers.contains_key("X-Forwarded-For"));
    }

    #[test]
    fn test_no_ip_header() {
        let out = filter(&[]).filter(&HeaderMap::new());
        assert!(out.client_ip.is_none());
        assert!(out.headers.is_empty());
    }
}

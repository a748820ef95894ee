//! URL rewriting for HTML responses
//!
//! Local services often render absolute links to their own address. When
//! enabled, matches of the configured pattern in `text/html` bodies are
//! replaced by the tunnel's public URL. Compressed bodies are decoded and
//! re-encoded with the same scheme.

use regex::{NoExpand, Regex};
use rtunnel_shared::encoding::ContentEncoding;
use rtunnel_shared::protocol::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use rtunnel_shared::{Error, HttpResponseData, Result};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct UrlRewriter {
    pattern: Regex,
}

impl UrlRewriter {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid rewrite pattern: {}", e)))?;
        Ok(Self { pattern })
    }

    pub fn applies_to(response: &HttpResponseData) -> bool {
        response
            .content_header(CONTENT_TYPE)
            .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
            .unwrap_or(false)
    }

    /// Rewrite `response` in place. Returns whether the body was replaced.
    pub fn rewrite(&self, response: &mut HttpResponseData, public_url: &str) -> Result<bool> {
        if !Self::applies_to(response) {
            return Ok(false);
        }
        let Some(body) = response.content.as_deref() else {
            return Ok(false);
        };
        let Some(encoding) = ContentEncoding::from_header(response.content_header(CONTENT_ENCODING))
        else {
            debug!(
                "Skipping rewrite for unsupported encoding {:?}",
                response.content_header(CONTENT_ENCODING)
            );
            return Ok(false);
        };

        let decoded = encoding.decode(body)?;
        let Ok(text) = String::from_utf8(decoded) else {
            debug!("Skipping rewrite for non UTF-8 HTML body");
            return Ok(false);
        };

        let rewritten = self.pattern.replace_all(&text, NoExpand(public_url));
        let encoded = encoding.encode(rewritten.as_bytes())?;

        response.set_content_header(CONTENT_LENGTH, encoded.len().to_string());
        response.content = Some(encoded);
        Ok(true)
    }
}

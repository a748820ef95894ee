//! Content-Encoding codecs used when rewriting response bodies.

use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};

use crate::Result;

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_LG_WINDOW: u32 = 22;

/// Body encodings understood by the rewriter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Brotli,
}

impl ContentEncoding {
    /// Parse a `Content-Encoding` header value. Unknown schemes yield `None`.
    pub fn from_header(value: Option<&str>) -> Option<Self> {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("identity") => Some(ContentEncoding::Identity),
            Some("gzip") | Some("x-gzip") => Some(ContentEncoding::Gzip),
            Some("br") => Some(ContentEncoding::Brotli),
            Some(_) => None,
        }
    }

    pub fn decode(self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            ContentEncoding::Identity => out.extend_from_slice(data),
            ContentEncoding::Gzip => {
                GzDecoder::new(data).read_to_end(&mut out)?;
            }
            ContentEncoding::Brotli => {
                brotli::Decompressor::new(data, BROTLI_BUFFER_SIZE).read_to_end(&mut out)?;
            }
        }
        Ok(out)
    }

    pub fn encode(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            ContentEncoding::Identity => Ok(data.to_vec()),
            ContentEncoding::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            ContentEncoding::Brotli => {
                let mut out = Vec::new();
                {
                    let mut writer = brotli::CompressorWriter::new(
                        &mut out,
                        BROTLI_BUFFER_SIZE,
                        BROTLI_QUALITY,
                        BROTLI_LG_WINDOW,
                    );
                    writer.write_all(data)?;
                }
                Ok(out)
            }
        }
    }
}

//! Response compression: negotiates brotli, gzip or deflate against the request's
//! `Accept-Encoding` header and compresses the body a handler already produced.
//!
//! Grounded on the teacher's `ripress/src/middlewares/compression.rs` (threshold,
//! content-type allow-list, `Vary`/`Content-Encoding` bookkeeping), generalized from
//! gzip-only to a three-way negotiation since `brotli` and `flate2`'s deflate encoder
//! are both already part of this crate's dependency stack.

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;

use crate::context::response::ResponseBodyKind;
use crate::context::Context;
use crate::error::Error;
use crate::middleware::{mw, Middleware};
use crate::router::Next;

/// Content-type prefixes worth spending CPU to compress. Binary formats that are
/// already compressed (images, video, most archives) are left alone.
const COMPRESSIBLE_PREFIXES: &[&str] = &[
    "text/",
    "application/json",
    "application/javascript",
    "application/xml",
    "application/rss+xml",
    "application/atom+xml",
    "application/xhtml+xml",
    "image/svg+xml",
];

/// Tuning knobs for the compression middleware.
#[derive(Clone)]
pub struct CompressionConfig {
    /// Bodies smaller than this are sent uncompressed; compressing a few dozen bytes
    /// typically costs more wire overhead than it saves.
    pub threshold: usize,
    /// Passed straight through to the chosen encoder (gzip/deflate: 0-9, brotli:
    /// 0-11; out-of-range values are clamped by the encoder itself).
    pub level: u32,
    /// When set, a response is only considered for compression if this returns true;
    /// defaults to the content-type allow-list in [`should_compress_content_type`].
    pub filter: Option<Arc<dyn Fn(&Context) -> bool + Send + Sync>>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            threshold: 1024,
            level: 6,
            filter: None,
        }
    }
}

impl std::fmt::Debug for CompressionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionConfig")
            .field("threshold", &self.threshold)
            .field("level", &self.level)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Brotli,
    Gzip,
    Deflate,
}

impl Encoding {
    fn header_name(self) -> &'static str {
        match self {
            Encoding::Brotli => "br",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }
}

/// Parses an `Accept-Encoding` value and returns the best encoding this middleware
/// supports, preferring brotli over gzip over deflate when q-values tie. An encoding
/// explicitly rejected with `q=0` is never chosen even if it would otherwise win.
fn negotiate(accept_encoding: &str) -> Option<Encoding> {
    let mut best: Option<(Encoding, f32)> = None;
    let mut wildcard_q: Option<f32> = None;

    for entry in accept_encoding.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let mut parts = entry.splitn(2, ';');
        let name = parts.next().unwrap_or("").trim();
        let q = parts
            .next()
            .and_then(|p| p.trim().strip_prefix("q="))
            .and_then(|v| v.parse::<f32>().ok())
            .unwrap_or(1.0);

        let candidate = match name.to_ascii_lowercase().as_str() {
            "br" => Some(Encoding::Brotli),
            "gzip" | "x-gzip" => Some(Encoding::Gzip),
            "deflate" => Some(Encoding::Deflate),
            "*" => {
                wildcard_q = Some(q);
                None
            }
            _ => None,
        };

        if let Some(enc) = candidate {
            if q <= 0.0 {
                continue;
            }
            let better = match best {
                Some((_, best_q)) if q > best_q => true,
                Some((best_enc, best_q)) if q == best_q => rank(enc) > rank(best_enc),
                None => true,
                _ => false,
            };
            if better {
                best = Some((enc, q));
            }
        }
    }

    if best.is_none() {
        if let Some(q) = wildcard_q {
            if q > 0.0 {
                best = Some((Encoding::Gzip, q));
            }
        }
    }

    best.map(|(enc, _)| enc)
}

fn rank(enc: Encoding) -> u8 {
    match enc {
        Encoding::Brotli => 3,
        Encoding::Gzip => 2,
        Encoding::Deflate => 1,
    }
}

fn should_compress_content_type(content_type: &str) -> bool {
    let bare = content_type.split(';').next().unwrap_or("").trim();
    COMPRESSIBLE_PREFIXES
        .iter()
        .any(|prefix| bare.starts_with(prefix))
}

fn compress_data(data: &[u8], encoding: Encoding, level: u32) -> std::io::Result<Vec<u8>> {
    match encoding {
        Encoding::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder.write_all(data)?;
            encoder.finish()
        }
        Encoding::Deflate => {
            let mut encoder =
                flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder.write_all(data)?;
            encoder.finish()
        }
        Encoding::Brotli => {
            let mut out = Vec::new();
            let params = brotli::enc::BrotliEncoderParams {
                quality: level.min(11) as i32,
                ..Default::default()
            };
            brotli::BrotliCompress(&mut std::io::Cursor::new(data), &mut out, &params)?;
            Ok(out)
        }
    }
}

/// Builds the compression middleware. Runs the rest of the chain first (it needs a
/// body to compress), then, if the response qualifies, replaces it with a compressed
/// one and sets `Content-Encoding`/`Vary` accordingly.
pub fn compression(config: CompressionConfig) -> impl Middleware {
    mw(move |ctx: &mut Context, next: Next| {
        let config = config.clone();
        async move {
            next.run(ctx).await?;

            if ctx.response.headers.contains("content-encoding") {
                return Ok(());
            }

            let accept_encoding = ctx.request.header("accept-encoding").map(str::to_string);
            let Some(accept_encoding) = accept_encoding else {
                return Ok(());
            };
            let Some(encoding) = negotiate(&accept_encoding) else {
                return Ok(());
            };

            if let Some(filter) = &config.filter {
                if !filter(ctx) {
                    return Ok(());
                }
            } else {
                let content_type = ctx.response.headers.get("content-type").unwrap_or("");
                if !should_compress_content_type(content_type) {
                    return Ok(());
                }
            }

            let original = match &ctx.response.body {
                ResponseBodyKind::Bytes(bytes) => bytes.clone(),
                // Streamed bodies are compressed incrementally nowhere in this crate
                // today; leave them alone rather than buffering an unbounded stream.
                ResponseBodyKind::Empty | ResponseBodyKind::Stream(_) => return Ok(()),
            };

            if original.len() < config.threshold {
                return Ok(());
            }

            match compress_data(&original, encoding, config.level) {
                Ok(compressed) => {
                    ctx.response.body = ResponseBodyKind::Bytes(Bytes::from(compressed));
                    ctx.response.headers.remove("content-length");
                    let _ = ctx
                        .response
                        .headers
                        .set("content-encoding", encoding.header_name());
                    let _ = ctx.response.headers.append("vary", "Accept-Encoding");
                    Ok(())
                }
                // Compression genuinely failing (encoder I/O error on an in-memory
                // buffer) is not something a client request should fail over; send
                // the original body uncompressed instead.
                Err(_) => Ok(()),
            }
        }
    })
}

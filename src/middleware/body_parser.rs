//! Dispatches a request's raw body bytes to a typed [`Body`](crate::context::request::Body)
//! variant based on `Content-Type`, enforcing a shared size budget (and, for JSON, a
//! nesting-depth budget) before any handler ever sees the parsed value.
//!
//! Grounded on the teacher's `middlewares/body_limit.rs` for the size-exceeded error
//! shape, and its `middlewares/file_upload.rs` / `helpers.rs` boundary-delimited
//! multipart scan, generalized here to feed every request body rather than only
//! file uploads.

use crate::context::request::{Body, UploadedFile};
use crate::context::Context;
use crate::error::Error;
use crate::middleware::{mw, Middleware};
use crate::primitives::json::{parse_json, JsonError, JsonLimits};
use crate::primitives::query::{parse_query_with_limit, Query, QueryError};
use crate::router::Next;

/// Byte and depth budgets shared by every content type this parser handles.
#[derive(Debug, Clone, Copy)]
pub struct BodyLimits {
    /// Maximum accepted body size, in bytes, regardless of content type.
    pub max_bytes: usize,
    /// Maximum nesting depth `application/json` bodies may use.
    pub json_depth: usize,
}

impl Default for BodyLimits {
    fn default() -> Self {
        BodyLimits {
            max_bytes: 1024 * 1024,
            json_depth: 20,
        }
    }
}

/// Configuration for [`body_parser`].
#[derive(Debug, Clone, Default)]
pub struct BodyParserConfig {
    pub limits: BodyLimits,
    /// When true, a content type this parser doesn't otherwise recognize is
    /// buffered as `Body::Raw` instead of being left unset.
    pub raw: bool,
}

/// Builds the body-parsing middleware. Runs once per request, before any handler
/// that reads `ctx.body()`; reads `ctx.request.raw_body` (already collected by the
/// connection kernel) and populates `ctx.request.body` accordingly.
pub fn body_parser(config: Option<BodyParserConfig>) -> impl Middleware {
    let config = config.unwrap_or_default();
    mw(move |ctx: &mut Context, next: Next| {
        let config = config.clone();
        async move {
            parse_body(ctx, &config)?;
            next.run(ctx).await
        }
    })
}

fn parse_body(ctx: &mut Context, config: &BodyParserConfig) -> Result<(), Error> {
    if ctx.request.raw_body.is_empty() {
        return Ok(());
    }

    let max_bytes = config.limits.max_bytes;
    if ctx.request.raw_body.len() > max_bytes {
        return Err(Error::payload_too_large(format!(
            "request body too large: {} bytes (limit {max_bytes})",
            ctx.request.raw_body.len()
        )));
    }

    let content_type = ctx.header("content-type").unwrap_or("").to_string();
    let mime: Option<mime::Mime> = content_type.parse().ok();
    let essence = mime
        .as_ref()
        .map(|m| m.essence_str().to_ascii_lowercase())
        .unwrap_or_default();

    match essence.as_str() {
        "application/json" => {
            let limits = JsonLimits {
                max_bytes,
                max_depth: config.limits.json_depth,
            };
            let value = parse_json(&ctx.request.raw_body, limits).map_err(json_error_to_http)?;
            ctx.request.body = Some(Body::Json(value));
        }
        "application/x-www-form-urlencoded" => {
            let text = std::str::from_utf8(&ctx.request.raw_body)
                .map_err(|_| Error::bad_request("request body is not valid UTF-8"))?;
            let query = parse_query_with_limit(text, max_bytes).map_err(query_error_to_http)?;
            ctx.request.body = Some(Body::Form(query));
        }
        "multipart/form-data" => {
            let boundary = mime
                .as_ref()
                .and_then(|m| m.get_param(mime::BOUNDARY))
                .map(|b| b.as_str().to_string())
                .ok_or_else(|| Error::bad_request("multipart/form-data request missing boundary"))?;
            let (fields, files) = parse_multipart(&ctx.request.raw_body, &boundary, max_bytes)?;
            ctx.request.body = Some(Body::Multipart {
                fields: Query::from_pairs(fields),
                files,
            });
        }
        other if other.starts_with("text/") => {
            let text = String::from_utf8(ctx.request.raw_body.to_vec())
                .map_err(|_| Error::bad_request("request body is not valid UTF-8"))?;
            ctx.request.body = Some(Body::Text(text));
        }
        _ => {
            if config.raw {
                ctx.request.body = Some(Body::Raw(ctx.request.raw_body.clone()));
            }
        }
    }

    Ok(())
}

fn json_error_to_http(err: JsonError) -> Error {
    match err {
        JsonError::TooLarge { size, limit } => {
            Error::payload_too_large(format!("json body too large: {size} bytes (limit {limit})"))
        }
        JsonError::TooDeep { limit } => {
            Error::bad_request(format!("json nesting exceeds limit of {limit}"))
        }
        JsonError::Malformed(msg) => Error::bad_request(format!("malformed json: {msg}")),
        JsonError::TrailingData => Error::bad_request("trailing data after json value"),
    }
}

fn query_error_to_http(err: QueryError) -> Error {
    match err {
        QueryError::TooLarge { size, limit } => {
            Error::payload_too_large(format!("form body too large: {size} bytes (limit {limit})"))
        }
        QueryError::DangerousKey(key) => {
            Error::bad_request(format!("rejected unsafe field name '{key}'"))
        }
        QueryError::MalformedEncoding => {
            Error::bad_request("malformed percent-encoding in form body")
        }
    }
}

/// Splits a `multipart/form-data` body into `(field name, value)` text pairs and
/// [`UploadedFile`]s, enforcing `max_bytes` against the aggregate size of all parts'
/// content (headers don't count, matching the budget a JSON or urlencoded body of
/// the same size would consume).
fn parse_multipart(
    body: &[u8],
    boundary: &str,
    max_bytes: usize,
) -> Result<(Vec<(String, String)>, Vec<UploadedFile>), Error> {
    let delimiter = format!("--{boundary}");
    let delimiter_bytes = delimiter.as_bytes();
    let next_delimiter = format!("\r\n--{boundary}");
    let next_delimiter_bytes = next_delimiter.as_bytes();

    let mut pos = find(body, delimiter_bytes)
        .map(|p| p + delimiter_bytes.len())
        .ok_or_else(|| Error::bad_request("multipart body missing its boundary"))?;

    let mut fields = Vec::new();
    let mut files = Vec::new();
    let mut total = 0usize;

    loop {
        if body.get(pos..pos + 2) == Some(b"--") {
            break;
        }
        if body.get(pos..pos + 2) != Some(b"\r\n") {
            return Err(Error::bad_request("malformed multipart part boundary"));
        }
        pos += 2;

        let header_end = find(&body[pos..], b"\r\n\r\n")
            .ok_or_else(|| Error::bad_request("malformed multipart part: missing header terminator"))?;
        let headers_str = std::str::from_utf8(&body[pos..pos + header_end])
            .map_err(|_| Error::bad_request("malformed multipart part headers"))?;
        let content_start = pos + header_end + 4;

        let content_len = find(&body[content_start..], next_delimiter_bytes).ok_or_else(|| {
            Error::bad_request("malformed multipart body: missing closing boundary")
        })?;
        let content_end = content_start + content_len;

        let (field_name, file_name, part_content_type) = parse_content_disposition(headers_str);
        let part_bytes = &body[content_start..content_end];

        total += part_bytes.len();
        if total > max_bytes {
            return Err(Error::payload_too_large(format!(
                "multipart body exceeds limit of {max_bytes} bytes"
            )));
        }

        if let Some(file_name) = file_name {
            files.push(UploadedFile {
                field_name: field_name.unwrap_or_default(),
                file_name: Some(file_name),
                content_type: part_content_type,
                data: bytes::Bytes::copy_from_slice(part_bytes),
            });
        } else if let Some(name) = field_name {
            fields.push((name, String::from_utf8_lossy(part_bytes).into_owned()));
        }

        pos = content_end + next_delimiter_bytes.len();
    }

    Ok((fields, files))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Reads `name`, `filename`, and (if present) a part-local `Content-Type` out of a
/// multipart part's raw header block.
fn parse_content_disposition(headers: &str) -> (Option<String>, Option<String>, Option<String>) {
    let mut name = None;
    let mut filename = None;
    let mut content_type = None;

    for line in headers.lines() {
        let line = line.trim();
        if let Some(rest) = strip_ci_prefix(line, "content-disposition:") {
            for param in rest.split(';').skip(1) {
                let param = param.trim();
                if let Some((key, value)) = param.split_once('=') {
                    let value = value.trim().trim_matches('"');
                    match key.trim().to_ascii_lowercase().as_str() {
                        "name" => name = Some(value.to_string()),
                        "filename" => filename = Some(value.to_string()),
                        _ => {}
                    }
                }
            }
        } else if let Some(rest) = strip_ci_prefix(line, "content-type:") {
            content_type = Some(rest.trim().to_string());
        }
    }

    (name, filename, content_type)
}

fn strip_ci_prefix<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Middleware;

    fn ctx_with_body(content_type: &str, body: &[u8]) -> Context {
        let mut ctx = Context::new();
        ctx.request.headers.set("content-type", content_type).unwrap();
        ctx.request.raw_body = bytes::Bytes::copy_from_slice(body);
        ctx
    }

    async fn run(ctx: &mut Context, config: Option<BodyParserConfig>) -> Result<(), Error> {
        let parser = body_parser(config);
        parser.call(ctx, Next::terminal()).await
    }

    #[tokio::test]
    async fn parses_json_body() {
        let mut ctx = ctx_with_body("application/json", br#"{"a":1}"#);
        run(&mut ctx, None).await.unwrap();
        assert_eq!(
            ctx.body().and_then(|b| b.as_json()),
            Some(&serde_json::json!({"a": 1}))
        );
    }

    #[tokio::test]
    async fn parses_urlencoded_body() {
        let mut ctx = ctx_with_body("application/x-www-form-urlencoded", b"a=1&b=two");
        run(&mut ctx, None).await.unwrap();
        match ctx.body() {
            Some(Body::Form(query)) => assert_eq!(query.get("b"), Some("two")),
            other => panic!("expected Body::Form, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn parses_text_body() {
        let mut ctx = ctx_with_body("text/plain", b"hello world");
        run(&mut ctx, None).await.unwrap();
        assert_eq!(ctx.body().and_then(|b| b.as_text()), Some("hello world"));
    }

    #[tokio::test]
    async fn unrecognized_content_type_left_untouched_without_raw_opt_in() {
        let mut ctx = ctx_with_body("application/octet-stream", b"\x00\x01\x02");
        run(&mut ctx, None).await.unwrap();
        assert!(ctx.body().is_none());
    }

    #[tokio::test]
    async fn unrecognized_content_type_buffered_when_raw_enabled() {
        let mut ctx = ctx_with_body("application/octet-stream", b"\x00\x01\x02");
        run(
            &mut ctx,
            Some(BodyParserConfig {
                raw: true,
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(
            ctx.body().and_then(|b| b.as_raw()).map(|b| b.len()),
            Some(3)
        );
    }

    #[tokio::test]
    async fn oversize_body_rejected_with_413() {
        let mut ctx = ctx_with_body("application/json", &[b'a'; 32]);
        let err = run(
            &mut ctx,
            Some(BodyParserConfig {
                limits: BodyLimits {
                    max_bytes: 8,
                    json_depth: 20,
                },
                raw: false,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind().status(), 413);
    }

    #[tokio::test]
    async fn malformed_json_rejected_with_400() {
        let mut ctx = ctx_with_body("application/json", b"{not json");
        let err = run(&mut ctx, None).await.unwrap_err();
        assert_eq!(err.kind().status(), 400);
    }

    #[tokio::test]
    async fn parses_multipart_fields_and_files() {
        let body = b"--XBOUNDARY\r\n\
Content-Disposition: form-data; name=\"title\"\r\n\
\r\n\
hello\r\n\
--XBOUNDARY\r\n\
Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
Content-Type: text/plain\r\n\
\r\n\
file contents\r\n\
--XBOUNDARY--\r\n";
        let mut ctx = ctx_with_body("multipart/form-data; boundary=XBOUNDARY", body);
        run(&mut ctx, None).await.unwrap();
        match ctx.body() {
            Some(Body::Multipart { fields, files }) => {
                assert_eq!(fields.get("title"), Some("hello"));
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].field_name, "upload");
                assert_eq!(files[0].file_name.as_deref(), Some("a.txt"));
                assert_eq!(files[0].content_type.as_deref(), Some("text/plain"));
                assert_eq!(files[0].data.as_ref(), b"file contents");
            }
            other => panic!("expected Body::Multipart, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_body_leaves_ctx_body_unset() {
        let mut ctx = Context::new();
        run(&mut ctx, None).await.unwrap();
        assert!(ctx.body().is_none());
    }
}

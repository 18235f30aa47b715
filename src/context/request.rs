//! The request-facing half of a [`crate::context::Context`]: method, path, parsed
//! query, headers, cookies, route params, and the body once a body-parsing
//! middleware has populated it.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::primitives::query::Query as ParsedQuery;

/// Re-exported so derive macros can refer to `expresso::context::request::Query`
/// without reaching into `primitives`.
pub use crate::primitives::query::{Query, QueryValue};

/// An in-memory uploaded file extracted from a `multipart/form-data` body by the
/// body-parsing middleware.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field_name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: bytes::Bytes,
}

/// The parsed request body, set by the body-parsing middleware based on
/// `Content-Type`. `None` until that middleware runs (or if none is mounted).
#[derive(Debug, Clone)]
pub enum Body {
    Json(serde_json::Value),
    Form(ParsedQuery),
    Text(String),
    Raw(bytes::Bytes),
    Multipart {
        fields: ParsedQuery,
        files: Vec<UploadedFile>,
    },
}

impl Body {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Body::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<&bytes::Bytes> {
        match self {
            Body::Raw(b) => Some(b),
            _ => None,
        }
    }
}

/// Route parameters captured by the router's pattern match (`:id` -> value).
#[derive(Debug, Clone, Default)]
pub struct Params {
    entries: HashMap<String, String>,
}

impl Params {
    pub fn new() -> Self {
        Params::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(name.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The request-side state of a [`crate::context::Context`].
#[derive(Debug, Clone)]
pub struct RequestState {
    pub method: http::Method,
    /// The path as originally received, never mutated by router mounting. Middleware
    /// that needs the request's true path (logging, the cache key) should read this
    /// rather than `path`.
    pub original_path: String,
    /// The path as seen by the currently-executing handler: nested routers strip
    /// their mount prefix off this field for the duration of their subtree and
    /// restore it afterwards.
    pub path: String,
    pub query_string: String,
    pub query: ParsedQuery,
    pub headers: super::headers::Headers,
    pub cookies: HashMap<String, String>,
    pub params: Params,
    pub body: Option<Body>,
    /// The request body exactly as received off the wire, before any body-parsing
    /// middleware has looked at `Content-Type` and populated `body`. Middleware that
    /// needs the bytes regardless of content type (a raw proxy, a signature check)
    /// reads this directly instead of waiting on `body`.
    pub raw_body: bytes::Bytes,
    pub remote_addr: Option<SocketAddr>,
    pub is_secure: bool,
}

impl RequestState {
    pub fn new() -> Self {
        RequestState {
            method: http::Method::GET,
            original_path: String::new(),
            path: String::new(),
            query_string: String::new(),
            query: ParsedQuery::default(),
            headers: super::headers::Headers::new(),
            cookies: HashMap::new(),
            params: Params::new(),
            body: None,
            raw_body: bytes::Bytes::new(),
            remote_addr: None,
            is_secure: false,
        }
    }

    /// Resets all fields to their empty state so this allocation can be reused by the
    /// next request pulled from the [`super::pool::ContextPool`].
    pub fn reset(&mut self) {
        self.method = http::Method::GET;
        self.original_path.clear();
        self.path.clear();
        self.query_string.clear();
        self.query = ParsedQuery::default();
        self.headers = super::headers::Headers::new();
        self.cookies.clear();
        self.params.clear();
        self.body = None;
        self.raw_body = bytes::Bytes::new();
        self.remote_addr = None;
        self.is_secure = false;
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// True when `X-Requested-With: XMLHttpRequest` is present.
    pub fn xhr(&self) -> bool {
        self.header("x-requested-with")
            .map(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
            .unwrap_or(false)
    }
}

impl Default for RequestState {
    fn default() -> Self {
        RequestState::new()
    }
}

/// Splits an HTTP cookie header value (`a=1; b=2`) into a map. Malformed segments
/// (no `=`, empty name) are skipped rather than rejecting the whole header.
pub fn parse_cookie_header(value: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for part in value.split(';') {
        let part = part.trim();
        if let Some((name, val)) = part.split_once('=') {
            let name = name.trim();
            if !name.is_empty() {
                out.insert(name.to_string(), val.trim().to_string());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cookie_header_pairs() {
        let cookies = parse_cookie_header("session=abc123; theme=dark");
        assert_eq!(cookies.get("session"), Some(&"abc123".to_string()));
        assert_eq!(cookies.get("theme"), Some(&"dark".to_string()));
    }

    #[test]
    fn skips_malformed_cookie_segments() {
        let cookies = parse_cookie_header("valid=1; ; =noKeyValue; also=2");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies.get("valid"), Some(&"1".to_string()));
        assert_eq!(cookies.get("also"), Some(&"2".to_string()));
    }

    #[test]
    fn params_round_trip() {
        let mut params = Params::new();
        params.insert("id", "42");
        assert_eq!(params.get("id"), Some("42"));
        assert_eq!(params.get("missing"), None);
    }

    #[test]
    fn reset_clears_all_fields() {
        let mut req = RequestState::new();
        req.path = "/users/42".to_string();
        req.params.insert("id", "42");
        req.body = Some(Body::Text("hi".to_string()));
        req.reset();
        assert!(req.path.is_empty());
        assert!(req.params.is_empty());
        assert!(req.body.is_none());
    }
}

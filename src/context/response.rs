//! The response-facing half of a [`crate::context::Context`]: status, headers,
//! cookies-to-set, and the body the handler ultimately produced.

use bytes::Bytes;
use futures_util::stream::BoxStream;

use super::headers::Headers;

/// An outgoing `Set-Cookie` directive, built by [`super::Context::cookie`] and
/// serialized when the response is flushed.
#[derive(Debug, Clone)]
pub struct OutgoingCookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub max_age_seconds: Option<i64>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: SameSite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl OutgoingCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        OutgoingCookie {
            name: name.into(),
            value: value.into(),
            path: Some("/".to_string()),
            domain: None,
            max_age_seconds: None,
            http_only: true,
            secure: false,
            same_site: SameSite::Lax,
        }
    }

    /// A directive that clears a previously-set cookie by the same name.
    pub fn removal(name: impl Into<String>) -> Self {
        let mut cookie = OutgoingCookie::new(name, "");
        cookie.max_age_seconds = Some(0);
        cookie
    }

    pub fn to_header_value(&self) -> String {
        let mut out = format!(
            "{}={}",
            urlencoding::encode(&self.name),
            urlencoding::encode(&self.value)
        );
        if let Some(path) = &self.path {
            out.push_str(&format!("; Path={path}"));
        }
        if let Some(domain) = &self.domain {
            out.push_str(&format!("; Domain={domain}"));
        }
        if let Some(max_age) = self.max_age_seconds {
            out.push_str(&format!("; Max-Age={max_age}"));
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if self.secure {
            out.push_str("; Secure");
        }
        match self.same_site {
            SameSite::Strict => out.push_str("; SameSite=Strict"),
            SameSite::Lax => out.push_str("; SameSite=Lax"),
            SameSite::None => out.push_str("; SameSite=None"),
        }
        out
    }
}

/// The body a handler produced, in the form it will be sent to the client. A plain
/// `Bytes` body is written with a known `Content-Length`; a `Stream` body is written
/// chunked and never buffered in full.
pub enum ResponseBodyKind {
    Empty,
    Bytes(Bytes),
    Stream(BoxStream<'static, Result<Bytes, crate::error::Error>>),
}

impl std::fmt::Debug for ResponseBodyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBodyKind::Empty => write!(f, "Empty"),
            ResponseBodyKind::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            ResponseBodyKind::Stream(_) => write!(f, "Stream"),
        }
    }
}

/// The response-side state of a [`crate::context::Context`].
#[derive(Debug)]
pub struct ResponseState {
    pub status_code: u16,
    pub headers: Headers,
    pub cookies: Vec<OutgoingCookie>,
    pub body: ResponseBodyKind,
    /// Set the first time any `send`/`json`/`end`/`redirect` style method is called.
    /// A second call is a programming error (double-response), mirrored from the
    /// router's double-`next()` guard.
    pub sent: bool,
}

impl ResponseState {
    pub fn new() -> Self {
        ResponseState {
            status_code: 200,
            headers: Headers::new(),
            cookies: Vec::new(),
            body: ResponseBodyKind::Empty,
            sent: false,
        }
    }

    pub fn reset(&mut self) {
        self.status_code = 200;
        self.headers = Headers::new();
        self.cookies.clear();
        self.body = ResponseBodyKind::Empty;
        self.sent = false;
    }

    /// Sets the status code, rejecting anything outside the valid HTTP range.
    pub fn set_status(&mut self, code: u16) -> Result<(), crate::error::Error> {
        if !(100..=599).contains(&code) {
            return Err(crate::error::Error::programming_error(format!(
                "invalid status code {code}"
            )));
        }
        self.status_code = code;
        Ok(())
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), crate::error::Error> {
        self.headers
            .set(name, value)
            .map_err(|e| crate::error::Error::programming_error(e.to_string()))
    }

    pub fn set_json(&mut self, value: &serde_json::Value) -> Result<(), crate::error::Error> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| crate::error::Error::internal(e.to_string()))?;
        self.set_header("content-type", "application/json; charset=utf-8")?;
        self.body = ResponseBodyKind::Bytes(Bytes::from(bytes));
        self.sent = true;
        Ok(())
    }

    pub fn set_text(&mut self, text: impl Into<String>) -> Result<(), crate::error::Error> {
        self.set_header("content-type", "text/plain; charset=utf-8")?;
        self.body = ResponseBodyKind::Bytes(Bytes::from(text.into()));
        self.sent = true;
        Ok(())
    }

    pub fn set_html(&mut self, html: impl Into<String>) -> Result<(), crate::error::Error> {
        self.set_header("content-type", "text/html; charset=utf-8")?;
        self.body = ResponseBodyKind::Bytes(Bytes::from(html.into()));
        self.sent = true;
        Ok(())
    }

    pub fn set_bytes(
        &mut self,
        content_type: &str,
        bytes: Bytes,
    ) -> Result<(), crate::error::Error> {
        self.set_header("content-type", content_type)?;
        self.body = ResponseBodyKind::Bytes(bytes);
        self.sent = true;
        Ok(())
    }

    pub fn set_stream(
        &mut self,
        content_type: &str,
        stream: BoxStream<'static, Result<Bytes, crate::error::Error>>,
    ) -> Result<(), crate::error::Error> {
        self.set_header("content-type", content_type)?;
        self.body = ResponseBodyKind::Stream(stream);
        self.sent = true;
        Ok(())
    }

    /// Ends the response with no body, e.g. for `204 No Content` or a bare `end()`.
    pub fn end(&mut self) {
        self.sent = true;
    }

    /// Sets `Location` and a redirect status. Rejects non-`http(s)` schemes to
    /// prevent a handler from turning user input into a `javascript:`/`data:`
    /// redirect.
    pub fn redirect(&mut self, location: &str, status: u16) -> Result<(), crate::error::Error> {
        if !(300..=399).contains(&status) {
            return Err(crate::error::Error::programming_error(format!(
                "invalid redirect status {status}"
            )));
        }
        if is_relative(location) || location.starts_with("http://") || location.starts_with("https://") {
            self.set_header("location", location)?;
            self.status_code = status;
            self.sent = true;
            Ok(())
        } else {
            Err(crate::error::Error::bad_request(format!(
                "refusing to redirect to unsafe scheme in '{location}'"
            )))
        }
    }

    pub fn add_cookie(&mut self, cookie: OutgoingCookie) {
        self.cookies.push(cookie);
    }

    pub fn clear_cookie(&mut self, name: &str) {
        self.cookies.push(OutgoingCookie::removal(name));
    }

    /// A lossy UTF-8 view of a buffered body, for tests and for middleware (like the
    /// response cache) that need to inspect what a handler already produced. Returns
    /// `None` for an empty or streamed body.
    pub fn body_debug(&self) -> String {
        match &self.body {
            ResponseBodyKind::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            _ => String::new(),
        }
    }
}

impl Default for ResponseState {
    fn default() -> Self {
        ResponseState::new()
    }
}

fn is_relative(location: &str) -> bool {
    !location.contains(':') || location.starts_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_status_validates_range() {
        let mut res = ResponseState::new();
        assert!(res.set_status(204).is_ok());
        assert_eq!(res.status_code, 204);
        assert!(res.set_status(999).is_err());
    }

    #[test]
    fn json_sets_content_type_and_marks_sent() {
        let mut res = ResponseState::new();
        res.set_json(&serde_json::json!({"ok": true})).unwrap();
        assert_eq!(res.headers.get("content-type"), Some("application/json; charset=utf-8"));
        assert!(res.sent);
    }

    #[test]
    fn redirect_rejects_unsafe_scheme() {
        let mut res = ResponseState::new();
        assert!(res.redirect("javascript:alert(1)", 302).is_err());
        assert!(res.redirect("/relative/path", 302).is_ok());
        assert!(res.redirect("https://example.com", 302).is_ok());
    }

    #[test]
    fn redirect_rejects_out_of_range_status() {
        let mut res = ResponseState::new();
        assert!(res.redirect("/ok", 200).is_err());
    }

    #[test]
    fn cookie_header_value_includes_attributes() {
        let mut cookie = OutgoingCookie::new("session", "abc");
        cookie.secure = true;
        cookie.same_site = SameSite::Strict;
        let value = cookie.to_header_value();
        assert!(value.contains("session=abc"));
        assert!(value.contains("HttpOnly"));
        assert!(value.contains("Secure"));
        assert!(value.contains("SameSite=Strict"));
    }

    #[test]
    fn removal_cookie_sets_zero_max_age() {
        let cookie = OutgoingCookie::removal("session");
        assert_eq!(cookie.max_age_seconds, Some(0));
    }
}

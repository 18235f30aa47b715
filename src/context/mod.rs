//! The single mutable object threaded through an entire middleware chain: request
//! data in, response data out, plus a typed scratch map middleware use to pass data
//! to handlers further down the chain (the authenticated user, a parsed token, a
//! per-request trace id).
//!
//! Earlier designs split this into a request object and a response object built
//! fresh per middleware call. Here there is exactly one [`Context`] per request,
//! pulled from a [`pool::ContextPool`] and reset for reuse once the response is
//! flushed, and every middleware receives `&mut Context` to the same allocation.

pub mod headers;
pub mod pool;
pub mod redirect;
pub mod request;
pub mod response;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::error::Error;
use redirect::RedirectPolicy;
use request::{Body, Params, RequestState};
use response::{OutgoingCookie, ResponseState, SameSite};

/// Per-request mutable state shared by every middleware and handler in the chain.
pub struct Context {
    pub request: RequestState,
    pub response: ResponseState,
    /// Arbitrary typed values middleware attach for downstream handlers to read,
    /// keyed by a caller-chosen string (`"user"`, `"trace_id"`, ...). Not cleared
    /// between middleware invocations within one request, only on pool reuse.
    state: HashMap<String, Box<dyn Any + Send + Sync>>,
    /// Shared, immutable app-level config consulted by [`Context::redirect`]. Set by
    /// the kernel right after a [`Context`] is pulled off the pool; surviving a
    /// [`Context::reset`] is intentional — it is application config, not per-request
    /// state.
    redirect_policy: Arc<RedirectPolicy>,
}

impl Context {
    pub fn new() -> Self {
        Context {
            request: RequestState::new(),
            response: ResponseState::new(),
            state: HashMap::new(),
            redirect_policy: Arc::new(RedirectPolicy::default()),
        }
    }

    /// Installs the app-level redirect policy this context's requests should be
    /// evaluated against. Called by the kernel once per request, before dispatch.
    pub fn set_redirect_policy(&mut self, policy: Arc<RedirectPolicy>) {
        self.redirect_policy = policy;
    }

    /// Clears every field back to its empty state so this allocation is safe to hand
    /// to an unrelated subsequent request via [`pool::ContextPool`]. `redirect_policy`
    /// is deliberately left alone — it is reinstalled by the kernel per request
    /// regardless, and clearing it here would just mean falling back to the default
    /// policy if a test calls `reset` without going through the kernel.
    pub fn reset(&mut self) {
        self.request.reset();
        self.response.reset();
        self.state.clear();
    }

    // --- request-side convenience accessors -------------------------------------

    pub fn method(&self) -> &http::Method {
        &self.request.method
    }

    /// The path as seen by the currently-executing handler; reflects any mount
    /// prefixes already stripped by enclosing routers.
    pub fn path(&self) -> &str {
        &self.request.path
    }

    /// The path exactly as received, unaffected by router mounting.
    pub fn original_path(&self) -> &str {
        &self.request.original_path
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.request.param(name)
    }

    pub fn params(&self) -> &Params {
        &self.request.params
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.request.query_param(name)
    }

    pub fn query_map(&self) -> &request::Query {
        &self.request.query
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.header(name)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.request.cookie(name)
    }

    pub fn body(&self) -> Option<&Body> {
        self.request.body.as_ref()
    }

    pub fn is_secure(&self) -> bool {
        self.request.is_secure
    }

    pub fn xhr(&self) -> bool {
        self.request.xhr()
    }

    // --- typed scratch state ------------------------------------------------------

    /// Stores a value under `key` for downstream middleware/handlers to read back
    /// with [`Context::get_state`].
    pub fn set_state<T: Send + Sync + 'static>(&mut self, key: impl Into<String>, value: T) {
        self.state.insert(key.into(), Box::new(value));
    }

    pub fn get_state<T: 'static>(&self, key: &str) -> Option<&T> {
        self.state.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn remove_state(&mut self, key: &str) {
        self.state.remove(key);
    }

    // --- response-side builders ----------------------------------------------------

    pub fn status(&mut self, code: u16) -> Result<&mut Self, Error> {
        self.response.set_status(code)?;
        Ok(self)
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<&mut Self, Error> {
        self.response.set_header(name, value)?;
        Ok(self)
    }

    pub fn json(&mut self, value: &serde_json::Value) -> Result<(), Error> {
        self.response.set_json(value)
    }

    pub fn text(&mut self, body: impl Into<String>) -> Result<(), Error> {
        self.response.set_text(body)
    }

    pub fn html(&mut self, body: impl Into<String>) -> Result<(), Error> {
        self.response.set_html(body)
    }

    pub fn send(&mut self, content_type: &str, bytes: Bytes) -> Result<(), Error> {
        self.response.set_bytes(content_type, bytes)
    }

    pub fn send_stream(
        &mut self,
        content_type: &str,
        stream: BoxStream<'static, Result<Bytes, Error>>,
    ) -> Result<(), Error> {
        self.response.set_stream(content_type, stream)
    }

    pub fn end(&mut self) {
        self.response.end();
    }

    pub fn redirect(&mut self, location: &str) -> Result<(), Error> {
        self.redirect_with_status(location, 302)
    }

    /// Validates `location` against the installed [`RedirectPolicy`] before handing
    /// off to [`response::ResponseState::redirect`] for the actual header write.
    pub fn redirect_with_status(&mut self, location: &str, status: u16) -> Result<(), Error> {
        let current_host = self.request.header("host");
        self.redirect_policy
            .check(location, current_host)
            .map_err(|rejection| Error::bad_request(rejection.to_string()))?;
        self.response.redirect(location, status)
    }

    /// Queues a `Set-Cookie` with the framework's secure-by-default attributes
    /// (`HttpOnly`, `SameSite=Lax`, no `Secure` unless the connection is itself
    /// secure). Callers needing different attributes build an [`OutgoingCookie`]
    /// directly and pass it to [`Context::set_cookie`].
    pub fn cookie(&mut self, name: &str, value: &str) {
        let mut cookie = OutgoingCookie::new(name, value);
        cookie.secure = self.request.is_secure;
        self.response.add_cookie(cookie);
    }

    pub fn set_cookie(&mut self, cookie: OutgoingCookie) {
        self.response.add_cookie(cookie);
    }

    pub fn clear_cookie(&mut self, name: &str) {
        self.response.clear_cookie(name);
    }

    pub fn has_responded(&self) -> bool {
        self.response.sent
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("method", &self.request.method)
            .field("path", &self.request.path)
            .field("status", &self.response.status_code)
            .field("sent", &self.response.sent)
            .finish()
    }
}

pub use redirect::RedirectPolicy;
pub use response::OutgoingCookie as ResponseCookie;
pub use response::SameSite as CookieSameSite;

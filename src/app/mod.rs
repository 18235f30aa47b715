//! The application kernel: owns the top-level [`Router`], binds a listener, serves
//! connections, and coordinates graceful shutdown.

pub mod handler;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use http::Method;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::context::pool::ContextPool;
use crate::context::{Context, RedirectPolicy};
use crate::error::Error;
use crate::middleware::{Handler, SharedMiddleware};
use crate::primitives::regex_cache::RegexCache;
use crate::router::{Next, Router};

/// Governs how a 5xx [`Error`] is rendered to the client: development mode includes
/// `message` and `is_programming_error` in the JSON body, production mode always
/// sends a bare, fixed message regardless of what the error actually said.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMode {
    Development,
    Production,
}

/// Lifecycle state of an [`App`], observable for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Constructed,
    Listening,
    Draining,
    Closed,
}

/// Environment-driven configuration gathered before an [`App`] is built, mirroring
/// the environment-variable surface `spec.md` §6 lists: which [`ErrorMode`] to run
/// in, whether to expose error detail to clients even in production, and the
/// [`RedirectPolicy`] to install on every pooled [`Context`].
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub error_mode: ErrorMode,
    /// When true, a 5xx [`Error`]'s message is sent to the client even under
    /// [`ErrorMode::Production`]. Internal errors flagged via
    /// [`Error::is_programming_error`] are never exposed, whatever this is set to.
    pub expose_stack_traces: bool,
    pub redirect_policy: Arc<RedirectPolicy>,
}

impl AppConfig {
    /// Reads `EXPRESSO_ENV` (falling back to `NODE_ENV`, for operators migrating an
    /// existing deployment's environment) for the [`ErrorMode`], and
    /// `EXPRESSO_EXPOSE_STACK_TRACES` for whether to expose error detail in
    /// production. Unset or unrecognized values fall back to the safe default:
    /// development mode, stack traces hidden.
    pub fn from_env() -> Self {
        let error_mode = match std::env::var("EXPRESSO_ENV")
            .or_else(|_| std::env::var("NODE_ENV"))
            .as_deref()
        {
            Ok("production") => ErrorMode::Production,
            _ => ErrorMode::Development,
        };
        let expose_stack_traces = std::env::var("EXPRESSO_EXPOSE_STACK_TRACES")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
            .unwrap_or(false);
        AppConfig {
            error_mode,
            expose_stack_traces,
            redirect_policy: Arc::new(RedirectPolicy::default()),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            error_mode: ErrorMode::Development,
            expose_stack_traces: false,
            redirect_policy: Arc::new(RedirectPolicy::default()),
        }
    }
}

struct Http2Config {
    max_concurrent_streams: Option<u32>,
    initial_stream_window_size: Option<u32>,
    initial_connection_window_size: Option<u32>,
}

/// The HTTP application: a router plus the serving configuration (TLS is out of
/// scope; see `SPEC_FULL.md`) needed to turn it into a listening server.
pub struct App {
    router: Router,
    regex_cache: Arc<RegexCache>,
    context_pool: Arc<ContextPool>,
    error_mode: ErrorMode,
    expose_stack_traces: bool,
    redirect_policy: Arc<RedirectPolicy>,
    enable_http2: bool,
    http2_config: Option<Http2Config>,
    state: Arc<Mutex<AppState>>,
    shutdown_hooks: Vec<SharedMiddleware>,
}

impl App {
    pub fn new() -> Self {
        App {
            router: Router::new(),
            regex_cache: Arc::new(RegexCache::default()),
            context_pool: Arc::new(ContextPool::default()),
            error_mode: ErrorMode::Development,
            expose_stack_traces: false,
            redirect_policy: Arc::new(RedirectPolicy::default()),
            enable_http2: false,
            http2_config: None,
            state: Arc::new(Mutex::new(AppState::Constructed)),
            shutdown_hooks: Vec::new(),
        }
    }

    pub fn error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = mode;
        self
    }

    /// Applies an [`AppConfig`] gathered from the environment (or built by hand),
    /// overriding [`ErrorMode`], stack-trace exposure, and the redirect policy in one
    /// call.
    pub fn configure(mut self, config: AppConfig) -> Self {
        self.error_mode = config.error_mode;
        self.expose_stack_traces = config.expose_stack_traces;
        self.redirect_policy = config.redirect_policy;
        self
    }

    /// Turns on HTTP/2 (h2c, i.e. prior-knowledge cleartext) alongside HTTP/1.1 on
    /// the same listener.
    pub fn enable_http2(mut self, enabled: bool) -> Self {
        self.enable_http2 = enabled;
        self
    }

    pub fn http2_config(
        mut self,
        max_concurrent_streams: Option<u32>,
        initial_stream_window_size: Option<u32>,
        initial_connection_window_size: Option<u32>,
    ) -> Self {
        self.http2_config = Some(Http2Config {
            max_concurrent_streams,
            initial_stream_window_size,
            initial_connection_window_size,
        });
        self
    }

    pub fn use_mw(&mut self, mw: SharedMiddleware) -> &mut Self {
        self.router.use_mw(mw);
        self
    }

    pub fn use_at(&mut self, prefix: &str, mw: SharedMiddleware) -> Result<&mut Self, Error> {
        self.router.use_at(&self.regex_cache, prefix, mw)?;
        Ok(self)
    }

    /// Mounts a sub-[`Router`] under `prefix` (`app.mount("/v1", api_router)`), the
    /// building block both nested routers and API versioning are expressed with.
    pub fn mount(&mut self, prefix: &str, sub: Router) -> Result<&mut Self, Error> {
        self.router.mount(&self.regex_cache, prefix, sub)?;
        Ok(self)
    }

    /// Mounts `sub` under `/v{version}` (`app.version(1, api_router)` -> `/v1`).
    pub fn version(&mut self, version: u32, sub: Router) -> Result<&mut Self, Error> {
        self.mount(&format!("/v{version}"), sub)
    }

    pub fn get(&mut self, pattern: &str, handler: impl Handler) -> Result<&mut Self, Error> {
        self.router.get(&self.regex_cache, pattern, vec![adapt(handler)])?;
        Ok(self)
    }

    pub fn post(&mut self, pattern: &str, handler: impl Handler) -> Result<&mut Self, Error> {
        self.router.post(&self.regex_cache, pattern, vec![adapt(handler)])?;
        Ok(self)
    }

    pub fn put(&mut self, pattern: &str, handler: impl Handler) -> Result<&mut Self, Error> {
        self.router.put(&self.regex_cache, pattern, vec![adapt(handler)])?;
        Ok(self)
    }

    pub fn patch(&mut self, pattern: &str, handler: impl Handler) -> Result<&mut Self, Error> {
        self.router.patch(&self.regex_cache, pattern, vec![adapt(handler)])?;
        Ok(self)
    }

    pub fn delete(&mut self, pattern: &str, handler: impl Handler) -> Result<&mut Self, Error> {
        self.router.delete(&self.regex_cache, pattern, vec![adapt(handler)])?;
        Ok(self)
    }

    pub fn options(&mut self, pattern: &str, handler: impl Handler) -> Result<&mut Self, Error> {
        self.router.options(&self.regex_cache, pattern, vec![adapt(handler)])?;
        Ok(self)
    }

    /// Registers a handler under `method` directly, the building block `get`/`post`/
    /// etc. are defined in terms of, also used when a route needs more than one
    /// handler chained (`app.route(Method::GET, "/x", vec![auth, load, render])`).
    pub fn route(
        &mut self,
        method: Method,
        pattern: &str,
        handlers: Vec<SharedMiddleware>,
    ) -> Result<&mut Self, Error> {
        self.router.route(&self.regex_cache, method, pattern, handlers)?;
        Ok(self)
    }

    pub fn param(&mut self, name: &str, handler: SharedMiddleware) -> &mut Self {
        self.router.param(name, handler);
        self
    }

    /// Registers a hook run during graceful shutdown, after the listener stops
    /// accepting new connections but before in-flight requests are given up on.
    pub fn on_shutdown(&mut self, hook: SharedMiddleware) -> &mut Self {
        self.shutdown_hooks.push(hook);
        self
    }

    pub fn state(&self) -> AppState {
        *self.state.lock().unwrap()
    }

    /// Binds `addr` and serves forever (or until `shutdown` resolves), running
    /// every accepted connection through [`handler::serve_connection`].
    pub async fn listen(self, addr: SocketAddr, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        let listener = TcpListener::bind(addr).await?;
        *self.state.lock().unwrap() = AppState::Listening;
        tracing::info!(%addr, "listening");

        let router = Arc::new(self.router);
        let pool = self.context_pool.clone();
        let error_mode = self.error_mode;
        let expose_stack_traces = self.expose_stack_traces;
        let redirect_policy = self.redirect_policy.clone();
        let enable_http2 = self.enable_http2;
        let state = self.state.clone();
        let connections_closed = Arc::new(AtomicBool::new(false));

        let mut shutdown_rx = shutdown;
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to accept connection");
                            continue;
                        }
                    };
                    let router = router.clone();
                    let pool = pool.clone();
                    let redirect_policy = redirect_policy.clone();
                    let shutdown_rx = shutdown_rx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handler::serve_connection(
                            stream,
                            peer_addr,
                            router,
                            pool,
                            redirect_policy,
                            error_mode,
                            expose_stack_traces,
                            enable_http2,
                            shutdown_rx,
                        )
                        .await
                        {
                            tracing::warn!(error = %err, "connection ended with an error");
                        }
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        *state.lock().unwrap() = AppState::Draining;
        // Run hooks in reverse registration order, the way a stack of `defer`/`atexit`
        // handlers unwinds: the last hook registered is typically the one that
        // depends on resources the earlier hooks set up, so it must run first.
        for hook in self.shutdown_hooks.iter().rev() {
            let mut ctx = Context::new();
            let _ = hook.call(&mut ctx, Next::terminal()).await;
        }
        connections_closed.store(true, Ordering::SeqCst);
        *state.lock().unwrap() = AppState::Closed;
        Ok(())
    }
}

impl Default for App {
    fn default() -> Self {
        App::new()
    }
}

fn adapt(h: impl Handler) -> SharedMiddleware {
    let h = Arc::new(h);
    Arc::new(crate::middleware::mw(move |ctx: &mut Context, _next: Next| {
        let h = h.clone();
        async move { h.call(ctx).await }
    }))
}

//! The router: an ordered stack of layers (plain middleware, terminal route
//! handlers, and mounted sub-routers), matched against the incoming method and path
//! in registration order, first match wins.
//!
//! Dispatch is continuation-passing: each layer receives a [`Next`] representing
//! "everything that would run if I don't short-circuit", built fresh for every
//! match. Because `Next::run` consumes `self`, a middleware simply cannot call it
//! twice — the "called `next()` more than once" failure mode of the callback-based
//! original has no runtime representation here; it is a compile error instead.

pub mod pattern;

use std::sync::Arc;

use http::Method;

use crate::context::Context;
use crate::error::Error;
use crate::middleware::{BoxFuture, SharedMiddleware};
use pattern::CompiledPattern;

pub use crate::context::request::Params;
use crate::primitives::regex_cache::RegexCache;

enum LayerKind {
    Middleware(SharedMiddleware),
    Mount(Arc<Router>),
}

struct Layer {
    /// `None` matches any method (plain `use` middleware or a mount).
    method: Option<Method>,
    /// `None` matches every path (a global `use(mw)` with no path prefix).
    pattern: Option<CompiledPattern>,
    kind: LayerKind,
}

/// An ordered stack of [`Layer`]s. An [`crate::app::App`] holds one top-level
/// `Router`; `router.use_router(prefix, sub)` nests another underneath it.
pub struct Router {
    layers: Vec<Layer>,
    param_handlers: std::collections::HashMap<String, SharedMiddleware>,
    case_sensitive: bool,
}

impl Router {
    pub fn new() -> Self {
        Router {
            layers: Vec::new(),
            param_handlers: std::collections::HashMap::new(),
            case_sensitive: false,
        }
    }

    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    /// Registers plain middleware with no method or path restriction (`app.use(mw)`).
    pub fn use_mw(&mut self, mw: SharedMiddleware) {
        self.layers.push(Layer {
            method: None,
            pattern: None,
            kind: LayerKind::Middleware(mw),
        });
    }

    /// Registers middleware scoped to a path prefix (`app.use("/api", mw)`), run for
    /// any method whose path starts with `prefix`.
    pub fn use_at(&mut self, cache: &RegexCache, prefix: &str, mw: SharedMiddleware) -> Result<(), Error> {
        let pattern = CompiledPattern::compile_prefix(cache, prefix, self.case_sensitive)?;
        self.layers.push(Layer {
            method: None,
            pattern: Some(pattern),
            kind: LayerKind::Middleware(mw),
        });
        Ok(())
    }

    /// Mounts `sub` under `prefix`. Every layer in `sub` is tried, in order, against
    /// the path with `prefix` stripped; if none of them respond, dispatch falls
    /// through to whatever comes after this mount in the parent router.
    pub fn mount(&mut self, cache: &RegexCache, prefix: &str, sub: Router) -> Result<(), Error> {
        let pattern = CompiledPattern::compile_prefix(cache, prefix, self.case_sensitive)?;
        self.layers.push(Layer {
            method: None,
            pattern: Some(pattern),
            kind: LayerKind::Mount(Arc::new(sub)),
        });
        Ok(())
    }

    /// Registers one or more handlers for `method` at the exact path `pattern`. Each
    /// handler is appended as its own layer sharing the same method and pattern, so
    /// one handler's `next()` call proceeds straight to the next handler in the
    /// list without falling through to unrelated routes first.
    pub fn route(
        &mut self,
        cache: &RegexCache,
        method: Method,
        pattern: &str,
        handlers: Vec<SharedMiddleware>,
    ) -> Result<(), Error> {
        let compiled = CompiledPattern::compile_exact(cache, pattern, self.case_sensitive)?;
        for handler in handlers {
            self.layers.push(Layer {
                method: Some(method.clone()),
                pattern: Some(compiled.clone()),
                kind: LayerKind::Middleware(handler),
            });
        }
        Ok(())
    }

    pub fn get(&mut self, cache: &RegexCache, pattern: &str, handlers: Vec<SharedMiddleware>) -> Result<(), Error> {
        self.route(cache, Method::GET, pattern, handlers)
    }

    pub fn post(&mut self, cache: &RegexCache, pattern: &str, handlers: Vec<SharedMiddleware>) -> Result<(), Error> {
        self.route(cache, Method::POST, pattern, handlers)
    }

    pub fn put(&mut self, cache: &RegexCache, pattern: &str, handlers: Vec<SharedMiddleware>) -> Result<(), Error> {
        self.route(cache, Method::PUT, pattern, handlers)
    }

    pub fn patch(&mut self, cache: &RegexCache, pattern: &str, handlers: Vec<SharedMiddleware>) -> Result<(), Error> {
        self.route(cache, Method::PATCH, pattern, handlers)
    }

    pub fn delete(&mut self, cache: &RegexCache, pattern: &str, handlers: Vec<SharedMiddleware>) -> Result<(), Error> {
        self.route(cache, Method::DELETE, pattern, handlers)
    }

    pub fn options(&mut self, cache: &RegexCache, pattern: &str, handlers: Vec<SharedMiddleware>) -> Result<(), Error> {
        self.route(cache, Method::OPTIONS, pattern, handlers)
    }

    pub fn head(&mut self, cache: &RegexCache, pattern: &str, handlers: Vec<SharedMiddleware>) -> Result<(), Error> {
        self.route(cache, Method::HEAD, pattern, handlers)
    }

    /// Registers a param middleware: whenever a matched route captured `name`, this
    /// handler runs once, immediately before that route's own handlers.
    pub fn param(&mut self, name: impl Into<String>, handler: SharedMiddleware) {
        self.param_handlers.insert(name.into(), handler);
    }

    /// Builds a fresh `Router`, passes it to `build` to register routes on, then
    /// mounts the result under `prefix` — a convenience over constructing and
    /// mounting a sub-router by hand, for grouping a set of related routes behind one
    /// path prefix (`router.group(cache, "/users", |r| { r.get(...)?; r.post(...) })`).
    pub fn group<F>(&mut self, cache: &RegexCache, prefix: &str, build: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Router) -> Result<(), Error>,
    {
        let mut sub = Router::new().case_sensitive(self.case_sensitive);
        build(&mut sub)?;
        self.mount(cache, prefix, sub)
    }

    /// Lists every concrete `(method, pattern)` pair this router would match at its
    /// own level, in registration order. Used for introspection (printing a route
    /// table at startup, generating an `OPTIONS` response) rather than dispatch;
    /// layers with no method (plain `use` middleware) and mounted sub-routers are
    /// omitted since they have no single pattern of their own to report.
    pub fn routes(&self) -> Vec<(Method, String)> {
        self.layers
            .iter()
            .filter_map(|layer| {
                let method = layer.method.clone()?;
                if !matches!(layer.kind, LayerKind::Middleware(_)) {
                    return None;
                }
                let pattern = layer.pattern.as_ref()?;
                Some((method, pattern.source().to_string()))
            })
            .collect()
    }

    fn layer_matches(&self, layer: &Layer, method: &Method, path: &str) -> Option<pattern::PatternMatch> {
        let method_ok = match &layer.method {
            None => true,
            Some(m) if m == method => true,
            // HEAD requests fall back to a route's GET handlers when no HEAD
            // handler was registered explicitly.
            Some(m) if *m == Method::GET && *method == Method::HEAD => true,
            _ => false,
        };
        if !method_ok {
            return None;
        }
        match &layer.pattern {
            None => Some(pattern::PatternMatch { params: Vec::new(), consumed: 0 }),
            Some(p) => p.match_path(path),
        }
    }

    /// Runs param middlewares registered for any name in `matched`, in declaration
    /// order found in `matched`. Returns `true` if one of them already produced a
    /// response (the caller should not continue to the route handler in that case).
    async fn run_param_handlers(
        &self,
        matched: &[(String, String)],
        ctx: &mut Context,
    ) -> Result<bool, Error> {
        for (name, _value) in matched {
            if let Some(handler) = self.param_handlers.get(name) {
                handler.call(ctx, Next::terminal()).await?;
                if ctx.has_responded() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Finds the first layer at or after `index` matching `method`/the current
    /// `ctx.path`, runs it, and falls through to `tail` if nothing in this router
    /// matches. Mount boundaries temporarily rewrite `ctx.request.path`, always
    /// restoring it before returning, on both the `Ok` and `Err` path.
    pub fn dispatch_from<'a>(
        self_arc: &'a Arc<Router>,
        index: usize,
        method: Method,
        ctx: &'a mut Context,
        tail: Next,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let path_snapshot = ctx.request.path.clone();
            for i in index..self_arc.layers.len() {
                let layer = &self_arc.layers[i];
                let Some(matched) = self_arc.layer_matches(layer, &method, &path_snapshot) else {
                    continue;
                };

                match &layer.kind {
                    LayerKind::Middleware(mw) => {
                        if layer.pattern.is_some() && !matched.params.is_empty() {
                            let short_circuited = self_arc.run_param_handlers(&matched.params, ctx).await?;
                            if short_circuited {
                                return Ok(());
                            }
                        }
                        if !matched.params.is_empty() {
                            for (name, value) in &matched.params {
                                ctx.request.params.insert(name.clone(), value.clone());
                            }
                        }
                        let next = Next::continuing(self_arc.clone(), i + 1, method.clone(), tail);
                        return mw.call(ctx, next).await;
                    }
                    LayerKind::Mount(sub) => {
                        let remainder = matched.remainder(&path_snapshot).to_string();
                        let rest_of_self = Next::continuing(self_arc.clone(), i + 1, method.clone(), tail);
                        ctx.request.path = remainder;
                        let result = Router::dispatch_from(sub, 0, method.clone(), ctx, rest_of_self).await;
                        ctx.request.path = path_snapshot;
                        return result;
                    }
                }
            }
            tail.run(ctx).await
        })
    }
}

impl Default for Router {
    fn default() -> Self {
        Router::new()
    }
}

/// The continuation handed to a middleware, representing the rest of the chain.
/// Consuming `self` via [`Next::run`] is the only way to invoke it, which is what
/// makes a second `next()` call from the same middleware invocation a compile error
/// rather than a runtime one.
pub struct Next {
    step: NextStep,
}

pub(crate) enum NextStep {
    Continue {
        router: Arc<Router>,
        index: usize,
        method: Method,
        tail: Box<Next>,
    },
    Terminal,
}

impl Next {
    /// A `Next` whose continuation is empty: calling `run` resolves immediately
    /// with `Ok(())` and does nothing further. Used for a router's outermost
    /// dispatch and for single-shot calls like param handlers.
    pub fn terminal() -> Self {
        Next { step: NextStep::Terminal }
    }

    pub(crate) fn continuing(router: Arc<Router>, index: usize, method: Method, tail: Next) -> Self {
        Next {
            step: NextStep::Continue {
                router,
                index,
                method,
                tail: Box::new(tail),
            },
        }
    }

    /// Runs the rest of the chain this `Next` represents.
    pub fn run<'a>(self, ctx: &'a mut Context) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            match self.step {
                NextStep::Terminal => Ok(()),
                NextStep::Continue { router, index, method, tail } => {
                    Router::dispatch_from(&router, index, method, ctx, *tail).await
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::mw;
    use std::sync::Arc as StdArc;

    fn noop_handler(text: &'static str) -> SharedMiddleware {
        StdArc::new(mw(move |ctx: &mut Context, _next: Next| {
            let text = text;
            async move {
                ctx.text(text)?;
                Ok(())
            }
        }))
    }

    #[tokio::test]
    async fn matches_route_by_method_and_path() {
        let cache = RegexCache::new(16);
        let mut router = Router::new();
        router.get(&cache, "/users/:id", vec![noop_handler("got user")]).unwrap();
        let router = Arc::new(router);

        let mut ctx = Context::new();
        ctx.request.method = Method::GET;
        ctx.request.path = "/users/42".to_string();
        Router::dispatch_from(&router, 0, Method::GET, &mut ctx, Next::terminal())
            .await
            .unwrap();

        assert_eq!(ctx.request.param("id"), Some("42"));
        assert_eq!(ctx.response.body_debug(), "got user");
    }

    #[tokio::test]
    async fn head_falls_back_to_get_handler() {
        let cache = RegexCache::new(16);
        let mut router = Router::new();
        router.get(&cache, "/ping", vec![noop_handler("pong")]).unwrap();
        let router = Arc::new(router);

        let mut ctx = Context::new();
        ctx.request.path = "/ping".to_string();
        Router::dispatch_from(&router, 0, Method::HEAD, &mut ctx, Next::terminal())
            .await
            .unwrap();
        assert!(ctx.has_responded());
    }

    #[tokio::test]
    async fn unmatched_path_falls_through_to_tail() {
        let cache = RegexCache::new(16);
        let mut router = Router::new();
        router.get(&cache, "/known", vec![noop_handler("hit")]).unwrap();
        let router = Arc::new(router);

        let mut ctx = Context::new();
        ctx.request.path = "/missing".to_string();
        Router::dispatch_from(&router, 0, Method::GET, &mut ctx, Next::terminal())
            .await
            .unwrap();
        assert!(!ctx.has_responded());
    }

    #[tokio::test]
    async fn mounted_router_strips_and_restores_prefix() {
        let cache = RegexCache::new(16);
        let mut sub = Router::new();
        sub.get(&cache, "/hello", vec![StdArc::new(mw(|ctx: &mut Context, _next: Next| async move {
            assert_eq!(ctx.request.path, "/hello");
            ctx.text("sub")?;
            Ok(())
        }))]).unwrap();

        let mut parent = Router::new();
        parent.mount(&cache, "/api", sub).unwrap();
        let parent = Arc::new(parent);

        let mut ctx = Context::new();
        ctx.request.path = "/api/hello".to_string();
        Router::dispatch_from(&parent, 0, Method::GET, &mut ctx, Next::terminal())
            .await
            .unwrap();

        assert!(ctx.has_responded());
        assert_eq!(ctx.request.path, "/api/hello");
    }

    #[tokio::test]
    async fn param_handler_runs_before_route_handler() {
        let cache = RegexCache::new(16);
        let mut router = Router::new();
        router.param(
            "id",
            StdArc::new(mw(|ctx: &mut Context, _next: Next| async move {
                ctx.set_state("param_id_seen", true);
                Ok(())
            })) as SharedMiddleware,
        );
        router
            .get(&cache, "/items/:id", vec![noop_handler("item")])
            .unwrap();
        let router = Arc::new(router);

        let mut ctx = Context::new();
        ctx.request.path = "/items/7".to_string();
        Router::dispatch_from(&router, 0, Method::GET, &mut ctx, Next::terminal())
            .await
            .unwrap();

        assert_eq!(ctx.get_state::<bool>("param_id_seen"), Some(&true));
        assert!(ctx.has_responded());
    }

    #[tokio::test]
    async fn multiple_handlers_chain_in_registration_order() {
        let cache = RegexCache::new(16);
        let mut router = Router::new();
        let first = StdArc::new(mw(|ctx: &mut Context, next: Next| async move {
            ctx.set_state("first_ran", true);
            next.run(ctx).await
        }));
        let second = noop_handler("second");
        router
            .get(&cache, "/chain", vec![first, second])
            .unwrap();
        let router = Arc::new(router);

        let mut ctx = Context::new();
        ctx.request.path = "/chain".to_string();
        Router::dispatch_from(&router, 0, Method::GET, &mut ctx, Next::terminal())
            .await
            .unwrap();

        assert_eq!(ctx.get_state::<bool>("first_ran"), Some(&true));
        assert_eq!(ctx.response.body_debug(), "second");
    }
}

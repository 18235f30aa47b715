//! The middleware contract: an async function of `(&mut Context, Next)` that may
//! inspect or mutate the context, optionally call `next.run(ctx)` to continue the
//! chain, and run more code after that call returns — the onion model that gives
//! middleware a "before" and "after" phase around the rest of the chain.
//!
//! [`router::Next`](crate::router::Next) is the actual continuation; this module
//! only defines the trait middleware implement and the handler shape a route's
//! terminal function uses (which never receives a `Next`, since there is nothing
//! after it to call).

pub mod body_parser;
pub mod cache;
#[cfg(feature = "compression")]
pub mod compression;
pub mod cors;
pub mod health;
#[cfg(feature = "logger")]
pub mod logger;
pub mod rate_limit;
pub mod security;
#[cfg(feature = "session")]
pub mod session;
pub mod static_files;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::error::Error;
use crate::router::Next;

/// A boxed, `Send` future, the common currency of this crate's async trait objects.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Middleware: given the shared context and a handle to the rest of the chain,
/// produces a future that resolves once this middleware (and everything it invoked
/// via `next`) has finished.
///
/// Implemented for any `Fn(&mut Context, Next) -> BoxFuture<Result<(), Error>>`
/// closure via the blanket impl below, so most middleware is written as a plain
/// `async fn` wrapped with [`mw`].
pub trait Middleware: Send + Sync + 'static {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a, Result<(), Error>>;
}

impl<F> Middleware for F
where
    F: for<'a> Fn(&'a mut Context, Next) -> BoxFuture<'a, Result<(), Error>> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a, Result<(), Error>> {
        (self)(ctx, next)
    }
}

/// A shared, type-erased middleware, the unit the router stores in a layer stack.
pub type SharedMiddleware = Arc<dyn Middleware>;

/// A terminal route handler: the function mounted at `app.get("/path", handler)`.
/// Unlike [`Middleware`] it receives no `Next`, since a route handler is always the
/// last link for its own registration (though other handlers may still be chained
/// after it when a route is given more than one handler).
pub trait Handler: Send + Sync + 'static {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<(), Error>>;
}

impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<(), Error>> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, Result<(), Error>> {
        (self)(ctx)
    }
}

pub type SharedHandler = Arc<dyn Handler>;

// `Fn(&mut Context, Next) -> Fut` can't be written directly as a bound on `mw`
// below: `Fut` would have to be the same concrete type for every lifetime the
// `&mut Context` borrow could take on, which is never true once the closure body
// is an `async move` block that captures `ctx`. Binding `Fut` inside a `for<'a>`
// clause via an associated type on a helper trait sidesteps that — each lifetime
// gets its own `Future` type, tied to it through the blanket impl below.
pub trait AsyncMiddlewareFn<'a>: Fn(&'a mut Context, Next) -> <Self as AsyncMiddlewareFn<'a>>::Future {
    type Future: Future<Output = Result<(), Error>> + Send + 'a;
}

impl<'a, F, Fut> AsyncMiddlewareFn<'a> for F
where
    F: Fn(&'a mut Context, Next) -> Fut,
    Fut: Future<Output = Result<(), Error>> + Send + 'a,
{
    type Future = Fut;
}

/// Wraps an `async fn(&mut Context, Next) -> Result<(), Error>`-shaped closure into
/// something implementing [`Middleware`]. Most middleware in this crate is written
/// as a plain async closure passed through this helper rather than a hand-written
/// `impl Middleware`.
pub fn mw<F>(f: F) -> impl Middleware
where
    F: for<'a> AsyncMiddlewareFn<'a> + Send + Sync + 'static,
{
    move |ctx: &mut Context, next: Next| -> BoxFuture<'_, Result<(), Error>> { Box::pin(f(ctx, next)) }
}

pub trait AsyncHandlerFn<'a>: Fn(&'a mut Context) -> <Self as AsyncHandlerFn<'a>>::Future {
    type Future: Future<Output = Result<(), Error>> + Send + 'a;
}

impl<'a, F, Fut> AsyncHandlerFn<'a> for F
where
    F: Fn(&'a mut Context) -> Fut,
    Fut: Future<Output = Result<(), Error>> + Send + 'a,
{
    type Future = Fut;
}

/// Wraps an `async fn(&mut Context) -> Result<(), Error>`-shaped closure into
/// something implementing [`Handler`].
pub fn handler<F>(f: F) -> impl Handler
where
    F: for<'a> AsyncHandlerFn<'a> + Send + Sync + 'static,
{
    move |ctx: &mut Context| -> BoxFuture<'_, Result<(), Error>> { Box::pin(f(ctx)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{Next, NextStep};

    #[tokio::test]
    async fn handler_wrapper_runs_closure() {
        let h = handler(|ctx: &mut Context| async move {
            ctx.text("hi").unwrap();
            Ok(())
        });
        let mut ctx = Context::new();
        h.call(&mut ctx).await.unwrap();
        assert!(ctx.has_responded());
    }

    #[tokio::test]
    async fn middleware_wrapper_can_call_next() {
        let m = mw(|ctx: &mut Context, next: Next| async move {
            ctx.set_state("entered", true);
            next.run(ctx).await
        });
        let mut ctx = Context::new();
        let next = Next::terminal();
        m.call(&mut ctx, next).await.unwrap();
        assert_eq!(ctx.get_state::<bool>("entered"), Some(&true));
    }

    #[test]
    fn next_step_terminal_is_distinct_variant() {
        matches!(NextStep::Terminal, NextStep::Terminal);
    }
}

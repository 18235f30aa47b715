//! Cross-Origin Resource Sharing: answers preflight `OPTIONS` requests and adds the
//! `Access-Control-*` headers a browser checks before letting a cross-origin script
//! read a response.
//!
//! Grounded on the teacher's `ripress/src/middlewares/cors.rs`: the same reflective
//! (echo the request's `Origin`) vs. static (a fixed, configured origin) split, the
//! same early-return-on-preflight shape, generalized to a `Vec<String>` allow-list
//! instead of a single `&'static str` so a host can configure more than one allowed
//! origin.

use crate::context::Context;
use crate::error::Error;
use crate::middleware::{mw, Middleware};
use crate::router::Next;

/// Tuning knobs for the CORS middleware.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// `"*"` allows any origin (reflective mode is used instead of a literal `*`
    /// whenever `allow_credentials` is set, since the two are mutually exclusive per
    /// the Fetch spec). Otherwise, an explicit allow-list of origins.
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age: Option<u32>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        CorsConfig {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec![
                "GET".to_string(),
                "POST".to_string(),
                "PUT".to_string(),
                "PATCH".to_string(),
                "DELETE".to_string(),
                "OPTIONS".to_string(),
            ],
            allowed_headers: vec!["Content-Type".to_string(), "Authorization".to_string()],
            allow_credentials: false,
            max_age: Some(86400),
        }
    }
}

fn is_allowed(config: &CorsConfig, origin: &str) -> bool {
    config
        .allowed_origins
        .iter()
        .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin))
}

/// Builds the CORS middleware. A request carrying `Origin` gets
/// `Access-Control-Allow-Origin` (reflected verbatim when the origin is allowed and
/// credentials are enabled, since `*` cannot be combined with credentials); an
/// `OPTIONS` preflight (`Origin` plus `Access-Control-Request-Method`) is answered
/// directly with `204` and the chain is never called.
pub fn cors(config: CorsConfig) -> impl Middleware {
    mw(move |ctx: &mut Context, next: Next| {
        let config = config.clone();
        async move {
            let origin = ctx.header("origin").map(str::to_string);
            let Some(origin) = origin else {
                return next.run(ctx).await;
            };

            if !is_allowed(&config, &origin) {
                return next.run(ctx).await;
            }

            let allow_origin_value = if config.allow_credentials || !config.allowed_origins.contains(&"*".to_string())
            {
                origin.clone()
            } else {
                "*".to_string()
            };
            ctx.set_header("access-control-allow-origin", &allow_origin_value)?;
            if config.allow_credentials {
                ctx.set_header("access-control-allow-credentials", "true")?;
            }
            ctx.set_header("vary", "Origin")?;

            let is_preflight =
                *ctx.method() == http::Method::OPTIONS && ctx.header("access-control-request-method").is_some();

            if is_preflight {
                ctx.set_header("access-control-allow-methods", &config.allowed_methods.join(", "))?;
                ctx.set_header("access-control-allow-headers", &config.allowed_headers.join(", "))?;
                if let Some(max_age) = config.max_age {
                    ctx.set_header("access-control-max-age", &max_age.to_string())?;
                }
                ctx.status(204)?;
                ctx.end();
                return Ok(());
            }

            next.run(ctx).await
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::handler;
    use crate::router::Router;
    use std::sync::Arc as StdArc;

    fn build_router(config: CorsConfig) -> StdArc<Router> {
        let cache = crate::primitives::regex_cache::RegexCache::new(4);
        let mut router = Router::new();
        router.use_mw(StdArc::new(cors(config)));
        router
            .get(
                &cache,
                "/data",
                vec![StdArc::new(handler(|ctx: &mut Context| async move {
                    ctx.text("ok")?;
                    Ok(())
                })) as _],
            )
            .unwrap();
        StdArc::new(router)
    }

    #[tokio::test]
    async fn reflects_wildcard_origin_by_default() {
        let router = build_router(CorsConfig::default());
        let mut ctx = Context::new();
        ctx.request.path = "/data".to_string();
        ctx.request.headers.set("origin", "https://example.com").unwrap();
        Router::dispatch_from(&router, 0, http::Method::GET, &mut ctx, Next::terminal())
            .await
            .unwrap();
        assert_eq!(ctx.response.headers.get("access-control-allow-origin"), Some("*"));
    }

    #[tokio::test]
    async fn preflight_short_circuits_with_204() {
        let router = build_router(CorsConfig::default());
        let mut ctx = Context::new();
        ctx.request.path = "/data".to_string();
        ctx.request.headers.set("origin", "https://example.com").unwrap();
        ctx.request
            .headers
            .set("access-control-request-method", "POST")
            .unwrap();
        Router::dispatch_from(&router, 0, http::Method::OPTIONS, &mut ctx, Next::terminal())
            .await
            .unwrap();
        assert_eq!(ctx.response.status_code, 204);
        assert!(ctx.response.headers.contains("access-control-allow-methods"));
    }

    #[tokio::test]
    async fn disallowed_origin_gets_no_cors_headers() {
        let router = build_router(CorsConfig {
            allowed_origins: vec!["https://trusted.example".to_string()],
            ..Default::default()
        });
        let mut ctx = Context::new();
        ctx.request.path = "/data".to_string();
        ctx.request.headers.set("origin", "https://evil.example").unwrap();
        Router::dispatch_from(&router, 0, http::Method::GET, &mut ctx, Next::terminal())
            .await
            .unwrap();
        assert!(!ctx.response.headers.contains("access-control-allow-origin"));
    }
}

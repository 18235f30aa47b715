//! Response caching: stores a successful `GET`/`HEAD` response body and a filtered
//! set of headers keyed by the request path and query string, and serves later
//! requests for the same key straight out of the cache without running the rest of
//! the chain.
//!
//! Not grounded on any single teacher file (the teacher repo has no response cache);
//! built from this crate's own [`crate::primitives::regex_cache::RegexCache`] as a
//! model for "LRU-bounded, `Mutex`-guarded cache of derived data" and
//! [`crate::context::headers::Headers::retain_allowed`] for which headers are safe to
//! replay from a cached entry.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;

use crate::context::headers::Headers;
use crate::context::response::ResponseBodyKind;
use crate::context::Context;
use crate::error::Error;
use crate::middleware::{mw, Middleware};
use crate::router::Next;

/// Headers replayed from a cached entry. Anything else the original response set
/// (session cookies, rate-limit counters) is specific to the request that produced
/// it and must not leak into a later, unrelated client's response.
const CACHEABLE_RESPONSE_HEADERS: &[&str] = &[
    "content-type",
    "content-encoding",
    "content-language",
    "vary",
    "etag",
    "last-modified",
];

#[derive(Clone)]
struct CacheEntry {
    status: u16,
    headers: Headers,
    body: Bytes,
    stored_at: Instant,
}

/// Tuning knobs for the response cache.
#[derive(Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub capacity: usize,
    /// Derives the cache key from a request; defaults to `original_path` + `?` +
    /// `query_string`. Override to vary the key on something else, e.g. an
    /// `Accept-Language` header or an authenticated user id.
    pub key_fn: Option<Arc<dyn Fn(&Context) -> String + Send + Sync>>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl: Duration::from_secs(60),
            capacity: 1000,
            key_fn: None,
        }
    }
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .field("key_fn", &self.key_fn.is_some())
            .finish()
    }
}

fn default_key(ctx: &Context) -> String {
    if ctx.request.query_string.is_empty() {
        ctx.original_path().to_string()
    } else {
        format!("{}?{}", ctx.original_path(), ctx.request.query_string)
    }
}

/// Builds the response-cache middleware. A `GET`/`HEAD` request whose key is already
/// cached and not yet expired is answered directly, with an `X-Cache: HIT` header and
/// no further middleware invoked. Anything else runs the chain and, if it ends in a
/// `2xx` with a buffered (non-streamed) body, stores the result for next time.
pub fn cache(config: CacheConfig) -> impl Middleware {
    let capacity = NonZeroUsize::new(config.capacity.max(1)).unwrap();
    let store: Arc<Mutex<LruCache<String, CacheEntry>>> = Arc::new(Mutex::new(LruCache::new(capacity)));

    mw(move |ctx: &mut Context, next: Next| {
        let config = config.clone();
        let store = store.clone();
        async move {
            let cacheable_method =
                matches!(*ctx.method(), http::Method::GET | http::Method::HEAD);
            if !cacheable_method {
                return next.run(ctx).await;
            }

            let key = match &config.key_fn {
                Some(f) => f(ctx),
                None => default_key(ctx),
            };

            {
                let mut store = store.lock().unwrap();
                if let Some(entry) = store.get(&key) {
                    if entry.stored_at.elapsed() < config.ttl {
                        ctx.status(entry.status)?;
                        for (name, value) in entry.headers.iter() {
                            ctx.set_header(name, value)?;
                        }
                        ctx.set_header("x-cache", "HIT")?;
                        ctx.send(
                            entry.headers.get("content-type").unwrap_or("application/octet-stream"),
                            entry.body.clone(),
                        )?;
                        return Ok(());
                    }
                    store.pop(&key);
                }
            }

            next.run(ctx).await?;

            if !(200..300).contains(&ctx.response.status_code) {
                return Ok(());
            }
            let body = match &ctx.response.body {
                ResponseBodyKind::Bytes(bytes) => bytes.clone(),
                ResponseBodyKind::Empty | ResponseBodyKind::Stream(_) => return Ok(()),
            };

            let entry = CacheEntry {
                status: ctx.response.status_code,
                headers: ctx.response.headers.retain_allowed(CACHEABLE_RESPONSE_HEADERS),
                body,
                stored_at: Instant::now(),
            };
            store.lock().unwrap().put(key, entry);
            ctx.set_header("x-cache", "MISS")?;
            Ok(())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::handler;
    use crate::router::Router;
    use std::sync::Arc as StdArc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn second_request_to_same_key_is_served_from_cache() {
        let cache_mw = cache(CacheConfig::default());
        let hits = StdArc::new(AtomicUsize::new(0));
        let hits_for_handler = hits.clone();

        let compiled = crate::primitives::regex_cache::RegexCache::new(4);
        let mut router = Router::new();
        router.use_mw(StdArc::new(cache_mw));
        router
            .get(
                &compiled,
                "/data",
                vec![StdArc::new(handler(move |ctx: &mut Context| {
                    let hits = hits_for_handler.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        ctx.json(&serde_json::json!({"n": 1}))?;
                        Ok(())
                    }
                })) as _],
            )
            .unwrap();
        let router = StdArc::new(router);

        for _ in 0..2 {
            let mut ctx = Context::new();
            ctx.request.original_path = "/data".to_string();
            ctx.request.path = "/data".to_string();
            Router::dispatch_from(&router, 0, http::Method::GET, &mut ctx, Next::terminal())
                .await
                .unwrap();
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_get_requests_bypass_cache() {
        let cache_mw = cache(CacheConfig::default());
        let compiled = crate::primitives::regex_cache::RegexCache::new(4);
        let mut router = Router::new();
        router.use_mw(StdArc::new(cache_mw));
        router
            .post(
                &compiled,
                "/data",
                vec![StdArc::new(handler(|ctx: &mut Context| async move {
                    ctx.text("created")?;
                    Ok(())
                })) as _],
            )
            .unwrap();
        let router = StdArc::new(router);

        let mut ctx = Context::new();
        ctx.request.original_path = "/data".to_string();
        ctx.request.path = "/data".to_string();
        Router::dispatch_from(&router, 0, http::Method::POST, &mut ctx, Next::terminal())
            .await
            .unwrap();
        assert!(!ctx.response.headers.contains("x-cache"));
    }

    #[tokio::test]
    async fn cache_hit_replays_vary_and_content_language_headers() {
        // A response compressed by the compression middleware carries
        // `Vary: Accept-Encoding`; if a cached entry dropped that header, a client
        // that never sent `Accept-Encoding` could be served a cached body encoded
        // for a different client.
        let cache_mw = cache(CacheConfig::default());
        let compiled = crate::primitives::regex_cache::RegexCache::new(4);
        let mut router = Router::new();
        router.use_mw(StdArc::new(cache_mw));
        router
            .get(
                &compiled,
                "/data",
                vec![StdArc::new(handler(|ctx: &mut Context| async move {
                    ctx.set_header("vary", "Accept-Encoding")?;
                    ctx.set_header("content-language", "en")?;
                    ctx.json(&serde_json::json!({"n": 1}))?;
                    Ok(())
                })) as _],
            )
            .unwrap();
        let router = StdArc::new(router);

        for _ in 0..2 {
            let mut ctx = Context::new();
            ctx.request.original_path = "/data".to_string();
            ctx.request.path = "/data".to_string();
            Router::dispatch_from(&router, 0, http::Method::GET, &mut ctx, Next::terminal())
                .await
                .unwrap();
            if ctx.response.headers.get("x-cache") == Some("HIT") {
                assert_eq!(ctx.response.headers.get("vary"), Some("Accept-Encoding"));
                assert_eq!(ctx.response.headers.get("content-language"), Some("en"));
            }
        }
    }
}

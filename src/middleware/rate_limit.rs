//! Fixed-window rate limiting, keyed by client IP.
//!
//! Grounded on the teacher's `ripress/src/middlewares/rate_limiter.rs` (sliding/fixed
//! window bookkeeping, `X-Forwarded-For`-aware client IP extraction, the
//! `X-RateLimit-*`/`Retry-After` response headers). The teacher stores buckets in a
//! plain `HashMap` behind a spawned periodic-cleanup task; this version bounds memory
//! with an `lru::LruCache` instead, so an attacker rotating through many source IPs
//! can't grow the bucket table without limit between cleanups.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::context::Context;
use crate::error::Error;
use crate::middleware::{mw, Middleware};
use crate::router::Next;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_started: Instant,
    count: usize,
}

/// Tuning knobs for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub window: Duration,
    pub max_requests: usize,
    /// Trust `X-Forwarded-For`'s left-most entry as the client address instead of the
    /// socket peer address. Only safe behind a proxy that itself strips or overwrites
    /// an inbound `X-Forwarded-For` before forwarding.
    pub proxy: bool,
    /// Sent as the `message` field of the JSON body on a `429`.
    pub message: String,
    /// Maximum number of distinct client keys tracked at once.
    pub capacity: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig {
            window: Duration::from_secs(10),
            max_requests: 10,
            proxy: false,
            message: "Too many requests, please try again later.".to_string(),
            capacity: 10_000,
        }
    }
}

fn client_key(ctx: &Context, proxy: bool) -> String {
    if proxy {
        if let Some(forwarded) = ctx.header("x-forwarded-for") {
            if let Some(first) = forwarded.split(',').next() {
                let trimmed = first.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
    }
    ctx.request
        .remote_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Builds the rate limiter middleware. Short-circuits with `429` once a client key
/// exceeds `max_requests` inside the current window; otherwise calls `next` and
/// leaves informational `X-RateLimit-*` headers on the response.
pub fn rate_limiter(config: RateLimiterConfig) -> impl Middleware {
    let capacity = std::num::NonZeroUsize::new(config.capacity.max(1)).unwrap();
    let buckets: Arc<Mutex<LruCache<String, Bucket>>> = Arc::new(Mutex::new(LruCache::new(capacity)));

    mw(move |ctx: &mut Context, next: Next| {
        let config = config.clone();
        let buckets = buckets.clone();
        async move {
            let key = client_key(ctx, config.proxy);
            let now = Instant::now();

            let (count, remaining_window) = {
                let mut buckets = buckets.lock().unwrap();
                if buckets.get(&key).is_none() {
                    buckets.put(
                        key.clone(),
                        Bucket {
                            window_started: now,
                            count: 0,
                        },
                    );
                }
                let bucket = buckets.get_mut(&key).expect("just inserted");
                if now.duration_since(bucket.window_started) >= config.window {
                    bucket.window_started = now;
                    bucket.count = 0;
                }
                bucket.count += 1;
                let remaining = config
                    .window
                    .saturating_sub(now.duration_since(bucket.window_started));
                (bucket.count, remaining)
            };

            if count > config.max_requests {
                ctx.status(429)?;
                ctx.set_header("retry-after", &remaining_window.as_secs().to_string())?;
                ctx.set_header("x-ratelimit-limit", &config.max_requests.to_string())?;
                ctx.set_header("x-ratelimit-remaining", "0")?;
                ctx.json(&serde_json::json!({
                    "error": "Too Many Requests",
                    "message": config.message,
                }))?;
                return Ok(());
            }

            let remaining = config.max_requests.saturating_sub(count);
            ctx.set_header("x-ratelimit-limit", &config.max_requests.to_string())?;
            ctx.set_header("x-ratelimit-remaining", &remaining.to_string())?;

            next.run(ctx).await
        }
    })
}

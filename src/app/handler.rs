//! Turns one accepted TCP connection into a stream of request/response round trips:
//! decode a `hyper::Request` into a pooled [`Context`], run it through the
//! [`Router`], encode the [`ResponseState`] it produced back into a `hyper::Response`.
//!
//! Grounded on the teacher's own `app/handler.rs`: the same HTTP/1-vs-h2c builder
//! selection, just serving this crate's own [`Router`] dispatch instead of handing
//! the connection to `routerify_ng`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::app::ErrorMode;
use crate::context::pool::ContextPool;
use crate::context::response::ResponseBodyKind;
use crate::context::{Context, RedirectPolicy};
use crate::error::Error;
use crate::router::{Next, Router};

/// The unified body type every response path returns: a plain buffered body for
/// `Empty`/`Bytes` responses, a chunked `StreamBody` for `ResponseBodyKind::Stream`,
/// boxed so `dispatch`/`encode_response`/`error_response` can share one return type.
type ResponseBody = BoxBody<Bytes, Error>;

fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Serves one accepted connection until the client closes it, the protocol errors
/// out, or `shutdown_rx` fires (in which case the in-flight request, if any, is
/// allowed to finish before the connection closes).
pub(crate) async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    router: Arc<Router>,
    pool: Arc<ContextPool>,
    redirect_policy: Arc<RedirectPolicy>,
    error_mode: ErrorMode,
    expose_stack_traces: bool,
    enable_http2: bool,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Error> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let router = router.clone();
        let pool = pool.clone();
        let redirect_policy = redirect_policy.clone();
        async move {
            Ok::<_, Infallible>(
                dispatch(
                    req,
                    peer_addr,
                    router,
                    pool,
                    redirect_policy,
                    error_mode,
                    expose_stack_traces,
                )
                .await,
            )
        }
    });

    if enable_http2 {
        let conn = AutoBuilder::new(TokioExecutor::new()).serve_connection(io, service);
        tokio::pin!(conn);
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "h2c connection error");
                }
            }
            _ = shutdown_rx.changed() => {
                conn.as_mut().graceful_shutdown();
                if let Err(err) = conn.await {
                    tracing::warn!(error = %err, "h2c connection error during shutdown");
                }
            }
        }
    } else {
        let conn = hyper::server::conn::http1::Builder::new()
            .keep_alive(true)
            .serve_connection(io, service);
        tokio::pin!(conn);
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "http/1.1 connection error");
                }
            }
            _ = shutdown_rx.changed() => {
                conn.as_mut().graceful_shutdown();
                if let Err(err) = conn.await {
                    tracing::warn!(error = %err, "http/1.1 connection error during shutdown");
                }
            }
        }
    }
    Ok(())
}

async fn dispatch(
    req: Request<Incoming>,
    peer_addr: SocketAddr,
    router: Arc<Router>,
    pool: Arc<ContextPool>,
    redirect_policy: Arc<RedirectPolicy>,
    error_mode: ErrorMode,
    expose_stack_traces: bool,
) -> Response<ResponseBody> {
    let mut ctx = pool.acquire();
    ctx.set_redirect_policy(redirect_policy);

    if let Err(err) = populate_request(&mut ctx, req, peer_addr).await {
        return error_response(&err, error_mode, expose_stack_traces);
    }

    let method = ctx.request.method.clone();
    let result = crate::error::async_handler(Router::dispatch_from(
        &router,
        0,
        method,
        &mut ctx,
        Next::terminal(),
    ))
    .await;

    match result {
        Ok(()) => encode_response(&mut ctx),
        Err(err) => error_response(&err, error_mode, expose_stack_traces),
    }
}

/// Copies a `hyper::Request`'s method, path, query, headers, cookies and body into a
/// freshly-acquired [`Context`]. No body-parsing middleware has run yet; `raw_body`
/// carries the bytes as received, for a body-parsing middleware further down the
/// chain to interpret based on `Content-Type`.
async fn populate_request(
    ctx: &mut Context,
    req: Request<Incoming>,
    peer_addr: SocketAddr,
) -> Result<(), Error> {
    let (parts, body) = req.into_parts();

    ctx.request.method = parts.method;
    let path = parts.uri.path().to_string();
    ctx.request.original_path = path.clone();
    ctx.request.path = path;
    ctx.request.query_string = parts.uri.query().unwrap_or("").to_string();
    ctx.request.query =
        crate::primitives::query::parse_query(&ctx.request.query_string).unwrap_or_default();
    ctx.request.remote_addr = Some(peer_addr);
    ctx.request.is_secure = false;

    for (name, value) in parts.headers.iter() {
        let Ok(value_str) = value.to_str() else {
            continue;
        };
        // A header rejected by our own wire-safety rules (CRLF, oversize) is dropped
        // rather than failing the whole request; hyper has already parsed the
        // request line and framing by the time we see this.
        let _ = ctx.request.headers.append(name.as_str(), value_str);
    }
    if let Some(cookie_header) = ctx.request.headers.get("cookie") {
        ctx.request.cookies = crate::context::request::parse_cookie_header(cookie_header);
    }

    let collected = body
        .collect()
        .await
        .map_err(|err| Error::bad_request(format!("failed to read request body: {err}")))?;
    ctx.request.raw_body = collected.to_bytes();

    Ok(())
}

/// Builds the `hyper::Response` for a request that completed without raising an
/// [`Error`]. A handler that never called a `send`/`json`/`end`-family method leaves
/// the context unresponded, which renders as a bare 404 — the router's own "nothing
/// matched" outcome looks identical to a handler that silently did nothing.
fn encode_response(ctx: &mut Context) -> Response<ResponseBody> {
    if !ctx.has_responded() {
        return status_only_response(404, "Not Found");
    }

    let mut builder = Response::builder().status(ctx.response.status_code);
    for (name, value) in ctx.response.headers.iter() {
        builder = builder.header(name, value);
    }
    for cookie in &ctx.response.cookies {
        builder = builder.header("set-cookie", cookie.to_header_value());
    }

    let body = match std::mem::replace(&mut ctx.response.body, ResponseBodyKind::Empty) {
        ResponseBodyKind::Empty => full_body(Bytes::new()),
        ResponseBodyKind::Bytes(bytes) => full_body(bytes),
        // Streamed chunk-by-chunk rather than buffered: each item the producer
        // yields becomes one `Frame`, so an unbounded stream never holds more than
        // one chunk in memory at a time.
        ResponseBodyKind::Stream(stream) => {
            let frames = stream.map(|chunk| chunk.map(Frame::data));
            StreamBody::new(frames).boxed()
        }
    };

    builder
        .body(body)
        .unwrap_or_else(|_| status_only_response(500, "Internal Server Error"))
}

/// Renders an [`Error`] into a JSON error body, honoring [`ErrorMode`]: development
/// mode (or `expose_stack_traces`) includes `message`; production mode always sends
/// a fixed, kind-derived message for 5xx errors, and never reveals
/// `is_programming_error` internals regardless of mode.
fn error_response(err: &Error, mode: ErrorMode, expose_stack_traces: bool) -> Response<ResponseBody> {
    let show_message =
        !err.kind().is_server_error() || mode == ErrorMode::Development || expose_stack_traces;
    let message = if show_message && !err.is_programming_error() {
        err.message().to_string()
    } else {
        err.kind().to_string()
    };

    let body = serde_json::json!({
        "error": err.kind().to_string(),
        "message": message,
    });
    let bytes = serde_json::to_vec(&body).unwrap_or_default();

    Response::builder()
        .status(err.status())
        .header("content-type", "application/json; charset=utf-8")
        .body(full_body(Bytes::from(bytes)))
        .unwrap_or_else(|_| status_only_response(500, "Internal Server Error"))
}

fn status_only_response(status: u16, reason: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full_body(Bytes::from(reason.to_string())))
        .expect("status and header are both valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{handler, mw};
    use crate::primitives::regex_cache::RegexCache;
    use futures_util::stream;
    use std::sync::Arc as StdArc;

    fn test_pool() -> StdArc<ContextPool> {
        StdArc::new(ContextPool::new(4))
    }

    /// Collects a `Response<ResponseBody>`'s frames back into one `Bytes` buffer,
    /// the way a real client reading the wire response would, so a test can assert
    /// on the bytes actually produced rather than on the `ResponseBodyKind` that
    /// went in.
    async fn collect_body(response: Response<ResponseBody>) -> Bytes {
        BodyExt::collect(response.into_body())
            .await
            .expect("streamed response body should not error")
            .to_bytes()
    }

    #[tokio::test]
    async fn a_streamed_response_body_is_sent_chunked_not_dropped() {
        let cache = RegexCache::new(8);
        let mut router = Router::new();
        router
            .get(
                &cache,
                "/stream",
                vec![StdArc::new(handler(|ctx: &mut Context| async move {
                    let chunks: Vec<Result<Bytes, Error>> = vec![
                        Ok(Bytes::from_static(b"hello ")),
                        Ok(Bytes::from_static(b"world")),
                    ];
                    let boxed: futures_util::stream::BoxStream<'static, Result<Bytes, Error>> =
                        Box::pin(stream::iter(chunks));
                    ctx.send_stream("text/plain", boxed)?;
                    Ok(())
                })) as _],
            )
            .unwrap();
        let router = StdArc::new(router);
        let pool = test_pool();

        let mut ctx = pool.acquire();
        ctx.request.method = http::Method::GET;
        ctx.request.path = "/stream".to_string();
        Router::dispatch_from(&router, 0, http::Method::GET, &mut ctx, Next::terminal())
            .await
            .unwrap();

        let response = encode_response(&mut ctx);
        assert_eq!(response.status(), 200);
        let body = collect_body(response).await;
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn dispatch_encodes_a_json_response() {
        let cache = RegexCache::new(8);
        let mut router = Router::new();
        router
            .get(
                &cache,
                "/health",
                vec![StdArc::new(handler(|ctx: &mut Context| async move {
                    ctx.json(&serde_json::json!({"ok": true}))?;
                    Ok(())
                })) as _],
            )
            .unwrap();
        let router = StdArc::new(router);
        let pool = test_pool();

        let mut ctx = pool.acquire();
        ctx.request.method = http::Method::GET;
        ctx.request.path = "/health".to_string();
        Router::dispatch_from(&router, 0, http::Method::GET, &mut ctx, Next::terminal())
            .await
            .unwrap();
        let response = encode_response(&mut ctx);
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn unmatched_route_encodes_as_404() {
        let router = StdArc::new(Router::new());
        let pool = test_pool();
        let mut ctx = pool.acquire();
        ctx.request.path = "/missing".to_string();
        Router::dispatch_from(&router, 0, http::Method::GET, &mut ctx, Next::terminal())
            .await
            .unwrap();
        let response = encode_response(&mut ctx);
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn error_response_hides_message_in_production_unless_exposed() {
        let err = Error::internal("database connection string leaked");
        let prod = error_response(&err, ErrorMode::Production, false);
        assert_eq!(prod.status(), 500);

        let dev = error_response(&err, ErrorMode::Development, false);
        assert_eq!(dev.status(), 500);

        let exposed = error_response(&err, ErrorMode::Production, true);
        assert_eq!(exposed.status(), 500);
    }

    #[tokio::test]
    async fn client_errors_always_show_their_message() {
        let err = Error::bad_request("missing field 'name'");
        let response = error_response(&err, ErrorMode::Production, false);
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn middleware_can_still_short_circuit_before_the_route_handler() {
        let cache = RegexCache::new(8);
        let mut router = Router::new();
        router.use_mw(StdArc::new(mw(|ctx: &mut Context, _next: Next| async move {
            ctx.status(401)?;
            ctx.json(&serde_json::json!({"error": "Unauthorized"}))?;
            Ok(())
        })));
        router
            .get(&cache, "/private", vec![StdArc::new(handler(|ctx: &mut Context| async move {
                ctx.text("should not run")?;
                Ok(())
            })) as _])
            .unwrap();
        let router = StdArc::new(router);
        let pool = test_pool();
        let mut ctx = pool.acquire();
        ctx.request.path = "/private".to_string();
        Router::dispatch_from(&router, 0, http::Method::GET, &mut ctx, Next::terminal())
            .await
            .unwrap();
        let response = encode_response(&mut ctx);
        assert_eq!(response.status(), 401);
    }
}

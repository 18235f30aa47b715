//! # Expresso
//!
//! Expresso is an Express.js-inspired HTTP application framework: an ordered chain of
//! middleware and routed handlers share a single mutable [`context::Context`] per
//! request, built on `tokio` and `hyper`.
//!
//! ## Modules
//!
//! - [`app`] — the application kernel: binding, lifecycle, graceful shutdown.
//! - [`router`] — path pattern compilation, method dispatch, nested routers and groups.
//! - [`context`] — the per-request mutable state object.
//! - [`middleware`] — the middleware/handler traits and the built-in protocol-critical
//!   middleware (body parsing, static files, compression, rate limiting, caching,
//!   sessions, CORS, security headers, logging).
//! - [`primitives`] — length-bounded JSON/query parsing, the safe regex cache,
//!   constant-time comparison.
//! - [`extract`] — typed extraction traits backing `#[derive(FromParams)]` /
//!   `#[derive(FromQuery)]` from the `expresso-macros` crate.
//! - [`error`] — the HTTP error taxonomy shared across the crate.

pub mod app;
pub mod context;
pub mod error;
pub mod extract;
pub mod middleware;
pub mod primitives;
pub mod router;

pub use app::{App, AppConfig, ErrorMode};
pub use context::Context;
pub use error::{Error, ErrorKind};
pub use router::Router;

pub use expresso_macros::{FromParams, FromQuery};

//! The HTTP error taxonomy shared by the router, the body parser, the static file
//! middleware and application handlers: a small, closed set of *kinds* (not Rust
//! types) each carrying a fixed status code, plus a human-readable message that is
//! only ever shown to the client for 4xx kinds.
//!
//! See [`crate::app::ErrorMode`] for how a 5xx [`Error`] is rendered differently in
//! development versus production.

use std::fmt;

/// The category of an [`Error`]. Each variant maps to exactly one HTTP status code;
/// the mapping is fixed and is not configurable per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    Conflict,
    PayloadTooLarge,
    UnsupportedMediaType,
    TooManyRequests,
    Internal,
    ServiceUnavailable,
}

impl ErrorKind {
    /// The HTTP status code this kind always maps to.
    pub fn status(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::MethodNotAllowed => 405,
            ErrorKind::Conflict => 409,
            ErrorKind::PayloadTooLarge => 413,
            ErrorKind::UnsupportedMediaType => 415,
            ErrorKind::TooManyRequests => 429,
            ErrorKind::Internal => 500,
            ErrorKind::ServiceUnavailable => 503,
        }
    }

    /// True for the 5xx kinds, which get their message hidden in production.
    pub fn is_server_error(self) -> bool {
        self.status() >= 500
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::BadRequest => "Bad Request",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "Not Found",
            ErrorKind::MethodNotAllowed => "Method Not Allowed",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::PayloadTooLarge => "Payload Too Large",
            ErrorKind::UnsupportedMediaType => "Unsupported Media Type",
            ErrorKind::TooManyRequests => "Too Many Requests",
            ErrorKind::Internal => "Internal Server Error",
            ErrorKind::ServiceUnavailable => "Service Unavailable",
        };
        write!(f, "{name}")
    }
}

/// An error raised anywhere in the middleware chain: by a handler, by the router, or
/// by protocol-critical middleware such as the body parser or static file server.
///
/// `message` is safe to show a client for 4xx kinds. For 5xx kinds it is shown only
/// in development mode (see [`crate::app::ErrorMode`]) and is always present in logs
/// regardless of mode.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    /// Set for errors raised by the engine itself (a double `next()` call, a
    /// malformed status code) rather than by application or middleware code. These
    /// are always logged verbatim server-side and always rendered as a bare 500 to
    /// the client, even in development.
    programming_error: bool,
}

impl Error {
    /// Builds an error of `kind` with a custom message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            programming_error: false,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotFound, message)
    }

    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::MethodNotAllowed, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Conflict, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::PayloadTooLarge, message)
    }

    pub fn unsupported_media_type(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::UnsupportedMediaType, message)
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::TooManyRequests, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Internal, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::ServiceUnavailable, message)
    }

    /// An error raised by the engine itself, not by application code: a double
    /// `next()` call, a status code set outside `[100, 599]`, a pool handed out a
    /// still-in-flight context. Always logged verbatim, never shown to the client.
    pub fn programming_error(message: impl Into<String>) -> Self {
        Error {
            kind: ErrorKind::Internal,
            message: message.into(),
            programming_error: true,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status(&self) -> u16 {
        self.kind.status()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_programming_error(&self) -> bool {
        self.programming_error
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.kind.status(), self.message)
    }
}

impl std::error::Error for Error {}

impl From<crate::primitives::JsonError> for Error {
    fn from(err: crate::primitives::JsonError) -> Self {
        Error::bad_request(err.to_string())
    }
}

impl From<crate::primitives::QueryError> for Error {
    fn from(err: crate::primitives::QueryError) -> Self {
        Error::bad_request(err.to_string())
    }
}

impl From<crate::primitives::RegexError> for Error {
    fn from(err: crate::primitives::RegexError) -> Self {
        Error::internal(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(err.to_string()),
            std::io::ErrorKind::TimedOut => Error::service_unavailable(err.to_string()),
            _ => Error::internal(err.to_string()),
        }
    }
}

/// Wraps a fallible handler future so that a panic inside it is caught and converted
/// into a 500-class [`Error`] instead of unwinding the request task and dropping the
/// connection silently. This is the `asyncHandler` of the framework: with `Result`
/// and `?` already threading errors down the chain, the only way a handler's failure
/// could otherwise go unreported is a panic.
pub async fn async_handler<Fut>(fut: Fut) -> Result<(), Error>
where
    Fut: std::future::Future<Output = Result<(), Error>>,
{
    use futures_util::FutureExt;
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(&payload);
            Err(Error::internal(message))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

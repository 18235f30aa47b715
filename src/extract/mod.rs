//! Typed extraction traits implemented by `#[derive(FromParams)]` and
//! `#[derive(FromQuery)]`, letting a handler parse its route params or query string
//! into a plain struct instead of reading each field off [`crate::context::Context`]
//! by name.

use crate::context::request::{Params, Query};

/// Implemented by a struct whose fields should be parsed out of a matched route's
/// captured [`Params`]. Normally derived via `#[derive(FromParams)]` rather than
/// hand-written; the error type is a plain message rather than [`crate::error::Error`]
/// so a handler can fold it into whichever 400-class error it prefers.
pub trait FromParams: Sized {
    fn from_params(params: &Params) -> Result<Self, String>;
}

/// Implemented by a struct whose fields should be parsed out of a request's
/// [`Query`] string. Normally derived via `#[derive(FromQuery)]`.
pub trait FromQuery: Sized {
    fn from_query(query: &Query) -> Result<Self, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UserId {
        id: u32,
    }

    impl FromParams for UserId {
        fn from_params(params: &Params) -> Result<Self, String> {
            let id = params
                .get("id")
                .ok_or_else(|| "Missing route parameter: id".to_string())?
                .parse()
                .map_err(|_| "invalid id".to_string())?;
            Ok(UserId { id })
        }
    }

    #[test]
    fn from_params_parses_captured_value() {
        let mut params = Params::new();
        params.insert("id", "42");
        let parsed = UserId::from_params(&params).unwrap();
        assert_eq!(parsed.id, 42);
    }

    #[test]
    fn from_params_errors_on_missing_key() {
        let params = Params::new();
        assert!(UserId::from_params(&params).is_err());
    }
}

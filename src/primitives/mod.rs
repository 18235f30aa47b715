//! Length-bounded, allocation-bounded building blocks shared by the router, the body
//! parser, and the query-string accessor on [`crate::context::Context`].
//!
//! None of these types talk to the network or the filesystem; they exist so that a
//! single malicious or malformed request can never force unbounded work or memory use
//! on the request task that is parsing it.

pub mod constant_time;
pub mod json;
pub mod query;
pub mod regex_cache;

pub use constant_time::constant_time_eq;
pub use json::{parse_json, JsonError, JsonLimits};
pub use query::{parse_query, Query, QueryError, QueryValue};
pub use regex_cache::{RegexCache, RegexError};

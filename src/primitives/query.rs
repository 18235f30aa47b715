//! Parses `application/x-www-form-urlencoded` bytes — whether they come from a
//! request's query string or from a form-urlencoded body — into an ordered map that
//! never materializes keys able to shadow an object's prototype chain, and never
//! grows past a configured byte budget.
//!
//! Rust maps have no prototype chain, so `__proto__` poisoning can't happen here the
//! way it can in a JS object literal. The rejection is kept anyway: it is the
//! documented, language-independent contract this parser is specified against, and a
//! caller piping these keys into another system (a templating engine, a JS bridge)
//! should not have to re-derive that it's safe to do so.

use std::fmt;

const DANGEROUS_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// A single parsed query value: the common case of one value, or every value when a
/// key repeats (`?tag=a&tag=b`).
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Single(String),
    Multi(Vec<String>),
}

impl QueryValue {
    /// The first (or only) value.
    pub fn first(&self) -> &str {
        match self {
            QueryValue::Single(s) => s,
            QueryValue::Multi(v) => v.first().map(String::as_str).unwrap_or(""),
        }
    }

    /// All values for this key, in the order they appeared.
    pub fn all(&self) -> Vec<&str> {
        match self {
            QueryValue::Single(s) => vec![s.as_str()],
            QueryValue::Multi(v) => v.iter().map(String::as_str).collect(),
        }
    }

    fn push(&mut self, value: String) {
        match self {
            QueryValue::Single(existing) => {
                *self = QueryValue::Multi(vec![std::mem::take(existing), value]);
            }
            QueryValue::Multi(values) => values.push(value),
        }
    }
}

/// An ordered `key -> value(s)` map parsed from a query string or urlencoded body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    entries: Vec<(String, QueryValue)>,
}

impl Query {
    /// Returns the first value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.first())
    }

    /// Returns every value recorded for `key`, in arrival order.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.all())
            .unwrap_or_default()
    }

    /// True if no key was parsed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(key, value)` pairs in arrival order. Repeated keys are
    /// expanded, one pair per value.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().flat_map(|(k, v)| {
            v.all().into_iter().map(move |value| (k.as_str(), value))
        })
    }

    fn insert(&mut self, key: String, value: String) {
        if let Some((_, existing)) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            existing.push(value);
        } else {
            self.entries.push((key, QueryValue::Single(value)));
        }
    }

    /// Builds a [`Query`] directly from already-decoded pairs, skipping the
    /// percent-decoding and size cap [`parse_query`] applies. Used by the multipart
    /// body parser, which gets its field values straight from a part body rather
    /// than from a `key=value` wire string.
    pub(crate) fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut query = Query::default();
        for (key, value) in pairs {
            query.insert(key, value);
        }
        query
    }

    /// Re-serializes this map back into `a=1&b=2` form. Round-trips with
    /// [`parse_query`] for any map with no rejected keys.
    pub fn to_query_string(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.iter() {
            if !out.is_empty() {
                out.push('&');
            }
            out.push_str(&urlencoding::encode(key));
            out.push('=');
            out.push_str(&urlencoding::encode(value));
        }
        out
    }
}

/// A rejected query string.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The raw input exceeded the configured byte cap.
    TooLarge { size: usize, limit: usize },
    /// A key in the dangerous-key deny-list (`__proto__`, `constructor`, `prototype`)
    /// was present.
    DangerousKey(String),
    /// A `%XX` escape could not be decoded.
    MalformedEncoding,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::TooLarge { size, limit } => {
                write!(f, "query too large: {size} bytes (limit {limit})")
            }
            QueryError::DangerousKey(key) => write!(f, "rejected unsafe key '{key}'"),
            QueryError::MalformedEncoding => write!(f, "malformed percent-encoding"),
        }
    }
}

impl std::error::Error for QueryError {}

/// Maximum input accepted by [`parse_query`] unless the caller passes a smaller cap
/// explicitly via [`parse_query_with_limit`].
pub const DEFAULT_MAX_BYTES: usize = 1024 * 1024;

/// Parses `input` (without a leading `?`) using the default 1 MiB cap.
pub fn parse_query(input: &str) -> Result<Query, QueryError> {
    parse_query_with_limit(input, DEFAULT_MAX_BYTES)
}

/// Parses `input` (without a leading `?`), rejecting it outright if longer than
/// `max_bytes` or if it carries a prototype-pollution-shaped key.
pub fn parse_query_with_limit(input: &str, max_bytes: usize) -> Result<Query, QueryError> {
    if input.len() > max_bytes {
        return Err(QueryError::TooLarge {
            size: input.len(),
            limit: max_bytes,
        });
    }

    let mut query = Query::default();
    if input.is_empty() {
        return Ok(query);
    }

    for pair in input.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (raw_key, raw_value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        let key = decode_component(raw_key)?;
        let value = decode_component(raw_value)?;

        if DANGEROUS_KEYS
            .iter()
            .any(|dangerous| dangerous.eq_ignore_ascii_case(&key))
        {
            return Err(QueryError::DangerousKey(key));
        }

        query.insert(key, value);
    }

    Ok(query)
}

fn decode_component(input: &str) -> Result<String, QueryError> {
    let with_plus = input.replace('+', " ");
    urlencoding::decode(&with_plus)
        .map(|cow| cow.into_owned())
        .map_err(|_| QueryError::MalformedEncoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_pairs() {
        let q = parse_query("a=1&b=two").unwrap();
        assert_eq!(q.get("a"), Some("1"));
        assert_eq!(q.get("b"), Some("two"));
    }

    #[test]
    fn repeated_keys_become_multi() {
        let q = parse_query("tag=a&tag=b&tag=c").unwrap();
        assert_eq!(q.get_all("tag"), vec!["a", "b", "c"]);
    }

    #[test]
    fn rejects_proto_key() {
        assert_eq!(
            parse_query("__proto__=x"),
            Err(QueryError::DangerousKey("__proto__".into()))
        );
        assert_eq!(
            parse_query("constructor=x"),
            Err(QueryError::DangerousKey("constructor".into()))
        );
        assert_eq!(
            parse_query("prototype=x"),
            Err(QueryError::DangerousKey("prototype".into()))
        );
    }

    #[test]
    fn rejects_oversize_input() {
        let huge = "a=".to_string() + &"x".repeat(100);
        assert_eq!(
            parse_query_with_limit(&huge, 10),
            Err(QueryError::TooLarge {
                size: huge.len(),
                limit: 10
            })
        );
    }

    #[test]
    fn decodes_percent_encoding() {
        let q = parse_query("name=John%20Doe&tag=a%2Bb").unwrap();
        assert_eq!(q.get("name"), Some("John Doe"));
        assert_eq!(q.get("tag"), Some("a+b"));
    }

    #[test]
    fn round_trips_through_to_query_string() {
        let original = parse_query("a=1&b=2").unwrap();
        let serialized = original.to_query_string();
        let reparsed = parse_query(&serialized).unwrap();
        assert_eq!(original, reparsed);
    }

    #[test]
    fn empty_value_is_empty_string() {
        let q = parse_query("flag").unwrap();
        assert_eq!(q.get("flag"), Some(""));
    }
}

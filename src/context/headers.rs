//! A case-insensitive, multi-value header map used on both the request and response
//! side of a [`crate::context::Context`].

use std::fmt;

/// Maximum size, in bytes, of a single header value accepted by [`Headers::set`] or
/// parsed off the wire.
pub const MAX_HEADER_VALUE_BYTES: usize = 8192;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    // Stored as (lowercased-name, original-name, values) so we can answer
    // case-insensitive lookups while still emitting the name the caller wrote.
    entries: Vec<(String, String, Vec<String>)>,
}

/// A header name or value that violates the wire-safety contract: no CR, LF, or NUL,
/// and a value no longer than [`MAX_HEADER_VALUE_BYTES`].
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderError {
    InvalidCharacters,
    ValueTooLong { len: usize, limit: usize },
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::InvalidCharacters => {
                write!(f, "header name or value contains CR, LF, or NUL")
            }
            HeaderError::ValueTooLong { len, limit } => {
                write!(f, "header value too long: {len} bytes (limit {limit})")
            }
        }
    }
}

impl std::error::Error for HeaderError {}

fn is_wire_safe(s: &str) -> bool {
    !s.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0)
}

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    /// Sets `name` to exactly `value`, discarding any previous values (`HTTP`
    /// `set`, not `append`).
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), HeaderError> {
        if !is_wire_safe(name) || !is_wire_safe(value) {
            return Err(HeaderError::InvalidCharacters);
        }
        if value.len() > MAX_HEADER_VALUE_BYTES {
            return Err(HeaderError::ValueTooLong {
                len: value.len(),
                limit: MAX_HEADER_VALUE_BYTES,
            });
        }
        let lower = name.to_ascii_lowercase();
        if let Some(entry) = self.entries.iter_mut().find(|(l, _, _)| *l == lower) {
            entry.1 = name.to_string();
            entry.2 = vec![value.to_string()];
        } else {
            self.entries.push((lower, name.to_string(), vec![value.to_string()]));
        }
        Ok(())
    }

    /// Appends an additional value for `name` without discarding existing ones
    /// (used for repeatable headers like `Set-Cookie`).
    pub fn append(&mut self, name: &str, value: &str) -> Result<(), HeaderError> {
        if !is_wire_safe(name) || !is_wire_safe(value) {
            return Err(HeaderError::InvalidCharacters);
        }
        if value.len() > MAX_HEADER_VALUE_BYTES {
            return Err(HeaderError::ValueTooLong {
                len: value.len(),
                limit: MAX_HEADER_VALUE_BYTES,
            });
        }
        let lower = name.to_ascii_lowercase();
        if let Some(entry) = self.entries.iter_mut().find(|(l, _, _)| *l == lower) {
            entry.2.push(value.to_string());
        } else {
            self.entries.push((lower, name.to_string(), vec![value.to_string()]));
        }
        Ok(())
    }

    /// First value for `name`, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(l, _, _)| *l == lower)
            .and_then(|(_, _, values)| values.first())
            .map(String::as_str)
    }

    /// Every value recorded for `name`, case-insensitively.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        let lower = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(l, _, _)| *l == lower)
            .map(|(_, _, values)| values.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        let lower = name.to_ascii_lowercase();
        self.entries.retain(|(l, _, _)| *l != lower);
    }

    /// Iterates `(original-case name, value)` pairs, one per stored value.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(_, name, values)| values.iter().map(move |v| (name.as_str(), v.as_str())))
    }

    /// Keeps only the headers whose lowercased name appears in `allow_list`. Used by
    /// the response cache to strip request-only or sensitive headers before storing
    /// a cached entry.
    pub fn retain_allowed(&self, allow_list: &[&str]) -> Headers {
        let mut out = Headers::new();
        for (name, value) in self.iter() {
            if allow_list
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(name))
            {
                // allow_list entries are static and known-safe; append cannot fail.
                let _ = out.append(name, value);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_case_insensitive() {
        let mut h = Headers::new();
        h.set("Content-Type", "text/plain").unwrap();
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn set_replaces_append_adds() {
        let mut h = Headers::new();
        h.append("Set-Cookie", "a=1").unwrap();
        h.append("Set-Cookie", "b=2").unwrap();
        assert_eq!(h.get_all("set-cookie"), vec!["a=1", "b=2"]);

        h.set("Set-Cookie", "only=one").unwrap();
        assert_eq!(h.get_all("set-cookie"), vec!["only=one"]);
    }

    #[test]
    fn rejects_crlf_injection() {
        let mut h = Headers::new();
        assert_eq!(
            h.set("X-Evil", "value\r\nX-Injected: yes"),
            Err(HeaderError::InvalidCharacters)
        );
        assert_eq!(
            h.set("X-Evil\r\n", "value"),
            Err(HeaderError::InvalidCharacters)
        );
    }

    #[test]
    fn rejects_oversize_value() {
        let mut h = Headers::new();
        let huge = "x".repeat(MAX_HEADER_VALUE_BYTES + 1);
        assert!(matches!(
            h.set("X-Huge", &huge),
            Err(HeaderError::ValueTooLong { .. })
        ));
    }

    #[test]
    fn retain_allowed_filters_by_name() {
        let mut h = Headers::new();
        h.set("Content-Type", "application/json").unwrap();
        h.set("X-Secret", "do-not-cache").unwrap();
        let filtered = h.retain_allowed(&["content-type", "etag"]);
        assert!(filtered.contains("content-type"));
        assert!(!filtered.contains("x-secret"));
    }
}

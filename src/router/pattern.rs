//! Compiles an Express-style route pattern (`/users/:id`, `/files/*rest`) into a
//! [`regex::Regex`] plus the ordered list of parameter names its capture groups
//! correspond to.
//!
//! `:name` captures one path segment (`[^/]+`); `*name` (or a bare `*`) greedily
//! captures the remainder of the path, slashes included. Literal characters are
//! escaped individually so that a path containing regex metacharacters (`/a.b`,
//! `/v1.2`) is matched literally rather than interpreted.

use std::sync::Arc;

use regex::Regex;

use crate::primitives::regex_cache::{RegexCache, RegexError};

/// A route pattern compiled to a regex, along with the names its positional capture
/// groups bind to.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    regex: Arc<Regex>,
    param_names: Vec<String>,
    /// `true` for a route's own pattern (must match the whole remaining path);
    /// `false` for a mount prefix, which only needs to match a leading segment
    /// boundary.
    exact: bool,
    /// The pattern exactly as the caller wrote it (`/users/:id`), kept around for
    /// introspection (`Router::routes`) since the compiled regex body no longer
    /// resembles it.
    source: String,
}

/// The result of successfully matching a path against a [`CompiledPattern`].
pub struct PatternMatch {
    /// `(name, value)` pairs in the order the pattern declared them.
    pub params: Vec<(String, String)>,
    /// Byte length of the path consumed by this match, including any trailing
    /// separator. Unused for `exact` patterns.
    consumed: usize,
}

impl CompiledPattern {
    /// Compiles `pattern` for an exact, whole-path match (used by individual
    /// routes).
    pub fn compile_exact(cache: &RegexCache, pattern: &str, case_sensitive: bool) -> Result<Self, RegexError> {
        Self::compile(cache, pattern, case_sensitive, true)
    }

    /// Compiles `pattern` as a mount prefix: it matches a leading run of path
    /// segments and leaves the caller to inspect how much was consumed.
    pub fn compile_prefix(cache: &RegexCache, pattern: &str, case_sensitive: bool) -> Result<Self, RegexError> {
        Self::compile(cache, pattern, case_sensitive, false)
    }

    fn compile(cache: &RegexCache, pattern: &str, case_sensitive: bool, exact: bool) -> Result<Self, RegexError> {
        let (body, param_names) = build_regex_body(pattern, exact);
        let regex = cache.get_or_compile(&body, !case_sensitive)?;
        Ok(CompiledPattern {
            regex,
            param_names,
            exact,
            source: pattern.to_string(),
        })
    }

    /// The pattern text exactly as originally registered, e.g. `/users/:id`.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Attempts to match `path`. For an exact pattern this must consume the whole
    /// string; for a prefix pattern a match anchored at a segment boundary is
    /// enough, and the caller uses [`PatternMatch::remainder`] to find what's left.
    pub fn match_path<'a>(&self, path: &'a str) -> Option<PatternMatch> {
        let caps = self.regex.captures(path)?;
        let whole = caps.get(0)?;

        // Extra capture groups beyond `param_names` (e.g. this pattern's own
        // boundary-assertion group) are present in `caps` but simply ignored here.
        let mut params = Vec::with_capacity(self.param_names.len());
        for (i, name) in self.param_names.iter().enumerate() {
            if let Some(group) = caps.get(i + 1) {
                params.push((name.clone(), group.as_str().to_string()));
            }
        }

        let consumed = if self.exact {
            whole.end()
        } else {
            let sep_idx = self.param_names.len() + 1;
            match caps.get(sep_idx) {
                Some(sep) if sep.as_str() == "/" => sep.start(),
                _ => whole.end(),
            }
        };

        Some(PatternMatch { params, consumed })
    }
}

impl PatternMatch {
    /// The portion of the original path left over after a prefix match, always
    /// beginning with `/` (synthesized as `"/"` when the match consumed the whole
    /// path).
    pub fn remainder<'a>(&self, path: &'a str) -> &'a str {
        if self.consumed >= path.len() {
            "/"
        } else {
            &path[self.consumed..]
        }
    }
}

const IDENT_CHARS: fn(char) -> bool = |c: char| c.is_ascii_alphanumeric() || c == '_';

fn build_regex_body(pattern: &str, exact: bool) -> (String, Vec<String>) {
    let chars: Vec<char> = pattern.chars().collect();
    let mut body = String::from("^");
    let mut names = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            ':' => {
                i += 1;
                let start = i;
                while i < chars.len() && IDENT_CHARS(chars[i]) {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                names.push(if name.is_empty() {
                    format!("param{}", names.len())
                } else {
                    name
                });
                body.push_str("([^/]+)");
            }
            '*' => {
                i += 1;
                let start = i;
                while i < chars.len() && IDENT_CHARS(chars[i]) {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                names.push(if name.is_empty() {
                    "wildcard".to_string()
                } else {
                    name
                });
                body.push_str("(.*)");
            }
            c => {
                body.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }

    if exact {
        body.push('$');
    } else {
        // Non-capturing boundary: either a `/` starting the remainder, or
        // end-of-string when the prefix matches the whole path exactly.
        body.push_str("(/|$)");
    }

    (body, names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> RegexCache {
        RegexCache::new(16)
    }

    #[test]
    fn exact_pattern_extracts_named_param() {
        let pattern = CompiledPattern::compile_exact(&cache(), "/users/:id", true).unwrap();
        let m = pattern.match_path("/users/42").unwrap();
        assert_eq!(m.params, vec![("id".to_string(), "42".to_string())]);
    }

    #[test]
    fn exact_pattern_rejects_extra_segment() {
        let pattern = CompiledPattern::compile_exact(&cache(), "/users/:id", true).unwrap();
        assert!(pattern.match_path("/users/42/extra").is_none());
    }

    #[test]
    fn wildcard_captures_remaining_segments() {
        let pattern = CompiledPattern::compile_exact(&cache(), "/files/*rest", true).unwrap();
        let m = pattern.match_path("/files/a/b/c.txt").unwrap();
        assert_eq!(m.params[0].1, "a/b/c.txt");
    }

    #[test]
    fn prefix_pattern_matches_mount_boundary_only() {
        let pattern = CompiledPattern::compile_prefix(&cache(), "/api", true).unwrap();
        let m = pattern.match_path("/api/users").unwrap();
        assert_eq!(m.remainder("/api/users"), "/users");

        assert!(pattern.match_path("/apiextra").is_none());
    }

    #[test]
    fn prefix_pattern_matching_whole_path_yields_root_remainder() {
        let pattern = CompiledPattern::compile_prefix(&cache(), "/api", true).unwrap();
        let m = pattern.match_path("/api").unwrap();
        assert_eq!(m.remainder("/api"), "/");
    }

    #[test]
    fn literal_dots_are_escaped_not_wildcarded() {
        let pattern = CompiledPattern::compile_exact(&cache(), "/v1.2/ping", true).unwrap();
        assert!(pattern.match_path("/v1.2/ping").is_some());
        assert!(pattern.match_path("/v1X2/ping").is_none());
    }

    #[test]
    fn case_insensitive_option_matches_regardless_of_case() {
        let pattern = CompiledPattern::compile_exact(&cache(), "/Users", false).unwrap();
        assert!(pattern.match_path("/users").is_some());
    }
}

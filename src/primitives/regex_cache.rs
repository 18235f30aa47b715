//! An LRU-bounded cache of compiled [`regex::Regex`] patterns, gated by a complexity
//! check that rejects the catastrophic-backtracking shapes before they're ever
//! handed to the regex engine.
//!
//! `regex` itself never backtracks — it compiles to a Thompson NFA and runs in time
//! linear in the input — so a pattern accepted here cannot actually hang the process.
//! The validator exists anyway because route patterns in this framework are user
//! input (they come from `app.get("/users/:id")` calls across a whole application,
//! some of which may be templated from configuration), and a pattern that is merely
//! *absurd* — a thousand alternations, a million capture groups — is worth rejecting
//! on its own terms rather than silently eating memory.

use lru::LruCache;
use regex::{Regex, RegexBuilder};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

const MAX_PATTERN_LEN: usize = 2048;
const MAX_CAPTURE_GROUPS: usize = 64;
const MAX_ALTERNATIONS: usize = 128;

/// A pattern rejected by the complexity validator, or a pattern `regex` itself could
/// not compile.
#[derive(Debug, Clone, PartialEq)]
pub enum RegexError {
    /// The raw pattern source is longer than [`MAX_PATTERN_LEN`].
    PatternTooLong { len: usize, limit: usize },
    /// More capture groups than [`MAX_CAPTURE_GROUPS`].
    TooManyCaptures { count: usize, limit: usize },
    /// More top-level alternations (`|`) than [`MAX_ALTERNATIONS`].
    TooManyAlternations { count: usize, limit: usize },
    /// A nested-quantifier shape (`(a+)+`, `(a*)*`, ...) classically associated with
    /// catastrophic backtracking in backtracking engines.
    CatastrophicShape,
    /// `regex` rejected the (already-validated) pattern, e.g. for a syntax error.
    CompileFailed(String),
}

impl fmt::Display for RegexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegexError::PatternTooLong { len, limit } => {
                write!(f, "pattern too long: {len} bytes (limit {limit})")
            }
            RegexError::TooManyCaptures { count, limit } => {
                write!(f, "too many capture groups: {count} (limit {limit})")
            }
            RegexError::TooManyAlternations { count, limit } => {
                write!(f, "too many alternations: {count} (limit {limit})")
            }
            RegexError::CatastrophicShape => {
                write!(f, "pattern has a nested-quantifier shape that was rejected")
            }
            RegexError::CompileFailed(msg) => write!(f, "pattern failed to compile: {msg}"),
        }
    }
}

impl std::error::Error for RegexError {}

/// An LRU-bounded cache mapping `(pattern, case_insensitive)` to a compiled
/// [`Regex`], gated by [`validate_complexity`].
pub struct RegexCache {
    inner: Mutex<LruCache<(String, bool), Arc<Regex>>>,
}

impl RegexCache {
    /// Builds a cache holding at most `capacity` compiled patterns.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        RegexCache {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns a compiled, cached `Regex` for `pattern`, validating and compiling it
    /// on a cache miss. A hit promotes the entry to most-recently-used.
    pub fn get_or_compile(
        &self,
        pattern: &str,
        case_insensitive: bool,
    ) -> Result<Arc<Regex>, RegexError> {
        let key = (pattern.to_string(), case_insensitive);
        {
            let mut cache = self.inner.lock().unwrap();
            if let Some(hit) = cache.get(&key) {
                return Ok(hit.clone());
            }
        }

        let simplified = validate_complexity(pattern)?;
        let compiled = RegexBuilder::new(&simplified)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| RegexError::CompileFailed(e.to_string()))?;
        let compiled = Arc::new(compiled);

        let mut cache = self.inner.lock().unwrap();
        cache.put(key, compiled.clone());
        Ok(compiled)
    }

    /// Current number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RegexCache {
    fn default() -> Self {
        RegexCache::new(512)
    }
}

impl fmt::Debug for RegexCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegexCache")
            .field("len", &self.len())
            .finish()
    }
}

/// Rejects patterns that are too large to be worth compiling, or that carry a
/// nested-quantifier shape. Returns the pattern to compile, which may differ from
/// the input when a borderline shape was simplified (`(a+)+` -> `(a+)`).
fn validate_complexity(pattern: &str) -> Result<String, RegexError> {
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(RegexError::PatternTooLong {
            len: pattern.len(),
            limit: MAX_PATTERN_LEN,
        });
    }

    let captures = count_capture_groups(pattern);
    if captures > MAX_CAPTURE_GROUPS {
        return Err(RegexError::TooManyCaptures {
            count: captures,
            limit: MAX_CAPTURE_GROUPS,
        });
    }

    let alternations = pattern.matches('|').count();
    if alternations > MAX_ALTERNATIONS {
        return Err(RegexError::TooManyAlternations {
            count: alternations,
            limit: MAX_ALTERNATIONS,
        });
    }

    simplify_nested_quantifiers(pattern)
}

fn count_capture_groups(pattern: &str) -> usize {
    let bytes = pattern.as_bytes();
    let mut count = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == b'(' && bytes.get(i + 1) != Some(&b'?') {
            count += 1;
        }
        i += 1;
    }
    count
}

/// Detects groups shaped like `(X+)+`, `(X*)*`, `(X+)*`, `(X*)+` — a quantified group
/// whose own body is itself quantified — and collapses the outer quantifier, since
/// it is redundant with the inner one and is the textbook trigger for catastrophic
/// backtracking in a backtracking engine. Anything that still looks pathological
/// after one simplification pass is rejected outright rather than looped on.
fn simplify_nested_quantifiers(pattern: &str) -> Result<String, RegexError> {
    let danger = Regex::new(r"\(([^()]*[+*])\)[+*]").unwrap();
    if !danger.is_match(pattern) {
        return Ok(pattern.to_string());
    }

    let simplified = danger.replace_all(pattern, "($1)").into_owned();
    if danger.is_match(&simplified) {
        return Err(RegexError::CatastrophicShape);
    }
    Ok(simplified)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_and_caches_simple_pattern() {
        let cache = RegexCache::new(4);
        let r1 = cache.get_or_compile(r"^/users/([^/]+)$", false).unwrap();
        let r2 = cache.get_or_compile(r"^/users/([^/]+)$", false).unwrap();
        assert!(Arc::ptr_eq(&r1, &r2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn rejects_too_many_captures() {
        let cache = RegexCache::new(4);
        let pattern = "(".repeat(MAX_CAPTURE_GROUPS + 1) + &")".repeat(MAX_CAPTURE_GROUPS + 1);
        let err = cache.get_or_compile(&pattern, false).unwrap_err();
        assert!(matches!(err, RegexError::TooManyCaptures { .. }));
    }

    #[test]
    fn simplifies_nested_quantifier() {
        let cache = RegexCache::new(4);
        let compiled = cache.get_or_compile(r"(a+)+$", false).unwrap();
        assert!(compiled.is_match("aaaa"));
    }

    #[test]
    fn lru_evicts_oldest_unused_entry() {
        let cache = RegexCache::new(2);
        cache.get_or_compile("a", false).unwrap();
        cache.get_or_compile("b", false).unwrap();
        // touch "a" so "b" becomes the least-recently-used entry
        cache.get_or_compile("a", false).unwrap();
        cache.get_or_compile("c", false).unwrap();
        assert_eq!(cache.len(), 2);
        let inner = cache.inner.lock().unwrap();
        assert!(inner.contains(&("a".to_string(), false)));
        assert!(inner.contains(&("c".to_string(), false)));
        assert!(!inner.contains(&("b".to_string(), false)));
    }
}

//! The policy [`crate::context::Context::redirect`] consults before honoring a
//! `Location` target: a fixed deny-list of dangerous schemes, and an allow-list (or
//! explicit opt-in) gating redirects to a different origin.

/// Controls which targets [`crate::context::Context::redirect`] accepts. Built once at
/// application setup and shared by every pooled [`crate::context::Context`]; never
/// mutated per-request.
#[derive(Debug, Clone)]
pub struct RedirectPolicy {
    /// Hosts an absolute `http(s)://host/...` redirect target is allowed to name
    /// besides the request's own host.
    pub allowed_redirect_domains: Vec<String>,
    /// When true, any `http(s)` host is allowed regardless of
    /// `allowed_redirect_domains` — an explicit opt-in for open redirects.
    pub allow_open_redirects: bool,
}

impl Default for RedirectPolicy {
    /// Only relative and same-origin targets are allowed.
    fn default() -> Self {
        RedirectPolicy {
            allowed_redirect_domains: Vec::new(),
            allow_open_redirects: false,
        }
    }
}

const DANGEROUS_SCHEMES: [&str; 5] = ["javascript:", "data:", "vbscript:", "file:", "about:"];

/// A redirect target rejected by [`RedirectPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub enum RedirectRejection {
    /// The target's scheme is in the fixed deny-list (`javascript:`, `data:`, ...).
    DangerousScheme,
    /// The target is an absolute URL to a host not covered by the policy.
    DisallowedHost(String),
}

impl std::fmt::Display for RedirectRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedirectRejection::DangerousScheme => {
                write!(f, "refusing to redirect to a dangerous scheme")
            }
            RedirectRejection::DisallowedHost(host) => {
                write!(f, "refusing open redirect to disallowed host '{host}'")
            }
        }
    }
}

/// A redirect target's shape, as the policy needs to reason about it.
enum Target<'a> {
    Relative,
    Absolute { scheme: &'a str, host: &'a str },
}

fn classify(location: &str) -> Target<'_> {
    if let Some(idx) = location.find("://") {
        let scheme = &location[..idx];
        let rest = &location[idx + 3..];
        let host = rest.split(['/', '?', '#']).next().unwrap_or("");
        return Target::Absolute { scheme, host };
    }
    Target::Relative
}

impl RedirectPolicy {
    /// Checks `location` against this policy, independent of the request's own host
    /// (same-origin exemption is the caller's responsibility via `current_host`).
    pub fn check(&self, location: &str, current_host: Option<&str>) -> Result<(), RedirectRejection> {
        let lower = location.trim_start().to_ascii_lowercase();
        if DANGEROUS_SCHEMES.iter().any(|s| lower.starts_with(s)) {
            return Err(RedirectRejection::DangerousScheme);
        }

        match classify(location) {
            Target::Relative => Ok(()),
            Target::Absolute { scheme, host } => {
                if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
                    return Err(RedirectRejection::DangerousScheme);
                }
                if self.allow_open_redirects {
                    return Ok(());
                }
                if let Some(current) = current_host {
                    if host.eq_ignore_ascii_case(current) {
                        return Ok(());
                    }
                }
                if self
                    .allowed_redirect_domains
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(host))
                {
                    return Ok(());
                }
                Err(RedirectRejection::DisallowedHost(host.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_targets_always_allowed() {
        let policy = RedirectPolicy::default();
        assert!(policy.check("/login", None).is_ok());
    }

    #[test]
    fn dangerous_schemes_rejected_regardless_of_case() {
        let policy = RedirectPolicy::default();
        for target in ["javascript:alert(1)", "DATA:text/html,x", "File:///etc/passwd"] {
            assert_eq!(
                policy.check(target, None),
                Err(RedirectRejection::DangerousScheme)
            );
        }
    }

    #[test]
    fn same_origin_absolute_target_allowed() {
        let policy = RedirectPolicy::default();
        assert!(policy
            .check("https://example.com/next", Some("example.com"))
            .is_ok());
    }

    #[test]
    fn cross_origin_rejected_without_allow_list() {
        let policy = RedirectPolicy::default();
        assert!(policy.check("https://evil.com/", Some("example.com")).is_err());
    }

    #[test]
    fn cross_origin_allowed_when_listed() {
        let policy = RedirectPolicy {
            allowed_redirect_domains: vec!["partner.example".to_string()],
            allow_open_redirects: false,
        };
        assert!(policy
            .check("https://partner.example/cb", Some("example.com"))
            .is_ok());
    }

    #[test]
    fn open_redirect_opt_in_allows_any_host() {
        let policy = RedirectPolicy {
            allowed_redirect_domains: Vec::new(),
            allow_open_redirects: true,
        };
        assert!(policy.check("https://anywhere.example/", Some("example.com")).is_ok());
    }
}

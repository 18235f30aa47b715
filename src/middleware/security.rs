//! Security headers ("shield"/"helmet"): a set of response headers that opt a page
//! out of a number of default-dangerous browser behaviors (framing, MIME sniffing,
//! unrestricted referrers, cross-origin reads of its resources).
//!
//! Grounded on the teacher's `ripress/src/middlewares/shield/{mod,config}.rs`: the
//! same per-feature config structs and the same header defaults, condensed into one
//! config struct with `Option<T>`-gated sections here rather than the teacher's
//! dozen separate structs, since this crate applies them as one middleware rather
//! than the teacher's composable-plugin shape.

use crate::context::Context;
use crate::error::Error;
use crate::middleware::{mw, Middleware};
use crate::router::Next;

#[derive(Debug, Clone)]
pub struct Hsts {
    pub max_age: u64,
    pub include_subdomains: bool,
    pub preload: bool,
}

impl Default for Hsts {
    fn default() -> Self {
        Hsts {
            max_age: 31_536_000,
            include_subdomains: true,
            preload: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOptions {
    Deny,
    SameOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossOriginPolicy {
    SameOrigin,
    SameSite,
    CrossOrigin,
}

impl CrossOriginPolicy {
    fn header_value(self) -> &'static str {
        match self {
            CrossOriginPolicy::SameOrigin => "same-origin",
            CrossOriginPolicy::SameSite => "same-site",
            CrossOriginPolicy::CrossOrigin => "cross-origin",
        }
    }
}

/// Security headers applied by [`security`]. Every field defaults to the teacher's
/// restrictive defaults; set a field to `None` to omit that header entirely.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub content_security_policy: Option<String>,
    pub hsts: Option<Hsts>,
    pub frame_options: Option<FrameOptions>,
    pub no_sniff: bool,
    pub referrer_policy: Option<String>,
    /// Sent as `X-DNS-Prefetch-Control: on` when true, `off` when false. Browsers
    /// default to prefetching DNS for linked origins; the teacher's restrictive
    /// default turns that off.
    pub allow_dns_prefetch: bool,
    pub ie_no_open: bool,
    pub hide_powered_by: bool,
    pub permissions_policy: Option<String>,
    pub cross_origin_opener_policy: Option<CrossOriginPolicy>,
    pub cross_origin_resource_policy: Option<CrossOriginPolicy>,
    pub origin_agent_cluster: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            content_security_policy: Some(
                "default-src 'self'; script-src 'self'; style-src 'self'; img-src 'self' data: https:; object-src 'none'"
                    .to_string(),
            ),
            hsts: Some(Hsts::default()),
            frame_options: Some(FrameOptions::Deny),
            no_sniff: true,
            referrer_policy: Some("strict-origin-when-cross-origin".to_string()),
            allow_dns_prefetch: false,
            ie_no_open: true,
            hide_powered_by: true,
            permissions_policy: Some(
                "camera=(), microphone=(), geolocation=(), payment=()".to_string(),
            ),
            cross_origin_opener_policy: Some(CrossOriginPolicy::SameOrigin),
            cross_origin_resource_policy: Some(CrossOriginPolicy::SameOrigin),
            origin_agent_cluster: true,
        }
    }
}

/// Builds the security headers middleware. Runs before `next` (unlike compression or
/// caching, these headers don't depend on the response body) and adds every header
/// its config enables.
pub fn security(config: SecurityConfig) -> impl Middleware {
    mw(move |ctx: &mut Context, next: Next| {
        let config = config.clone();
        async move {
            if let Some(csp) = &config.content_security_policy {
                ctx.set_header("content-security-policy", csp)?;
            }
            if let Some(hsts) = &config.hsts {
                let mut value = format!("max-age={}", hsts.max_age);
                if hsts.include_subdomains {
                    value.push_str("; includeSubDomains");
                }
                if hsts.preload {
                    value.push_str("; preload");
                }
                ctx.set_header("strict-transport-security", &value)?;
            }
            if let Some(frame) = config.frame_options {
                let value = match frame {
                    FrameOptions::Deny => "DENY",
                    FrameOptions::SameOrigin => "SAMEORIGIN",
                };
                ctx.set_header("x-frame-options", value)?;
            }
            if config.no_sniff {
                ctx.set_header("x-content-type-options", "nosniff")?;
            }
            if let Some(referrer) = &config.referrer_policy {
                ctx.set_header("referrer-policy", referrer)?;
            }
            ctx.set_header(
                "x-dns-prefetch-control",
                if config.allow_dns_prefetch { "on" } else { "off" },
            )?;
            if config.ie_no_open {
                ctx.set_header("x-download-options", "noopen")?;
            }
            if config.hide_powered_by {
                ctx.response.headers.remove("x-powered-by");
            }
            if let Some(permissions) = &config.permissions_policy {
                ctx.set_header("permissions-policy", permissions)?;
            }
            if let Some(coop) = config.cross_origin_opener_policy {
                ctx.set_header("cross-origin-opener-policy", coop.header_value())?;
            }
            if let Some(corp) = config.cross_origin_resource_policy {
                ctx.set_header("cross-origin-resource-policy", corp.header_value())?;
            }
            if config.origin_agent_cluster {
                ctx.set_header("origin-agent-cluster", "?1")?;
            }
            ctx.set_header("x-permitted-cross-domain-policies", "none")?;

            next.run(ctx).await
        }
    })
}

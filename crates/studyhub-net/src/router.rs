//! Request routing: decides which intercepted requests the worker may cache.

use crate::Request;
use http::Method;
use tracing::trace;

/// Outcome of routing a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The worker handles the request through its fetch strategy.
    Handle,
    /// The request goes to the network untouched; the cache is never consulted.
    Passthrough(PassthroughReason),
}

/// Why a request bypasses the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassthroughReason {
    /// Only GET requests are cacheable.
    NonGetMethod(Method),
    /// The host matched an exclusion pattern.
    ExcludedHost(String),
    /// The URL has no host (e.g. `data:`).
    NoHost,
}

/// Host pattern for exclusions.
#[derive(Debug, Clone)]
pub struct HostPattern {
    /// Pattern type.
    pub pattern_type: PatternType,
    /// Pattern string, compared case-insensitively.
    pub pattern: String,
}

/// Type of host pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    /// Exact host match.
    Exact,
    /// Host ends with the pattern (a domain and its subdomains).
    Suffix,
    /// Host contains the pattern anywhere.
    Contains,
}

impl HostPattern {
    /// Create an exact match pattern.
    pub fn exact(host: &str) -> Self {
        Self {
            pattern_type: PatternType::Exact,
            pattern: host.to_ascii_lowercase(),
        }
    }

    /// Create a suffix match pattern.
    pub fn suffix(suffix: &str) -> Self {
        Self {
            pattern_type: PatternType::Suffix,
            pattern: suffix.to_ascii_lowercase(),
        }
    }

    /// Create a contains pattern.
    pub fn contains(marker: &str) -> Self {
        Self {
            pattern_type: PatternType::Contains,
            pattern: marker.to_ascii_lowercase(),
        }
    }

    /// Check if a host matches this pattern.
    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        match self.pattern_type {
            PatternType::Exact => host == self.pattern,
            PatternType::Suffix => host.ends_with(&self.pattern),
            PatternType::Contains => host.contains(&self.pattern),
        }
    }
}

/// Classifies requests by method and host.
#[derive(Debug, Clone, Default)]
pub struct RequestRouter {
    exclusions: Vec<HostPattern>,
}

impl RequestRouter {
    /// Create a router without exclusions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a router excluding every host that contains one of `markers`.
    pub fn from_markers<S: AsRef<str>>(markers: &[S]) -> Self {
        let mut router = Self::new();
        for marker in markers {
            router.exclude(HostPattern::contains(marker.as_ref()));
        }
        router
    }

    /// Add an exclusion.
    pub fn exclude(&mut self, pattern: HostPattern) {
        self.exclusions.push(pattern);
    }

    /// Route a request.
    pub fn route(&self, request: &Request) -> Route {
        if request.method != Method::GET {
            trace!(url = %request.url, method = %request.method, "Passthrough: not a GET");
            return Route::Passthrough(PassthroughReason::NonGetMethod(request.method.clone()));
        }

        let Some(host) = request.url.host_str() else {
            trace!(url = %request.url, "Passthrough: no host");
            return Route::Passthrough(PassthroughReason::NoHost);
        };

        if let Some(pattern) = self.exclusions.iter().find(|p| p.matches(host)) {
            trace!(url = %request.url, pattern = %pattern.pattern, "Passthrough: excluded host");
            return Route::Passthrough(PassthroughReason::ExcludedHost(host.to_string()));
        }

        trace!(url = %request.url, "Handled by worker");
        Route::Handle
    }
}

//! URL routing
//!
//! Maps a request URL to a configured backend. Routes are evaluated in the
//! order they were declared and the first match wins. Matching runs against
//! the normalized form of the URL, see [`normalize`].

use crate::config::{Backend, Config, MatchOptions, QueryParams, RoutePattern, TrailingSlash};
use crate::error::RouteError;
use url::Url;

/// Port implied by the gemini scheme
pub const DEFAULT_PORT: u16 = 1965;

/// Normalize a URL according to the match options.
///
/// Drops the fragment (and the query unless `query_params = "include"`),
/// lowercases the host, strips the default port and applies the
/// trailing-slash policy. Normalizing an already normalized URL is a no-op.
pub fn normalize(url: &Url, options: &MatchOptions) -> Url {
    let mut url = url.clone();

    url.set_fragment(None);
    if options.query_params == QueryParams::Remove {
        url.set_query(None);
    }

    if let Some(host) = url.host_str() {
        if host.bytes().any(|b| b.is_ascii_uppercase()) {
            let lower = host.to_ascii_lowercase();
            let _ = url.set_host(Some(&lower));
        }
    }

    if url.port() == Some(DEFAULT_PORT) {
        let _ = url.set_port(None);
    }

    match options.trailing_slash {
        TrailingSlash::Ensure => {
            if !url.path().ends_with('/') {
                let path = format!("{}/", url.path());
                url.set_path(&path);
            }
        }
        TrailingSlash::Remove => {
            if url.path().ends_with('/') {
                let path = url.path().trim_end_matches('/').to_string();
                url.set_path(&path);
            }
        }
        TrailingSlash::IfPresent => {}
    }

    url
}

/// A compiled route
#[derive(Debug, Clone)]
pub struct Route {
    pub pattern: RoutePattern,
    pub backend: String,
}

/// Result of a successful lookup
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub backend: &'a Backend,
    /// Remainder of the path not consumed by the route, without leading slash
    pub unmatched: String,
    /// The normalized URL the route was matched against
    pub url: Url,
}

/// Immutable routing table shared by all connections
#[derive(Debug, Clone)]
pub struct Router {
    routes: Vec<Route>,
    backends: Vec<Backend>,
    options: MatchOptions,
}

impl Router {
    pub fn new(routes: Vec<Route>, backends: Vec<Backend>, options: MatchOptions) -> Self {
        Self {
            routes,
            backends,
            options,
        }
    }

    /// Build the routing table from a validated configuration
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let routes = config
            .routes
            .iter()
            .map(|route| {
                let pattern = route.pattern().map_err(|e| anyhow::anyhow!(e))?;
                Ok(Route {
                    pattern,
                    backend: route.backend.clone(),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self::new(
            routes,
            config.backends.clone(),
            config.match_options.clone(),
        ))
    }

    pub fn options(&self) -> &MatchOptions {
        &self.options
    }

    /// Find the backend for a URL and the part of its path left unmatched
    pub fn resolve(&self, url: &Url) -> Result<RouteMatch<'_>, RouteError> {
        let normalized = normalize(url, &self.options);

        let Some((route, unmatched)) = self
            .routes
            .iter()
            .find_map(|route| matches(&route.pattern, &normalized).map(|rest| (route, rest)))
        else {
            return Err(RouteError::NoRoute(normalized.to_string()));
        };

        let backend = self
            .backends
            .iter()
            .find(|b| b.name == route.backend)
            .ok_or_else(|| RouteError::UnknownBackend(route.backend.clone()))?;

        Ok(RouteMatch {
            backend,
            unmatched,
            url: normalized,
        })
    }
}

/// Test a single pattern against a normalized URL, returning the unmatched
/// path remainder on success.
fn matches(pattern: &RoutePattern, url: &Url) -> Option<String> {
    match pattern {
        RoutePattern::Hostname(hostname) => {
            let host = url.host_str()?;
            if !host.eq_ignore_ascii_case(hostname) {
                return None;
            }
            Some(strip_leading_slash(url.path()).to_string())
        }
        RoutePattern::Prefix(prefix) => {
            let rest = url.as_str().strip_prefix(prefix.as_str())?;
            let path = rest.split(['?', '#']).next().unwrap_or_default();
            Some(strip_leading_slash(path).to_string())
        }
        RoutePattern::Url(exact) => (url.as_str() == exact).then(String::new),
    }
}

fn strip_leading_slash(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

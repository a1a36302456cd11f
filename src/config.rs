use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Scheme prepended to prefix and URL route patterns that lack one
pub const GEMINI_SCHEME_PREFIX: &str = "gemini://";

/// Global configuration for the server
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener and timeout settings
    #[serde(default)]
    pub server: ServerConfig,

    /// URL normalization applied before routing
    #[serde(default)]
    pub match_options: MatchOptions,

    /// Extension to MIME type mapping for static files
    #[serde(default)]
    pub content_types: ContentTypes,

    /// Routes, evaluated in declaration order
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Named backends referenced by routes
    #[serde(default)]
    pub backends: Vec<Backend>,

    /// Certificate/key pairs (PEM)
    #[serde(default)]
    pub certs: Vec<CertConfig>,

    /// Upstreams for passthrough mode
    #[serde(default)]
    pub upstreams: Vec<Upstream>,

    /// Hostname to upstream associations for passthrough mode
    #[serde(default)]
    pub sni_routes: Vec<SniRoute>,
}

/// Operating mode of the listener
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Terminate TLS and serve Gemini requests (default)
    #[default]
    Serve,
    /// Forward TLS connections to upstreams selected by SNI
    Passthrough,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen address (default: 127.0.0.1:1965)
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Serve Gemini requests or pass TLS connections through
    #[serde(default)]
    pub mode: Mode,

    /// Wall-clock limit for a whole connection in seconds (default: 30)
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum runtime of a CGI script in seconds (default: 10)
    #[serde(default = "default_cgi_timeout")]
    pub cgi_timeout_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL for CGI scripts
    #[serde(default = "default_cgi_grace_period")]
    pub cgi_grace_period_secs: u64,

    /// Time allowed for a passthrough client to send its ClientHello
    #[serde(default = "default_client_hello_timeout")]
    pub client_hello_timeout_secs: u64,

    /// Reject requests whose URL hostname differs from the TLS server name
    #[serde(default = "default_true")]
    pub require_sni_match: bool,
}

impl ServerConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn cgi_timeout(&self) -> Duration {
        Duration::from_secs(self.cgi_timeout_secs)
    }

    pub fn cgi_grace_period(&self) -> Duration {
        Duration::from_secs(self.cgi_grace_period_secs)
    }

    pub fn client_hello_timeout(&self) -> Duration {
        Duration::from_secs(self.client_hello_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            mode: Mode::default(),
            connection_timeout_secs: default_connection_timeout(),
            cgi_timeout_secs: default_cgi_timeout(),
            cgi_grace_period_secs: default_cgi_grace_period(),
            client_hello_timeout_secs: default_client_hello_timeout(),
            require_sni_match: true,
        }
    }
}

/// Whether query strings take part in route matching
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueryParams {
    /// Drop the query before matching (default)
    #[default]
    Remove,
    /// Keep the query as part of the matched URL
    Include,
}

/// Trailing slash handling applied to the URL path before matching
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrailingSlash {
    /// Always end the path with a slash (default)
    #[default]
    Ensure,
    /// Never end the path with a slash
    Remove,
    /// Leave the path as requested
    #[serde(alias = "if-present")]
    IfPresent,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct MatchOptions {
    #[serde(default)]
    pub query_params: QueryParams,

    #[serde(default)]
    pub trailing_slash: TrailingSlash,

    /// Extensions tried, in order, when a static file is not found as named
    #[serde(default = "default_exts")]
    pub default_exts: Vec<String>,

    /// File served when a static request resolves to a directory
    #[serde(default = "default_index_filename")]
    pub index_filename: String,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            query_params: QueryParams::default(),
            trailing_slash: TrailingSlash::default(),
            default_exts: default_exts(),
            index_filename: default_index_filename(),
        }
    }
}

/// Built-in extension mappings; entries in `ext_map` take precedence
const BUILTIN_CONTENT_TYPES: &[(&str, &str)] = &[
    ("gmi", "text/gemini"),
    ("gemini", "text/gemini"),
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("html", "text/html"),
    ("css", "text/css"),
    ("xml", "application/xml"),
    ("json", "application/json"),
    ("pdf", "application/pdf"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("webp", "image/webp"),
    ("mp3", "audio/mpeg"),
    ("ogg", "audio/ogg"),
];

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ContentTypes {
    /// Content type for files whose extension is not mapped
    #[serde(default = "default_content_type")]
    pub default: String,

    /// Extension (without the dot) to MIME type
    #[serde(default)]
    pub ext_map: HashMap<String, String>,
}

impl ContentTypes {
    /// Content type for a file, based on its extension
    pub fn for_path(&self, path: &Path) -> &str {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return &self.default;
        };

        if let Some(content_type) = self.ext_map.get(ext) {
            return content_type;
        }

        let ext = ext.to_ascii_lowercase();
        BUILTIN_CONTENT_TYPES
            .iter()
            .find(|(known, _)| *known == ext)
            .map(|(_, content_type)| *content_type)
            .unwrap_or(self.default.as_str())
    }
}

impl Default for ContentTypes {
    fn default() -> Self {
        Self {
            default: default_content_type(),
            ext_map: HashMap::new(),
        }
    }
}

/// A route as written in the configuration file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RouteConfig {
    /// Exact hostname match
    pub hostname: Option<String>,

    /// String prefix of the normalized URL
    pub prefix: Option<String>,

    /// Exact normalized URL match
    pub url: Option<String>,

    /// Name of the backend handling matched requests
    #[serde(default)]
    pub backend: String,
}

/// The single pattern a route matches with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePattern {
    Hostname(String),
    Prefix(String),
    Url(String),
}

impl RouteConfig {
    pub fn hostname(hostname: &str, backend: &str) -> Self {
        Self {
            hostname: Some(hostname.to_string()),
            backend: backend.to_string(),
            ..Default::default()
        }
    }

    pub fn prefix(prefix: &str, backend: &str) -> Self {
        Self {
            prefix: Some(prefix.to_string()),
            backend: backend.to_string(),
            ..Default::default()
        }
    }

    pub fn url(url: &str, backend: &str) -> Self {
        Self {
            url: Some(url.to_string()),
            backend: backend.to_string(),
            ..Default::default()
        }
    }

    /// Resolve the configured fields into exactly one pattern.
    ///
    /// Prefix and URL patterns without a scheme get `gemini://` prepended,
    /// and their host is lowercased to match normalized request URLs.
    pub fn pattern(&self) -> Result<RoutePattern, String> {
        match (
            non_empty(&self.hostname),
            non_empty(&self.prefix),
            non_empty(&self.url),
        ) {
            (Some(hostname), None, None) => Ok(RoutePattern::Hostname(hostname.to_ascii_lowercase())),
            (None, Some(prefix), None) => Ok(RoutePattern::Prefix(url_pattern(prefix))),
            (None, None, Some(url)) => Ok(RoutePattern::Url(url_pattern(url))),
            (None, None, None) => Err(format!(
                "Route to backend '{}' has no pattern (set one of hostname, prefix or url)",
                self.backend
            )),
            _ => Err(format!(
                "Route to backend '{}' has multiple patterns; use only one of hostname, prefix or url",
                self.backend
            )),
        }
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|v| !v.is_empty())
}

fn url_pattern(pattern: &str) -> String {
    let rest = pattern.strip_prefix(GEMINI_SCHEME_PREFIX).unwrap_or(pattern);
    let host_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (host, tail) = rest.split_at(host_end);
    format!("{}{}{}", GEMINI_SCHEME_PREFIX, host.to_ascii_lowercase(), tail)
}

/// Policy for file extensions in static URLs
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileExtPolicy {
    /// URLs may omit the extension; default extensions are tried (default)
    #[default]
    Strip,
    /// URLs name files exactly, extension included
    Include,
}

/// Backend type and its type-specific settings
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendKind {
    /// Files served from a directory
    Static {
        location: PathBuf,
        #[serde(default)]
        file_ext: FileExtPolicy,
    },
    /// A script executed per request
    Cgi { script: PathBuf },
}

/// Configuration for a single backend
///
/// # Security Warning
///
/// CGI backends execute the configured script for every matching request.
/// Configuration files must be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Backend {
    /// Unique name referenced by routes
    pub name: String,

    #[serde(flatten)]
    pub kind: BackendKind,
}

impl Backend {
    /// Create a static backend config with defaults
    pub fn static_files(name: &str, location: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            kind: BackendKind::Static {
                location: location.into(),
                file_ext: FileExtPolicy::default(),
            },
        }
    }

    /// Create a CGI backend config
    pub fn cgi(name: &str, script: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            kind: BackendKind::Cgi {
                script: script.into(),
            },
        }
    }

    /// Backend type name, as used in configuration and logs
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            BackendKind::Static { .. } => "static",
            BackendKind::Cgi { .. } => "cgi",
        }
    }

    /// Validate the backend configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Backend has no name".to_string());
        }

        match &self.kind {
            BackendKind::Static { location, .. } => {
                if location.as_os_str().is_empty() {
                    return Err(format!(
                        "Backend '{}': static backend requires 'location' field",
                        self.name
                    ));
                }
            }
            BackendKind::Cgi { script } => {
                if script.as_os_str().is_empty() {
                    return Err(format!(
                        "Backend '{}': cgi backend requires 'script' field",
                        self.name
                    ));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct CertConfig {
    /// Path to the certificate chain (PEM)
    #[serde(default)]
    pub cert: String,

    /// Path to the private key (PEM)
    #[serde(default)]
    pub key: String,
}

/// A passthrough target
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// Unique name referenced by SNI routes
    pub name: String,

    /// Address to dial, e.g. "10.0.0.5:1965"
    pub address: String,

    /// Whether the upstream terminates TLS itself (default: true)
    #[serde(default = "default_true")]
    pub tls: bool,
}

/// Associates a hostname with an upstream in passthrough mode
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SniRoute {
    pub hostname: String,
    pub upstream: String,
}

// Default value functions
fn default_listen() -> String {
    "127.0.0.1:1965".to_string()
}

fn default_connection_timeout() -> u64 {
    30 // matches common Gemini client patience
}

fn default_cgi_timeout() -> u64 {
    10
}

fn default_cgi_grace_period() -> u64 {
    5 // between SIGTERM and SIGKILL
}

fn default_client_hello_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_exts() -> Vec<String> {
    vec!["gmi".to_string()]
}

fn default_index_filename() -> String {
    "index.gmi".to_string()
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a backend by name
    pub fn backend(&self, name: &str) -> Option<&Backend> {
        self.backends.iter().find(|b| b.name == name)
    }

    /// Look up an upstream by name
    pub fn upstream(&self, name: &str) -> Option<&Upstream> {
        self.upstreams.iter().find(|u| u.name == name)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.match_options.index_filename.is_empty() {
            errors.push("'index_filename' must not be empty".to_string());
        }

        for (field, value) in [
            ("connection_timeout_secs", self.server.connection_timeout_secs),
            ("cgi_timeout_secs", self.server.cgi_timeout_secs),
            ("client_hello_timeout_secs", self.server.client_hello_timeout_secs),
        ] {
            if value == 0 {
                errors.push(format!("'{}' must be greater than 0", field));
            }
        }

        let mut names = HashSet::new();
        for backend in &self.backends {
            if let Err(e) = backend.validate() {
                errors.push(e);
            }
            if !backend.name.is_empty() && !names.insert(backend.name.as_str()) {
                errors.push(format!("Duplicate backend name '{}'", backend.name));
            }
        }

        for route in &self.routes {
            if let Err(e) = route.pattern() {
                errors.push(e);
            }
            if route.backend.is_empty() {
                errors.push("Empty backend name in routes".to_string());
            } else if self.backend(&route.backend).is_none() {
                errors.push(format!("Invalid backend in route: {}", route.backend));
            }
        }

        match self.server.mode {
            Mode::Serve => {
                if self.certs.is_empty() {
                    errors.push("No certificates configured".to_string());
                }
                for cert in &self.certs {
                    if cert.cert.is_empty() {
                        errors.push("Cert file missing".to_string());
                    }
                    if cert.key.is_empty() {
                        errors.push("Key file missing".to_string());
                    }
                }
            }
            Mode::Passthrough => self.validate_passthrough(&mut errors),
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    fn validate_passthrough(&self, errors: &mut Vec<String>) {
        if self.sni_routes.is_empty() {
            errors.push("Passthrough mode requires at least one entry in 'sni_routes'".to_string());
        }

        let mut names = HashSet::new();
        for upstream in &self.upstreams {
            if upstream.name.is_empty() {
                errors.push("Upstream has no name".to_string());
            } else if !names.insert(upstream.name.as_str()) {
                errors.push(format!("Duplicate upstream name '{}'", upstream.name));
            }
            if upstream.address.is_empty() {
                errors.push(format!("Upstream '{}': 'address' is required", upstream.name));
            }
            if !upstream.tls {
                errors.push(format!(
                    "Upstream '{}': passthrough forwards TLS unchanged, so 'tls' cannot be false",
                    upstream.name
                ));
            }
        }

        let mut hostnames = HashSet::new();
        for route in &self.sni_routes {
            if route.hostname.is_empty() {
                errors.push("SNI route has no hostname".to_string());
            } else if !hostnames.insert(route.hostname.to_ascii_lowercase()) {
                errors.push(format!("Duplicate SNI route for '{}'", route.hostname));
            }
            if self.upstream(&route.upstream).is_none() {
                errors.push(format!("Invalid upstream in SNI route: {}", route.upstream));
            }
        }
    }
}

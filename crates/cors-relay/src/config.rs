//! Configuration types and loading logic.

use std::collections::BTreeMap;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use relay_tracing::TracingConfig;
use serde::Deserialize;

/// Top-level relay configuration. Read once at startup and never mutated.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

/// Server listen configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// How long in-flight relays may keep running after a shutdown signal.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

/// Cross-origin headers injected into every response.
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_allow_origin")]
    pub allow_origin: String,

    #[serde(default = "default_allow_methods")]
    pub allow_methods: String,

    #[serde(default = "default_allow_headers")]
    pub allow_headers: String,

    #[serde(default = "default_expose_headers")]
    pub expose_headers: String,

    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

/// Destination host policy.
///
/// A non-empty `allowed_hosts` wins over `denied_hosts`. Emptying both turns the
/// relay into an open proxy.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    #[serde(default = "default_denied_hosts")]
    pub denied_hosts: Vec<String>,
}

/// Where the target URL is looked for on the inbound request.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    /// Header carrying the target URL. Takes precedence over the path.
    #[serde(default = "default_target_header")]
    pub header: String,

    /// Query parameter carrying the target URL on requests to `/`.
    #[serde(default = "default_target_query_param")]
    pub query_param: String,
}

/// Outbound hop to the final destination.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    /// Bound on waiting for response headers and on body inactivity.
    #[serde(default = "default_forward_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Sent when the caller did not supply a `User-Agent`.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Rewrite relative redirect locations into relay URLs.
    #[serde(default = "default_true")]
    pub rewrite_redirects: bool,
}

/// Optional resolver hop that exchanges an identifier for a destination URL.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Lookup endpoint, e.g. `https://resolver.example/lookup`.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Query parameter on the endpoint that receives the encoded internal target.
    #[serde(default = "default_resolver_query_param")]
    pub query_param: String,

    /// Prepended to the identifier to form the internal target.
    #[serde(default)]
    pub target_prefix: String,

    /// Headers sent to the resolver. `referer` and `origin` from this set are
    /// also sent on the follow-up fetch of the resolved URL.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default = "default_resolver_timeout")]
    pub timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_allow_origin() -> String {
    "*".to_string()
}

fn default_allow_methods() -> String {
    "GET,HEAD,POST,PUT,PATCH,DELETE,OPTIONS".to_string()
}

fn default_allow_headers() -> String {
    "Range,Content-Type,Authorization".to_string()
}

fn default_expose_headers() -> String {
    "Content-Length,Content-Range,Accept-Ranges,Content-Type".to_string()
}

fn default_max_age() -> u64 {
    86400
}

fn default_denied_hosts() -> Vec<String> {
    let mut hosts: Vec<String> = ["127.", "10.", "192.168.", "169.254."]
        .iter()
        .map(|p| p.to_string())
        .collect();
    hosts.extend((16..=31).map(|octet| format!("172.{octet}.")));
    hosts.extend(["localhost", "::1", "0.0.0.0"].iter().map(|h| h.to_string()));
    hosts
}

fn default_target_header() -> String {
    "x-target-url".to_string()
}

fn default_target_query_param() -> String {
    "url".to_string()
}

fn default_forward_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    concat!("cors-relay/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_true() -> bool {
    true
}

fn default_resolver_query_param() -> String {
    "url".to_string()
}

fn default_resolver_timeout() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origin: default_allow_origin(),
            allow_methods: default_allow_methods(),
            allow_headers: default_allow_headers(),
            expose_headers: default_expose_headers(),
            max_age_secs: default_max_age(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            denied_hosts: default_denied_hosts(),
        }
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            header: default_target_header(),
            query_param: default_target_query_param(),
        }
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_forward_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            user_agent: default_user_agent(),
            rewrite_redirects: true,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            query_param: default_resolver_query_param(),
            target_prefix: String::new(),
            headers: BTreeMap::new(),
            timeout_secs: default_resolver_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ForwardConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ResolverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RelayConfig {
    /// Load configuration from TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. `PORT`, `ALLOW_ORIGIN`, `ALLOWED_TARGET_HOSTS`
    /// 2. Environment variables (RELAY_ prefix, __ for nesting)
    /// 3. TOML config file
    /// 4. Defaults
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let mut config: RelayConfig = Figment::new()
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("RELAY_").split("__"))
            .extract()?;

        if let Ok(port) = std::env::var("PORT") {
            config.server.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid PORT {port:?}: {e}"))?;
        }
        if let Ok(origin) = std::env::var("ALLOW_ORIGIN") {
            config.cors.allow_origin = origin;
        }
        if let Ok(hosts) = std::env::var("ALLOWED_TARGET_HOSTS") {
            config.policy.allowed_hosts = parse_host_list(&hosts);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot serve requests.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.resolver.enabled && self.resolver.endpoint.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("resolver.enabled is set but resolver.endpoint is empty");
        }
        if self.extract.query_param.is_empty() {
            anyhow::bail!("extract.query_param must not be empty");
        }
        Ok(())
    }
}

/// Split a comma-separated host list, dropping blanks.
fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

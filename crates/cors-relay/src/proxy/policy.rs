//! Destination host policy. Runs before any outbound connection, for both
//! direct targets and resolver output.

use url::{Host, Url};

use crate::config::PolicyConfig;
use crate::error::RelayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPolicy {
    /// Only these hosts (lowercase, exact) may be fetched.
    AllowList(Vec<String>),
    /// Anything except hosts matching these rules.
    DenyList(Vec<DenyRule>),
    /// Every host passes. Unsafe outside local development.
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyRule {
    Prefix(String),
    Exact(String),
}

impl DenyRule {
    /// Entries ending in `.` or `:` are address prefixes and only match IP
    /// literals; anything else matches the host exactly.
    fn parse(raw: &str) -> Self {
        let entry = raw.trim().to_ascii_lowercase();
        if entry.ends_with('.') || entry.ends_with(':') {
            DenyRule::Prefix(entry)
        } else {
            DenyRule::Exact(entry)
        }
    }

    fn matches(&self, host: &str, is_ip: bool) -> bool {
        match self {
            DenyRule::Prefix(prefix) => is_ip && host.starts_with(prefix.as_str()),
            DenyRule::Exact(exact) => host == exact,
        }
    }
}

impl HostPolicy {
    pub fn from_config(config: &PolicyConfig) -> Self {
        let allowed: Vec<String> = config
            .allowed_hosts
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if !allowed.is_empty() {
            return HostPolicy::AllowList(allowed);
        }

        let denied: Vec<DenyRule> = config
            .denied_hosts
            .iter()
            .filter(|h| !h.trim().is_empty())
            .map(|h| DenyRule::parse(h))
            .collect();
        if !denied.is_empty() {
            return HostPolicy::DenyList(denied);
        }

        HostPolicy::Open
    }

    pub fn describe(&self) -> &'static str {
        match self {
            HostPolicy::AllowList(_) => "allow-list",
            HostPolicy::DenyList(_) => "deny-list",
            HostPolicy::Open => "open",
        }
    }

    /// Reject `url` unless its host is permitted.
    pub fn check(&self, url: &Url) -> Result<(), RelayError> {
        let host = normalized_host(url)
            .ok_or_else(|| RelayError::MalformedTarget(format!("{url} has no host")))?;

        let is_ip = matches!(url.host(), Some(Host::Ipv4(_) | Host::Ipv6(_)));

        let permitted = match self {
            HostPolicy::AllowList(allowed) => allowed.iter().any(|h| *h == host),
            HostPolicy::DenyList(rules) => !rules.iter().any(|rule| rule.matches(&host, is_ip)),
            HostPolicy::Open => true,
        };

        if permitted {
            Ok(())
        } else {
            Err(RelayError::ForbiddenTarget(host))
        }
    }
}

/// Lowercase host without IPv6 brackets or a trailing root dot. IPv4-mapped
/// IPv6 addresses are reported in their IPv4 form.
fn normalized_host(url: &Url) -> Option<String> {
    if let Some(Host::Ipv6(addr)) = url.host() {
        if let Some(v4) = addr.to_ipv4_mapped() {
            return Some(v4.to_string());
        }
    }
    let host = url.host_str()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

//! Resolver hop: exchanges an opaque identifier (a channel name, a manifest
//! path) for a concrete, usually short-lived, destination URL.
//!
//! The lookup is a single GET with a fixed browser-like header set. It is
//! never retried: a failing resolver fails the request.

use std::time::{Duration, Instant};

use axum::http::header::{ORIGIN, REFERER};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tracing::Instrument;
use url::Url;

use crate::config::ResolverConfig;
use crate::error::RelayError;
use crate::proxy::forward::error_chain;

/// Resolver answers larger than this are not URLs.
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// How much of an unusable resolver body is echoed into errors and logs.
const BODY_EXCERPT_CHARS: usize = 256;

#[derive(Clone)]
pub struct Resolver {
    client: reqwest::Client,
    endpoint: String,
    query_param: String,
    target_prefix: String,
    headers: HeaderMap,
    forward_headers: HeaderMap,
    timeout: Duration,
}

impl Resolver {
    /// `None` when the resolver hop is disabled.
    pub fn from_config(config: &ResolverConfig) -> anyhow::Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let endpoint = config
            .endpoint
            .clone()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| anyhow::anyhow!("resolver.endpoint is required when the resolver is enabled"))?;
        Url::parse(&endpoint)
            .map_err(|e| anyhow::anyhow!("invalid resolver.endpoint {endpoint:?}: {e}"))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
                .map_err(|e| anyhow::anyhow!("invalid resolver header name {name:?}: {e}"))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| anyhow::anyhow!("invalid value for resolver header {name}: {e}"))?;
            headers.insert(name, value);
        }

        // The final CDN usually checks the same caller identity as the resolver.
        let mut forward_headers = HeaderMap::new();
        for name in [REFERER, ORIGIN] {
            if let Some(value) = headers.get(&name) {
                forward_headers.insert(name, value.clone());
            }
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .no_proxy()
            .build()?;

        Ok(Some(Self {
            client,
            endpoint,
            query_param: config.query_param.clone(),
            target_prefix: config.target_prefix.clone(),
            headers,
            forward_headers,
            timeout: config.timeout(),
        }))
    }

    /// Headers the follow-up fetch of a resolved URL must carry.
    pub fn forward_headers(&self) -> &HeaderMap {
        &self.forward_headers
    }

    /// `<endpoint>?<param>=<percent-encoded prefix + identifier>`.
    pub fn lookup_url(&self, identifier: &str) -> String {
        let internal_target = format!("{}{}", self.target_prefix, identifier);
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{}{}{}={}",
            self.endpoint,
            separator,
            self.query_param,
            urlencoding::encode(&internal_target)
        )
    }

    pub async fn resolve(&self, identifier: &str, request_id: &str) -> Result<Url, RelayError> {
        let span = relay_tracing::resolver_span!(request_id, identifier);
        let start = Instant::now();
        let lookup = self.lookup_url(identifier);

        async {
            tracing::debug!(lookup = %lookup, "Resolving destination");

            let outcome = tokio::time::timeout(self.timeout, self.fetch(&lookup)).await;

            let latency = start.elapsed().as_millis() as u64;
            tracing::Span::current().record("latency_ms", latency);

            let (status, body) = match outcome {
                Err(_) => {
                    tracing::warn!(latency_ms = latency, "Resolver timed out");
                    return Err(RelayError::ResolverTimeout(self.timeout.as_secs()));
                }
                Ok(Err(e)) if e.is_timeout() => {
                    tracing::warn!(error = %e, latency_ms = latency, "Resolver timed out");
                    return Err(RelayError::ResolverTimeout(self.timeout.as_secs()));
                }
                Ok(Err(e)) => {
                    let detail = error_chain(&e);
                    tracing::warn!(error = %detail, latency_ms = latency, "Resolver unreachable");
                    return Err(RelayError::ResolverConnect(detail));
                }
                Ok(Ok(answer)) => answer,
            };

            tracing::Span::current().record("status", status.as_u16());

            if status != StatusCode::OK {
                tracing::warn!(status = status.as_u16(), latency_ms = latency, "Resolver rejected lookup");
                return Err(RelayError::ResolverUpstream {
                    status: status.as_u16(),
                    body: excerpt(&body),
                });
            }

            let destination = parse_destination(&body)?;
            tracing::info!(destination = %destination, latency_ms = latency, "Destination resolved");
            Ok(destination)
        }
        .instrument(span)
        .await
    }

    /// GET the lookup URL and read a bounded body.
    async fn fetch(&self, lookup: &str) -> Result<(StatusCode, String), reqwest::Error> {
        let mut response = self
            .client
            .get(lookup)
            .headers(self.headers.clone())
            .send()
            .await?;
        let status = response.status();

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let room = MAX_RESPONSE_BYTES.saturating_sub(body.len());
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() >= MAX_RESPONSE_BYTES {
                break;
            }
        }
        Ok((status, String::from_utf8_lossy(&body).into_owned()))
    }
}

/// Validate a resolver answer: the trimmed body must be an absolute http(s) URL.
pub fn parse_destination(body: &str) -> Result<Url, RelayError> {
    let candidate = body.trim();
    if !candidate.starts_with("http") {
        return Err(RelayError::ResolverInvalidResponse(excerpt(candidate)));
    }
    match Url::parse(candidate) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => Ok(url),
        _ => Err(RelayError::ResolverInvalidResponse(excerpt(candidate))),
    }
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(BODY_EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn resolver(endpoint: &str, prefix: &str) -> Resolver {
        let mut headers = BTreeMap::new();
        headers.insert("Referer".to_string(), "https://player.example/".to_string());
        headers.insert("user-agent".to_string(), "Mozilla/5.0".to_string());
        let config = ResolverConfig {
            enabled: true,
            endpoint: Some(endpoint.to_string()),
            target_prefix: prefix.to_string(),
            headers,
            ..ResolverConfig::default()
        };
        Resolver::from_config(&config).unwrap().unwrap()
    }

    #[test]
    fn test_disabled_resolver_is_none() {
        assert!(Resolver::from_config(&ResolverConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_enabled_resolver_needs_valid_endpoint() {
        let config = ResolverConfig {
            enabled: true,
            endpoint: Some("not a url".to_string()),
            ..ResolverConfig::default()
        };
        assert!(Resolver::from_config(&config).is_err());
    }

    #[test]
    fn test_lookup_url_percent_encodes_internal_target() {
        let r = resolver("https://resolver.example/lookup", "");
        assert_eq!(
            r.lookup_url("channel123/output/manifest.mpd"),
            "https://resolver.example/lookup?url=channel123%2Foutput%2Fmanifest.mpd"
        );
    }

    #[test]
    fn test_lookup_url_with_prefix_and_existing_query() {
        let r = resolver("https://resolver.example/lookup?v=2", "https://origin.example/live/");
        assert_eq!(
            r.lookup_url("ch 1/index.m3u8"),
            "https://resolver.example/lookup?v=2&url=https%3A%2F%2Forigin.example%2Flive%2Fch%201%2Findex.m3u8"
        );
    }

    #[test]
    fn test_forward_headers_keep_only_referer_and_origin() {
        let r = resolver("https://resolver.example/lookup", "");
        assert_eq!(r.forward_headers()[REFERER], "https://player.example/");
        assert!(!r.forward_headers().contains_key("user-agent"));
    }

    #[test]
    fn test_parse_destination_trims_whitespace() {
        let url = parse_destination("  https://cdn.example.net/abc.mpd\n").unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.net/abc.mpd");
    }

    #[test]
    fn test_parse_destination_rejects_non_urls() {
        for body in ["", "error: channel offline", "ftp://cdn.example.net/a", "http//broken", "https://"] {
            assert!(
                matches!(parse_destination(body), Err(RelayError::ResolverInvalidResponse(_))),
                "{body:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_excerpt_truncates_long_bodies() {
        let long = "x".repeat(1000);
        let cut = excerpt(&long);
        assert_eq!(cut.len(), BODY_EXCERPT_CHARS + 3);
        assert!(cut.ends_with("..."));
    }
}

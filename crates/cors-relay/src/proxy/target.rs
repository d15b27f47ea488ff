//! Target extraction: turns the inbound request line and headers into a
//! destination URL or a resolver identifier.
//!
//! Lookup order is the target header, then the path (with its query string),
//! then the `url` query parameter on requests to `/`.

use axum::http::{HeaderMap, HeaderName, Uri};
use url::Url;

use crate::config::ExtractConfig;
use crate::error::RelayError;

/// What the caller asked the relay to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// An absolute http(s) URL, fetched as-is once it passes the host policy.
    Direct(Url),
    /// An opaque identifier that must be exchanged through the resolver first.
    Identifier(String),
}

#[derive(Debug, Clone)]
pub struct TargetExtractor {
    header: HeaderName,
    query_param: String,
    resolver_enabled: bool,
}

impl TargetExtractor {
    pub fn new(config: &ExtractConfig, resolver_enabled: bool) -> anyhow::Result<Self> {
        let header = HeaderName::from_bytes(config.header.to_ascii_lowercase().as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid extract.header {:?}: {e}", config.header))?;
        Ok(Self {
            header,
            query_param: config.query_param.clone(),
            resolver_enabled,
        })
    }

    /// `GET /` with nothing to relay: served as the informational page.
    pub fn is_bare_root(&self, uri: &Uri, headers: &HeaderMap) -> bool {
        uri.path() == "/" && uri.query().is_none() && !headers.contains_key(&self.header)
    }

    pub fn extract(&self, uri: &Uri, headers: &HeaderMap) -> Result<Target, RelayError> {
        let candidate = self.candidate(uri, headers)?;
        self.classify(candidate.trim())
    }

    fn candidate(&self, uri: &Uri, headers: &HeaderMap) -> Result<String, RelayError> {
        if let Some(value) = headers.get(&self.header) {
            let raw = value
                .to_str()
                .map_err(|_| RelayError::MalformedTarget("non-ASCII target header".to_string()))?;
            if !raw.trim().is_empty() {
                return decode_once(raw.trim());
            }
        }

        let path = uri.path().strip_prefix('/').unwrap_or(uri.path());
        if !path.is_empty() {
            let raw = match uri.query() {
                Some(query) => format!("{path}?{query}"),
                None => path.to_string(),
            };
            return decode_once(&raw);
        }

        uri.query()
            .and_then(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .find(|(key, _)| key == self.query_param.as_str())
                    .map(|(_, value)| value.into_owned())
            })
            .filter(|value| !value.trim().is_empty())
            .ok_or(RelayError::MissingTarget)
    }

    fn classify(&self, candidate: &str) -> Result<Target, RelayError> {
        if candidate.is_empty() {
            return Err(RelayError::MissingTarget);
        }

        if let Ok(url) = Url::parse(candidate) {
            if matches!(url.scheme(), "http" | "https") {
                return match url.host_str() {
                    Some(host) if !host.is_empty() => Ok(Target::Direct(url)),
                    _ => Err(RelayError::MalformedTarget(candidate.to_string())),
                };
            }
        }

        if self.resolver_enabled && is_identifier(candidate) {
            return Ok(Target::Identifier(candidate.to_string()));
        }

        Err(RelayError::MalformedTarget(candidate.to_string()))
    }
}

/// Percent-decode `raw` a single time when it looks encoded.
///
/// A value that already starts with a literal scheme is left alone so the
/// target's own query escapes survive.
fn decode_once(raw: &str) -> Result<String, RelayError> {
    let lower = raw.get(..8).unwrap_or(raw).to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") || !has_percent_escape(raw) {
        return Ok(raw.to_string());
    }
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| RelayError::MalformedTarget("target is not valid UTF-8 once decoded".to_string()))
}

fn has_percent_escape(raw: &str) -> bool {
    raw.as_bytes()
        .windows(3)
        .any(|w| w[0] == b'%' && w[1].is_ascii_hexdigit() && w[2].is_ascii_hexdigit())
}

/// Plain spaces are kept (`/ch%20one`); the resolver re-encodes them. Tabs,
/// newlines and other control characters are not identifiers.
fn is_identifier(candidate: &str) -> bool {
    !candidate.contains("://")
        && !candidate.starts_with('/')
        && !candidate.chars().any(|c| c.is_control() || (c.is_whitespace() && c != ' '))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn extractor(resolver_enabled: bool) -> TargetExtractor {
        TargetExtractor::new(&ExtractConfig::default(), resolver_enabled).unwrap()
    }

    fn extract(uri: &str, resolver_enabled: bool) -> Result<Target, RelayError> {
        let uri: Uri = uri.parse().unwrap();
        extractor(resolver_enabled).extract(&uri, &HeaderMap::new())
    }

    fn direct(url: &str) -> Target {
        Target::Direct(Url::parse(url).unwrap())
    }

    #[test]
    fn test_percent_encoded_path_is_decoded_once() {
        assert_eq!(
            extract("/https%3A%2F%2Fexample.com%2Fa.txt", false).unwrap(),
            direct("https://example.com/a.txt")
        );
    }

    #[test]
    fn test_double_encoding_is_not_unwrapped() {
        // %253A decodes to %3A, which is not a scheme separator.
        let err = extract("/https%253A%252F%252Fexample.com", false).unwrap_err();
        assert!(matches!(err, RelayError::MalformedTarget(_)));
    }

    #[test]
    fn test_raw_path_keeps_target_query_escapes() {
        let target = extract("/https://example.com/search?q=a%20b&page=2", false).unwrap();
        let Target::Direct(url) = target else {
            panic!("expected direct target");
        };
        assert_eq!(url.as_str(), "https://example.com/search?q=a%20b&page=2");
    }

    #[test]
    fn test_query_param_on_root() {
        assert_eq!(
            extract("/?url=https%3A%2F%2Fcdn.example.com%2Fv.mp4", false).unwrap(),
            direct("https://cdn.example.com/v.mp4")
        );
    }

    #[test]
    fn test_header_wins_over_path() {
        let uri: Uri = "/https%3A%2F%2Fpath.example.com%2F".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-target-url", HeaderValue::from_static("https://header.example.com/x"));

        assert_eq!(
            extractor(false).extract(&uri, &headers).unwrap(),
            direct("https://header.example.com/x")
        );
    }

    #[test]
    fn test_missing_target() {
        assert!(matches!(extract("/", false), Err(RelayError::MissingTarget)));
        assert!(matches!(extract("/?url=", false), Err(RelayError::MissingTarget)));
        assert!(matches!(extract("/?other=1", false), Err(RelayError::MissingTarget)));
    }

    #[test]
    fn test_malformed_targets() {
        assert!(matches!(extract("/not-a-url", false), Err(RelayError::MalformedTarget(_))));
        assert!(matches!(extract("/ftp://example.com/file", false), Err(RelayError::MalformedTarget(_))));
        assert!(matches!(extract("/http%3A%2F%2F", false), Err(RelayError::MalformedTarget(_))));
    }

    #[test]
    fn test_identifier_only_when_resolver_enabled() {
        assert_eq!(
            extract("/channel123/output/manifest.mpd", true).unwrap(),
            Target::Identifier("channel123/output/manifest.mpd".to_string())
        );
        assert!(matches!(
            extract("/channel123/output/manifest.mpd", false),
            Err(RelayError::MalformedTarget(_))
        ));
    }

    #[test]
    fn test_identifier_may_contain_spaces() {
        assert_eq!(
            extract("/ch%20one/index.m3u8", true).unwrap(),
            Target::Identifier("ch one/index.m3u8".to_string())
        );
        assert!(matches!(extract("/ch%09one", true), Err(RelayError::MalformedTarget(_))));
        assert!(matches!(extract("/ch%0Aone", true), Err(RelayError::MalformedTarget(_))));
    }

    #[test]
    fn test_absolute_url_bypasses_resolver() {
        assert_eq!(
            extract("/https://cdn.example.com/a.mpd", true).unwrap(),
            direct("https://cdn.example.com/a.mpd")
        );
    }

    #[test]
    fn test_bare_root_detection() {
        let ex = extractor(false);
        let headers = HeaderMap::new();
        assert!(ex.is_bare_root(&"/".parse().unwrap(), &headers));
        assert!(!ex.is_bare_root(&"/?url=x".parse().unwrap(), &headers));
        assert!(!ex.is_bare_root(&"/https://example.com".parse().unwrap(), &headers));
    }
}

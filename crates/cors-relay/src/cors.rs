//! Cross-origin header injection.

use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::config::CorsConfig;

/// CORS header values, validated once at startup.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allow_origin: HeaderValue,
    allow_methods: HeaderValue,
    allow_headers: HeaderValue,
    expose_headers: HeaderValue,
    max_age: HeaderValue,
}

impl CorsPolicy {
    pub fn from_config(config: &CorsConfig) -> anyhow::Result<Self> {
        let value = |name: &str, raw: &str| {
            HeaderValue::from_str(raw)
                .map_err(|e| anyhow::anyhow!("invalid cors.{name} value {raw:?}: {e}"))
        };
        Ok(Self {
            allow_origin: value("allow_origin", &config.allow_origin)?,
            allow_methods: value("allow_methods", &config.allow_methods)?,
            allow_headers: value("allow_headers", &config.allow_headers)?,
            expose_headers: value("expose_headers", &config.expose_headers)?,
            max_age: HeaderValue::from(config.max_age_secs),
        })
    }

    /// Set the four headers every relayed response carries, replacing any
    /// upstream values.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin.clone());
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, self.allow_methods.clone());
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, self.allow_headers.clone());
        headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, self.expose_headers.clone());
    }

    /// 204 answer to a preflight; never forwarded upstream.
    pub fn preflight(&self) -> Response {
        let mut response = StatusCode::NO_CONTENT.into_response();
        let headers = response.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin.clone());
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, self.allow_methods.clone());
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, self.allow_headers.clone());
        headers.insert(ACCESS_CONTROL_MAX_AGE, self.max_age.clone());
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_overrides_upstream_cors() {
        let policy = CorsPolicy::from_config(&CorsConfig::default()).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("https://other.example"));

        policy.apply(&mut headers);

        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_HEADERS], "Range,Content-Type,Authorization");
        assert!(headers.contains_key(ACCESS_CONTROL_ALLOW_METHODS));
        assert!(headers.contains_key(ACCESS_CONTROL_EXPOSE_HEADERS));
    }

    #[test]
    fn test_preflight_has_max_age_and_no_expose() {
        let config = CorsConfig {
            allow_origin: "https://app.example".to_string(),
            max_age_secs: 600,
            ..CorsConfig::default()
        };
        let response = CorsPolicy::from_config(&config).unwrap().preflight();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example");
        assert_eq!(response.headers()[ACCESS_CONTROL_MAX_AGE], "600");
        assert!(!response.headers().contains_key(ACCESS_CONTROL_EXPOSE_HEADERS));
    }

    #[test]
    fn test_rejects_invalid_header_value() {
        let config = CorsConfig {
            allow_origin: "bad\nvalue".to_string(),
            ..CorsConfig::default()
        };
        assert!(CorsPolicy::from_config(&config).is_err());
    }
}

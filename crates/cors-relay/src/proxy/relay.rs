//! Response relay: turns a live upstream response into the caller's response.
//!
//! Status and a filtered header set are copied up front; the body is handed
//! to the server as a stream, chunk by chunk, through [`RelayBody`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{
    ACCEPT_RANGES, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_ENCODING, CONTENT_LENGTH,
    CONTENT_RANGE, CONTENT_TYPE, ETAG, EXPIRES, LAST_MODIFIED, LOCATION,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_core::Stream;
use url::Url;

use super::correlation;
use super::forward::is_hop_by_hop;
use super::lifecycle::{Lifecycle, Phase};
use crate::config::ForwardConfig;
use crate::cors::CorsPolicy;

/// Build the caller-facing header set from the upstream headers.
///
/// Only representation headers survive; everything else, hop-by-hop headers
/// included, is dropped. CORS headers are always set.
pub fn response_headers(upstream: &HeaderMap, cors: &CorsPolicy) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in [
        CONTENT_TYPE,
        CONTENT_LENGTH,
        CONTENT_ENCODING,
        CONTENT_RANGE,
        CONTENT_DISPOSITION,
        ACCEPT_RANGES,
        CACHE_CONTROL,
        ETAG,
        EXPIRES,
        LAST_MODIFIED,
    ] {
        debug_assert!(!is_hop_by_hop(&name));
        for value in upstream.get_all(&name) {
            headers.append(name.clone(), value.clone());
        }
    }
    cors.apply(&mut headers);
    headers
}

pub fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// Exchanges whose body the server never polls: HEAD, 1xx, 204 and 304.
pub fn is_bodiless(method: &Method, status: StatusCode) -> bool {
    *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// Rewrite a relative `Location` into a relay path.
///
/// The location is resolved against the URL that produced it and the result
/// is percent-encoded into `/<url>`, which the target extractor decodes back
/// on the follow-up request. Absolute locations return `None` and pass
/// through unchanged.
pub fn rewrite_location(location: &str, upstream_url: &Url) -> Option<String> {
    if Url::parse(location).is_ok() {
        return None;
    }
    let absolute = upstream_url.join(location).ok()?;
    Some(format!("/{}", urlencoding::encode(absolute.as_str())))
}

/// Turn the upstream response into the caller's response, streaming the body.
pub fn into_response(
    upstream: reqwest::Response,
    method: &Method,
    mut lifecycle: Lifecycle,
    cors: &CorsPolicy,
    forward: &ForwardConfig,
    request_id: &str,
) -> Response {
    let status = upstream.status();
    let mut headers = response_headers(upstream.headers(), cors);

    if is_redirect(status) {
        if let Some(location) = upstream.headers().get(LOCATION) {
            let rewritten = location
                .to_str()
                .ok()
                .filter(|_| forward.rewrite_redirects)
                .and_then(|loc| rewrite_location(loc, upstream.url()))
                .and_then(|loc| HeaderValue::from_str(&loc).ok());
            if let Some(ref value) = rewritten {
                tracing::debug!(from = ?location, to = ?value, "Rewrote relative redirect");
            }
            headers.insert(LOCATION, rewritten.unwrap_or_else(|| location.clone()));
        }
    }
    correlation::tag(&mut headers, request_id);

    lifecycle.record_status(status.as_u16());
    lifecycle.advance(Phase::Streaming);

    let body = if is_bodiless(method, status) {
        lifecycle.complete();
        Body::empty()
    } else {
        Body::from_stream(RelayBody::new(upstream, lifecycle, forward.timeout()))
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Passes upstream chunks through unchanged while driving the lifecycle.
///
/// End of stream completes the relay. An upstream error, or no chunk for
/// `idle`, fails it and is returned to the server, which aborts the
/// connection since the status line is already out. Dropping the body early,
/// because the client left, drops the upstream stream with it and records the
/// relay as cancelled.
struct RelayBody {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    lifecycle: Lifecycle,
    idle: Duration,
    idle_timer: Pin<Box<tokio::time::Sleep>>,
}

impl RelayBody {
    fn new(upstream: reqwest::Response, lifecycle: Lifecycle, idle: Duration) -> Self {
        Self::from_stream(Box::pin(upstream.bytes_stream()), lifecycle, idle)
    }

    fn from_stream(
        inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
        lifecycle: Lifecycle,
        idle: Duration,
    ) -> Self {
        Self {
            inner,
            lifecycle,
            idle,
            idle_timer: Box::pin(tokio::time::sleep(idle)),
        }
    }

    fn fail(&mut self, error: std::io::Error) -> Poll<Option<Result<Bytes, std::io::Error>>> {
        self.lifecycle.fail_streaming(&error);
        Poll::Ready(Some(Err(error)))
    }
}

impl Stream for RelayBody {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let next = tokio::time::Instant::now() + self.idle;
                self.idle_timer.as_mut().reset(next);
                self.lifecycle.on_chunk(chunk.len());
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => self.fail(std::io::Error::other(e)),
            Poll::Ready(None) => {
                self.lifecycle.complete();
                Poll::Ready(None)
            }
            Poll::Pending => match self.idle_timer.as_mut().poll(cx) {
                Poll::Ready(()) => self.fail(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "upstream body stalled",
                )),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CorsConfig;
    use axum::http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, CONNECTION, SET_COOKIE, TRANSFER_ENCODING};

    fn cors() -> CorsPolicy {
        CorsPolicy::from_config(&CorsConfig::default()).unwrap()
    }

    #[test]
    fn test_response_headers_keep_representation_headers() {
        let mut upstream = HeaderMap::new();
        upstream.insert(CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
        upstream.insert(CONTENT_LENGTH, HeaderValue::from_static("1024"));
        upstream.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 0-1023/4096"));
        upstream.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        upstream.insert(ETAG, HeaderValue::from_static("\"abc\""));
        upstream.insert(LAST_MODIFIED, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        upstream.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=60"));

        let headers = response_headers(&upstream, &cors());

        for name in [CONTENT_TYPE, CONTENT_LENGTH, CONTENT_RANGE, ACCEPT_RANGES, ETAG, LAST_MODIFIED, CACHE_CONTROL] {
            assert_eq!(headers.get(&name), upstream.get(&name), "{name} should be preserved");
        }
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(headers.contains_key(ACCESS_CONTROL_EXPOSE_HEADERS));
    }

    #[test]
    fn test_response_headers_drop_hop_by_hop_and_unlisted() {
        let mut upstream = HeaderMap::new();
        upstream.insert(CONNECTION, HeaderValue::from_static("close"));
        upstream.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        upstream.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        upstream.insert(SET_COOKIE, HeaderValue::from_static("tracking=1"));
        upstream.insert("server", HeaderValue::from_static("nginx"));
        upstream.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("https://cdn.example"));

        let headers = response_headers(&upstream, &cors());

        assert!(!headers.contains_key(CONNECTION));
        assert!(!headers.contains_key(TRANSFER_ENCODING));
        assert!(!headers.contains_key("keep-alive"));
        assert!(!headers.contains_key(SET_COOKIE));
        assert!(!headers.contains_key("server"));
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[test]
    fn test_rewrite_relative_location() {
        let base = Url::parse("https://cdn.example.com/live/ch1/index.m3u8?token=abc").unwrap();

        assert_eq!(
            rewrite_location("/live/ch1/hd.m3u8", &base).unwrap(),
            "/https%3A%2F%2Fcdn.example.com%2Flive%2Fch1%2Fhd.m3u8"
        );
        assert_eq!(
            rewrite_location("seg-2.ts?t=1", &base).unwrap(),
            "/https%3A%2F%2Fcdn.example.com%2Flive%2Fch1%2Fseg-2.ts%3Ft%3D1"
        );
        assert_eq!(
            rewrite_location("//mirror.example.com/a", &base).unwrap(),
            "/https%3A%2F%2Fmirror.example.com%2Fa"
        );
    }

    #[test]
    fn test_absolute_location_is_untouched() {
        let base = Url::parse("https://cdn.example.com/a").unwrap();
        assert_eq!(rewrite_location("https://other.example.com/b", &base), None);
    }

    #[test]
    fn test_bodiless_exchanges() {
        assert!(is_bodiless(&Method::HEAD, StatusCode::OK));
        assert!(is_bodiless(&Method::GET, StatusCode::NO_CONTENT));
        assert!(is_bodiless(&Method::GET, StatusCode::NOT_MODIFIED));
        assert!(!is_bodiless(&Method::GET, StatusCode::OK));
        assert!(!is_bodiless(&Method::POST, StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_no_content_completes_without_streaming() {
        let upstream: reqwest::Response = axum::http::Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body("")
            .unwrap()
            .into();
        let mut lifecycle = Lifecycle::new(tracing::Span::none());
        lifecycle.advance(Phase::TargetResolved);
        lifecycle.advance(Phase::Forwarding);

        let response = into_response(
            upstream,
            &Method::GET,
            lifecycle,
            &cors(),
            &ForwardConfig::default(),
            "req-1",
        );

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_upstream_body_times_out() {
        use futures_util::StreamExt;

        let first = futures_util::stream::iter(vec![Ok::<_, reqwest::Error>(Bytes::from_static(b"head"))]);
        let stalled = first.chain(futures_util::stream::pending());
        let mut lifecycle = Lifecycle::new(tracing::Span::none());
        lifecycle.advance(Phase::TargetResolved);
        lifecycle.advance(Phase::Forwarding);
        lifecycle.advance(Phase::Streaming);

        let mut body = RelayBody::from_stream(Box::pin(stalled), lifecycle, Duration::from_millis(100));

        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"head"));
        let err = body.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
        assert_eq!(body.lifecycle.phase(), Phase::Failed);
        assert_eq!(body.lifecycle.bytes(), 4);
    }

    #[test]
    fn test_redirect_statuses() {
        for code in [301, 302, 303, 307, 308] {
            assert!(is_redirect(StatusCode::from_u16(code).unwrap()));
        }
        assert!(!is_redirect(StatusCode::NOT_MODIFIED));
        assert!(!is_redirect(StatusCode::OK));
    }
}

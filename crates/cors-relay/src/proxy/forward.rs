//! Outbound hop to the final destination.
//!
//! The request body is streamed straight into the upstream request and the
//! upstream response is returned unread, so neither direction is buffered.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::{ACCEPT, CONTENT_TYPE, IF_RANGE, RANGE, USER_AGENT};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use bytes::Bytes;
use futures_core::Stream;
use tokio::sync::oneshot;
use tracing::Instrument;
use url::Url;

use crate::config::ForwardConfig;
use crate::error::RelayError;

/// Headers that only concern a single connection and are never relayed.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// A fully prepared upstream request.
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Body>,
}

/// Only GET and HEAD drop the caller's body; everything else streams it through.
pub fn sends_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD)
}

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Build the outbound header set from the caller's headers.
///
/// Only a fixed allow-list is copied, so `host`, `content-length` and
/// hop-by-hop headers never leave. `fixed` headers (the resolver flow's
/// `referer`/`origin`) override anything the caller sent.
pub fn outbound_headers(
    inbound: &HeaderMap,
    default_user_agent: &HeaderValue,
    fixed: &HeaderMap,
    with_body: bool,
) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for name in [RANGE, IF_RANGE, ACCEPT, USER_AGENT] {
        if let Some(value) = inbound.get(&name) {
            headers.insert(name, value.clone());
        }
    }
    if with_body {
        if let Some(value) = inbound.get(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, value.clone());
        }
    }
    if !headers.contains_key(USER_AGENT) {
        headers.insert(USER_AGENT, default_user_agent.clone());
    }

    for (name, value) in fixed {
        if !is_hop_by_hop(name) {
            headers.insert(name.clone(), value.clone());
        }
    }

    headers
}

/// Issues outbound requests with a dedicated client and timeout budget.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    user_agent: HeaderValue,
    timeout: Duration,
}

impl Forwarder {
    pub fn from_config(config: &ForwardConfig) -> anyhow::Result<Self> {
        // Redirects go back to the caller, never followed here. Inactivity on
        // both bodies is bounded by `UploadBody` and the response relay, since
        // reqwest's read timeout also runs while the upload is streaming.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout())
            .no_proxy()
            .build()?;
        let user_agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|e| anyhow::anyhow!("invalid forward.user_agent: {e}"))?;
        Ok(Self {
            client,
            user_agent,
            timeout: config.timeout(),
        })
    }

    pub fn user_agent(&self) -> &HeaderValue {
        &self.user_agent
    }

    /// Send `request` and wait for the response headers. The body stays unread.
    pub async fn send(
        &self,
        request: OutboundRequest,
        request_id: &str,
    ) -> Result<reqwest::Response, RelayError> {
        let host = request.url.host_str().unwrap_or_default().to_string();
        let span = relay_tracing::forward_span!(request_id, host);
        let start = Instant::now();

        async {
            tracing::debug!(method = %request.method, url = %request.url, "Forwarding upstream");

            let mut builder = self
                .client
                .request(request.method, request.url)
                .headers(request.headers);

            // The header deadline starts once the upload is finished; while it
            // streams, only inactivity between chunks is bounded.
            let (uploaded_tx, uploaded_rx) = oneshot::channel();
            let uploading = request.body.is_some();
            if let Some(body) = request.body {
                builder = builder.body(reqwest::Body::wrap_stream(UploadBody::new(
                    body,
                    self.timeout,
                    uploaded_tx,
                )));
            }
            let header_deadline = async {
                if uploading {
                    let _ = uploaded_rx.await;
                }
                tokio::time::sleep(self.timeout).await;
            };

            let result = tokio::select! {
                sent = builder.send() => Ok(sent),
                () = header_deadline => Err(()),
            };

            let latency = start.elapsed().as_millis() as u64;
            tracing::Span::current().record("latency_ms", latency);

            match result {
                Err(_) => {
                    tracing::warn!(latency_ms = latency, "Upstream response timed out");
                    Err(RelayError::UpstreamTimeout(self.timeout.as_secs()))
                }
                Ok(Err(e)) if e.is_timeout() => {
                    tracing::warn!(error = %e, latency_ms = latency, "Upstream timeout");
                    Err(RelayError::UpstreamTimeout(self.timeout.as_secs()))
                }
                Ok(Err(e)) => {
                    let detail = error_chain(&e);
                    tracing::warn!(error = %detail, latency_ms = latency, "Upstream connection error");
                    Err(RelayError::UpstreamConnect(detail))
                }
                Ok(Ok(response)) => {
                    let status = response.status().as_u16();
                    tracing::Span::current().record("status", status);
                    tracing::info!(status, latency_ms = latency, "Upstream responded");
                    Ok(response)
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Inbound request body as sent upstream.
///
/// Fails with `TimedOut` when the caller stalls for longer than `idle`, and
/// signals `uploaded` once the last chunk has been handed to the client.
struct UploadBody {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, axum::Error>> + Send>>,
    idle: Duration,
    idle_timer: Pin<Box<tokio::time::Sleep>>,
    uploaded: Option<oneshot::Sender<()>>,
}

impl UploadBody {
    fn new(body: Body, idle: Duration, uploaded: oneshot::Sender<()>) -> Self {
        Self {
            inner: Box::pin(body.into_data_stream()),
            idle,
            idle_timer: Box::pin(tokio::time::sleep(idle)),
            uploaded: Some(uploaded),
        }
    }
}

impl Stream for UploadBody {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let next = tokio::time::Instant::now() + self.idle;
                self.idle_timer.as_mut().reset(next);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(std::io::Error::other(e)))),
            Poll::Ready(None) => {
                if let Some(uploaded) = self.uploaded.take() {
                    let _ = uploaded.send(());
                }
                Poll::Ready(None)
            }
            Poll::Pending => match self.idle_timer.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Some(Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "request body stalled",
                )))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Flatten an error and its sources into one line; reqwest's own message
/// omits the underlying cause (refused, DNS, TLS).
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

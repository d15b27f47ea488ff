//! Axum HTTP server: router, relay handler, listener, graceful shutdown.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::config::RelayConfig;
use crate::cors::CorsPolicy;
use crate::error::RelayError;
use crate::proxy::correlation;
use crate::proxy::forward::{outbound_headers, sends_body, Forwarder, OutboundRequest};
use crate::proxy::lifecycle::{Lifecycle, Phase};
use crate::proxy::policy::HostPolicy;
use crate::proxy::relay;
use crate::proxy::resolver::Resolver;
use crate::proxy::target::{Target, TargetExtractor};

/// Shared application state. Built once at startup and never mutated.
pub struct AppState {
    pub config: RelayConfig,
    pub extractor: TargetExtractor,
    pub policy: HostPolicy,
    pub cors: CorsPolicy,
    pub resolver: Option<Resolver>,
    pub forwarder: Forwarder,
}

impl AppState {
    pub fn from_config(config: RelayConfig) -> anyhow::Result<Self> {
        let resolver = Resolver::from_config(&config.resolver)?;
        let extractor = TargetExtractor::new(&config.extract, resolver.is_some())?;
        let cors = CorsPolicy::from_config(&config.cors)?;
        let forwarder = Forwarder::from_config(&config.forward)?;

        let policy = HostPolicy::from_config(&config.policy);
        if policy == HostPolicy::Open {
            tracing::warn!(
                "No allowed or denied hosts configured: relaying to ANY host, including internal networks"
            );
        }

        Ok(Self {
            config,
            extractor,
            policy,
            cors,
            resolver,
            forwarder,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/favicon.ico", get(handle_favicon).fallback(handle_relay))
        .fallback(handle_relay)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind, serve, and drain on shutdown.
///
/// After a shutdown signal the listener closes and in-flight relays get
/// `shutdown_grace_secs` to finish; whatever is still streaming then is cut.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let listen_addr = state.config.server.listen_address();
    let grace = Duration::from_secs(state.config.server.shutdown_grace_secs);
    let app = router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "cors-relay listening");

    let (stopping_tx, stopping_rx) = watch::channel(false);
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = stopping_tx.send(true);
        })
        .into_future();

    tokio::select! {
        result = server => result?,
        () = drain_deadline(stopping_rx, grace) => {
            tracing::warn!(grace_secs = grace.as_secs(), "Grace period elapsed, dropping in-flight relays");
        }
    }

    tracing::info!("cors-relay shut down");
    Ok(())
}

/// Resolves `grace` after shutdown starts; never resolves otherwise.
async fn drain_deadline(mut stopping: watch::Receiver<bool>, grace: Duration) {
    let started = stopping.wait_for(|stopping| *stopping).await.is_ok();
    if !started {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(grace).await;
}

async fn handle_favicon(State(state): State<Arc<AppState>>) -> Response {
    decorate(StatusCode::NO_CONTENT.into_response(), &state.cors, &correlation::generate_id())
}

/// Every path not routed elsewhere: preflight, the info page, or a relay.
async fn handle_relay(State(state): State<Arc<AppState>>, request: Request) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = state.cors.preflight();
        correlation::tag(response.headers_mut(), &correlation::generate_id());
        return response;
    }

    if matches!(*request.method(), Method::GET | Method::HEAD)
        && state.extractor.is_bare_root(request.uri(), request.headers())
    {
        return decorate(service_info(&state), &state.cors, &correlation::generate_id());
    }

    let request_id = correlation::generate_id();
    let span = relay_tracing::relay_request_span!(request_id, request.method(), request.uri().path());
    let mut lifecycle = Lifecycle::new(span.clone());
    let method = request.method().clone();

    async move {
        match forward_request(&state, request, &mut lifecycle, &request_id).await {
            Ok(upstream) => relay::into_response(
                upstream,
                &method,
                lifecycle,
                &state.cors,
                &state.config.forward,
                &request_id,
            ),
            Err(e) => {
                lifecycle.fail(&e);
                decorate(e.into_response(), &state.cors, &request_id)
            }
        }
    }
    .instrument(span)
    .await
}

/// Extract, check, optionally resolve, then send. Returns the live upstream
/// response with its body unread.
async fn forward_request(
    state: &AppState,
    request: Request,
    lifecycle: &mut Lifecycle,
    request_id: &str,
) -> Result<reqwest::Response, RelayError> {
    let target = state.extractor.extract(request.uri(), request.headers())?;

    let (destination, fixed_headers) = match target {
        Target::Direct(url) => {
            state.policy.check(&url)?;
            lifecycle.advance(Phase::TargetResolved);
            (url, None)
        }
        Target::Identifier(identifier) => {
            let resolver = state
                .resolver
                .as_ref()
                .ok_or_else(|| RelayError::MalformedTarget(identifier.clone()))?;
            lifecycle.advance(Phase::TargetResolved);
            lifecycle.advance(Phase::ResolverPending);
            let url = resolver.resolve(&identifier, request_id).await?;
            state.policy.check(&url)?;
            (url, Some(resolver.forward_headers()))
        }
    };

    lifecycle.record_target(&destination);
    lifecycle.advance(Phase::Forwarding);

    let (parts, body) = request.into_parts();
    let with_body = sends_body(&parts.method);
    let no_fixed = HeaderMap::new();
    let headers = outbound_headers(
        &parts.headers,
        state.forwarder.user_agent(),
        fixed_headers.unwrap_or(&no_fixed),
        with_body,
    );

    let outbound = OutboundRequest {
        method: parts.method,
        url: destination,
        headers,
        body: with_body.then_some(body),
    };
    state.forwarder.send(outbound, request_id).await
}

fn service_info(state: &AppState) -> Response {
    let extract = &state.config.extract;
    axum::Json(serde_json::json!({
        "service": "cors-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "usage": {
            "path": "/<url-encoded target URL>",
            "query": format!("/?{}=<url-encoded target URL>", extract.query_param),
            "header": format!("{}: <target URL>", extract.header),
        },
        "resolver": state.resolver.is_some(),
        "policy": state.policy.describe(),
    }))
    .into_response()
}

/// CORS and correlation headers for responses produced locally.
fn decorate(mut response: Response, cors: &CorsPolicy, request_id: &str) -> Response {
    cors.apply(response.headers_mut());
    correlation::tag(response.headers_mut(), request_id);
    response
}

/// Wait for SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("Shutdown signal received, draining in-flight relays...");
}

//! Span builder helpers for relay instrumentation.

/// Create the root span for one relayed request.
///
/// Usage: `let span = relay_request_span!(request_id, method, path);`
///
/// Fields recorded later:
/// - `phase`: the last lifecycle phase reached (`completed`, `failed`, `cancelled`, ...)
/// - `target`: the destination URL once known
/// - `status`: status code returned to the caller
/// - `ttfb_ms`: milliseconds until the first upstream body chunk
/// - `total_duration_ms`: milliseconds until the body finished streaming
/// - `bytes`: body bytes relayed to the caller
#[macro_export]
macro_rules! relay_request_span {
    ($request_id:expr, $method:expr, $path:expr) => {
        tracing::info_span!(
            "relay_request",
            request_id = %$request_id,
            method = %$method,
            path = %$path,
            phase = tracing::field::Empty,
            target = tracing::field::Empty,
            status = tracing::field::Empty,
            ttfb_ms = tracing::field::Empty,
            total_duration_ms = tracing::field::Empty,
            bytes = tracing::field::Empty,
        )
    };
}

/// Create a span for the resolver lookup hop.
#[macro_export]
macro_rules! resolver_span {
    ($request_id:expr, $identifier:expr) => {
        tracing::info_span!(
            "resolver_lookup",
            request_id = %$request_id,
            identifier = %$identifier,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}

/// Create a span for the outbound forward to the final destination.
#[macro_export]
macro_rules! forward_span {
    ($request_id:expr, $host:expr) => {
        tracing::info_span!(
            "upstream_forward",
            request_id = %$request_id,
            host = %$host,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}

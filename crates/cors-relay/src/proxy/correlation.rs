//! Request ID generation for log and response correlation.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

/// Response header carrying the relay's request ID.
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Generate a new request ID (UUID v4).
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Stamp `request_id` onto outgoing response headers.
pub fn tag(headers: &mut HeaderMap, request_id: &str) {
    headers.insert(
        REQUEST_ID_HEADER,
        HeaderValue::from_str(request_id).unwrap_or_else(|_| HeaderValue::from_static("unknown")),
    );
}

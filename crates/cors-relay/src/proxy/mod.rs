//! Relay engine: target extraction, host policy, resolver hop, forwarding,
//! response relay and per-request lifecycle.

pub mod correlation;
pub mod forward;
pub mod lifecycle;
pub mod policy;
pub mod relay;
pub mod resolver;
pub mod target;

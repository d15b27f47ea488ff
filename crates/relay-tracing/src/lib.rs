//! Tracing setup for cors-relay: fmt logging with optional OTLP export,
//! plus span helper macros used by the relay pipeline.

pub mod config;
pub mod otlp;
pub mod spans;

pub use config::{OtlpProtocol, TracingConfig};
pub use otlp::{init_tracing, TracingGuard};

//! Per-request lifecycle tracking.
//!
//! A [`Lifecycle`] travels with the request: first through the handler
//! future, then inside the streamed response body. Whoever owns it last
//! decides the terminal phase. If it is dropped before reaching one, the
//! server tore the request down because the client went away, and the
//! request is recorded as cancelled.

use std::time::Instant;

use crate::error::RelayError;

/// `Received → TargetResolved → (ResolverPending →) Forwarding → Streaming → Completed`,
/// with `Failed` and `Cancelled` reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Received,
    TargetResolved,
    ResolverPending,
    Forwarding,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Received => "received",
            Phase::TargetResolved => "target_resolved",
            Phase::ResolverPending => "resolver_pending",
            Phase::Forwarding => "forwarding",
            Phase::Streaming => "streaming",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }

    /// Whether the state machine permits `self → next`.
    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (from, Failed | Cancelled) => !from.is_terminal(),
            (Received, TargetResolved)
            | (TargetResolved, ResolverPending)
            | (TargetResolved, Forwarding)
            | (ResolverPending, Forwarding)
            | (Forwarding, Streaming)
            | (Streaming, Completed) => true,
            _ => false,
        }
    }
}

pub struct Lifecycle {
    phase: Phase,
    span: tracing::Span,
    start: Instant,
    bytes: u64,
    first_byte_seen: bool,
}

impl Lifecycle {
    pub fn new(span: tracing::Span) -> Self {
        span.record("phase", Phase::Received.as_str());
        Self {
            phase: Phase::Received,
            span,
            start: Instant::now(),
            bytes: 0,
            first_byte_seen: false,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Move to `next`. Illegal transitions are logged and ignored.
    pub fn advance(&mut self, next: Phase) {
        if !self.phase.can_advance_to(next) {
            tracing::warn!(
                parent: &self.span,
                from = self.phase.as_str(),
                to = next.as_str(),
                "Ignoring illegal lifecycle transition"
            );
            return;
        }
        tracing::debug!(
            parent: &self.span,
            from = self.phase.as_str(),
            to = next.as_str(),
            "Lifecycle transition"
        );
        self.phase = next;
        self.span.record("phase", next.as_str());
    }

    pub fn record_target(&self, target: &url::Url) {
        self.span.record("target", target.as_str());
    }

    pub fn record_status(&self, status: u16) {
        self.span.record("status", status);
    }

    /// Account for one body chunk handed to the caller.
    pub fn on_chunk(&mut self, len: usize) {
        if !self.first_byte_seen {
            self.first_byte_seen = true;
            self.span.record("ttfb_ms", self.elapsed_ms());
        }
        self.bytes += len as u64;
    }

    /// Terminal failure before any response headers were sent.
    pub fn fail(&mut self, error: &RelayError) {
        self.advance(Phase::Failed);
        self.record_status(error.status().as_u16());
        let elapsed_ms = self.elapsed_ms();
        if error.is_client_error() {
            tracing::info!(parent: &self.span, kind = error.kind(), error = %error, elapsed_ms, "Relay rejected");
        } else {
            tracing::error!(parent: &self.span, kind = error.kind(), error = %error, elapsed_ms, "Relay failed");
        }
    }

    /// Terminal failure after headers were committed: the connection is cut.
    pub fn fail_streaming(&mut self, error: &dyn std::error::Error) {
        self.advance(Phase::Failed);
        self.record_totals();
        tracing::error!(
            parent: &self.span,
            kind = "streaming",
            error = %error,
            bytes = self.bytes,
            "Upstream body failed mid-transfer, closing connection"
        );
    }

    pub fn complete(&mut self) {
        self.advance(Phase::Completed);
        self.record_totals();
        tracing::info!(parent: &self.span, bytes = self.bytes, "Relay complete");
    }

    fn record_totals(&self) {
        self.span.record("total_duration_ms", self.elapsed_ms());
        self.span.record("bytes", self.bytes);
    }

    fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if self.phase.is_terminal() {
            return;
        }
        let interrupted = self.phase;
        self.phase = Phase::Cancelled;
        self.span.record("phase", Phase::Cancelled.as_str());
        self.record_totals();
        tracing::info!(
            parent: &self.span,
            interrupted = interrupted.as_str(),
            bytes = self.bytes,
            "Client disconnected, relay cancelled"
        );
    }
}

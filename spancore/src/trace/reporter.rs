//! The seam between the span/event model and the reporting transport.
use crate::trace::{Event, TraceResult};
use std::fmt;
use std::time::Duration;

/// Hands finished events and transaction summaries to the transport.
///
/// Implementations are external to this crate: the core only requires that
/// reporting is best-effort. Failures are returned as values so callers can
/// log them, and must never be allowed to disturb instrumented code.
pub trait Reporter: fmt::Debug + Send + Sync {
    /// Emit one finished event.
    fn report_event(&self, event: &Event) -> TraceResult<()>;

    /// Record a transaction-level summary for a completed top span.
    ///
    /// The bridge may normalize or replace the proposed transaction name;
    /// the returned string is the name that was actually recorded.
    fn send_non_http_span(
        &self,
        txname: &str,
        duration: Duration,
        has_error: bool,
    ) -> TraceResult<String>;
}

/// A no-op reporter that accepts and discards everything.
#[derive(Clone, Debug, Default)]
pub struct NoopReporter {
    _private: (),
}

impl NoopReporter {
    /// Create a new no-op reporter.
    pub fn new() -> Self {
        NoopReporter { _private: () }
    }
}

impl Reporter for NoopReporter {
    fn report_event(&self, _event: &Event) -> TraceResult<()> {
        Ok(())
    }

    fn send_non_http_span(
        &self,
        txname: &str,
        _duration: Duration,
        _has_error: bool,
    ) -> TraceResult<String> {
        Ok(txname.to_string())
    }
}

//! Process-wide span statistics.
//!
//! The counters are advisory: they feed diagnostics and dashboards and never
//! affect control flow, so all updates use relaxed ordering.
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

static SPANS_CREATED: AtomicU64 = AtomicU64::new(0);
static TOP_SPANS_CREATED: AtomicU64 = AtomicU64::new(0);
static TOP_SPANS_ACTIVE: AtomicI64 = AtomicI64::new(0);
static TOP_SPANS_MAX_ACTIVE: AtomicI64 = AtomicI64::new(0);
static TOP_SPANS_EXITED: AtomicU64 = AtomicU64::new(0);
static OTHER_SPANS_ACTIVE: AtomicI64 = AtomicI64::new(0);

pub(crate) fn record_span_created() {
    SPANS_CREATED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_top_span_created() {
    TOP_SPANS_CREATED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_top_span_entered() {
    let active = TOP_SPANS_ACTIVE.fetch_add(1, Ordering::Relaxed) + 1;
    TOP_SPANS_MAX_ACTIVE.fetch_max(active, Ordering::Relaxed);
}

pub(crate) fn record_top_span_exited() {
    TOP_SPANS_ACTIVE.fetch_sub(1, Ordering::Relaxed);
    TOP_SPANS_EXITED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_other_span_entered() {
    OTHER_SPANS_ACTIVE.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_other_span_exited() {
    OTHER_SPANS_ACTIVE.fetch_sub(1, Ordering::Relaxed);
}

/// A point-in-time copy of the process-wide span counters.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Spans constructed since process start, skeleton reuse excluded.
    pub spans_created: u64,
    /// Top spans constructed since process start.
    pub top_spans_created: u64,
    /// Top spans currently between enter and exit.
    pub top_spans_active: i64,
    /// High-water mark of concurrently active top spans.
    pub top_spans_max_active: i64,
    /// Top spans that have exited.
    pub top_spans_exited: u64,
    /// Non-top spans currently between enter and exit.
    pub other_spans_active: i64,
}

/// Read all counters at once.
///
/// The reads are individually atomic but not mutually consistent; treat the
/// snapshot as an approximation while spans are in flight.
pub fn snapshot() -> StatsSnapshot {
    StatsSnapshot {
        spans_created: SPANS_CREATED.load(Ordering::Relaxed),
        top_spans_created: TOP_SPANS_CREATED.load(Ordering::Relaxed),
        top_spans_active: TOP_SPANS_ACTIVE.load(Ordering::Relaxed),
        top_spans_max_active: TOP_SPANS_MAX_ACTIVE.load(Ordering::Relaxed),
        top_spans_exited: TOP_SPANS_EXITED.load(Ordering::Relaxed),
        other_spans_active: OTHER_SPANS_ACTIVE.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_move_monotonically() {
        let before = snapshot();
        record_span_created();
        record_top_span_created();
        record_top_span_entered();
        record_top_span_exited();
        let after = snapshot();
        assert!(after.spans_created > before.spans_created);
        assert!(after.top_spans_created > before.top_spans_created);
        assert!(after.top_spans_exited > before.top_spans_exited);
        assert!(after.top_spans_max_active >= 1);
    }

    #[test]
    fn other_span_counter_balances() {
        record_other_span_entered();
        let entered = snapshot().other_spans_active;
        record_other_span_exited();
        let exited = snapshot().other_spans_active;
        assert!(exited <= entered);
    }
}

//! Implements the span/event lifecycle core of a distributed-tracing
//! instrumentation agent.
//!
//! # Overview
//!
//! spancore models one request's causal trace as a tree of [`Span`]s, each
//! bounded by an entry and an exit [`Event`], and decides what gets reported
//! versus suppressed when a trace is not being sampled. It is the layer that
//! instrumentation probes (HTTP, database, ...) call into; the reporting
//! transport and the sampling decision engine sit behind the [`Reporter`]
//! and [`TraceSettings`] seams and are not part of this crate.
//!
//! Here's a breakdown of its components:
//!
//! - **[Context]:** the per-logical-request trace context store, attached
//!   with scope-guard semantics and carried across asynchronous suspension
//!   points with [`FutureExt`].
//! - **[trace]:** spans, events, causal identities, the skeleton
//!   optimization for unsampled traces, transaction naming, and the
//!   process-wide span counters.
//!
//! The central failure-handling contract is that this crate never breaks the
//! host program: usage errors fail fast at construction, while every
//! internal operation that can fail is caught and logged so that reporting
//! or context bugs degrade telemetry quality, never application
//! correctness.
//!
//! # Getting Started
//!
//! ```
//! use spancore::trace::{Span, TraceSettings};
//!
//! fn handle_request() {
//!     let settings = TraceSettings::from_env();
//!     let span = Span::entry("request", &settings, []).unwrap();
//!
//!     let result: Result<_, std::io::Error> = span.run_sync(|| {
//!         // work tracked by the now current span
//!         Ok(())
//!     });
//!     # let _ = result;
//! }
//! # handle_request();
//! ```
//!
//! See the [`trace`] module docs for descending into child spans, wrapping
//! asynchronously completing work, and the unsampled fast path.
//!
//! # Feature Flags
//!
//! The following crate feature flags are available:
//!
//! * `internal-logs`: Enables internal diagnostics via `tracing` (default).
//! * `serialize`: Adds `serde` derives to the propagatable identity types.
//!
//! [`Span`]: crate::trace::Span
//! [`Event`]: crate::trace::Event
//! [`Reporter`]: crate::trace::Reporter
//! [`TraceSettings`]: crate::trace::TraceSettings
//! [Context]: crate::Context
//! [trace]: crate::trace
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![allow(clippy::needless_doctest_main)]
#![cfg_attr(
    docsrs,
    feature(doc_cfg, doc_auto_cfg),
    deny(rustdoc::broken_intra_doc_links)
)]

mod context;

pub use context::{Context, ContextGuard, FutureExt, WithContext};

mod common;

pub use common::{Key, KeyValue, Value};

pub mod trace;

mod internal_logging;

#[doc(hidden)]
#[cfg(feature = "internal-logs")]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}

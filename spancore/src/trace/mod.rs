//! The `trace` module tracks the progression of a single request as a tree
//! of [`Span`]s, each bounded by an entry and an exit [`Event`].
//!
//! A trace is identified by a causal task id shared by all of its events;
//! each event names its causal predecessors through edges, so the collected
//! events form a directed graph that reflects true execution order, even
//! when asynchronous work interleaves. Whether any of it is reported is
//! decided once, when the root span is created, and never changes for the
//! life of the trace.
//!
//! ## Getting Started
//!
//! ```
//! use spancore::trace::{Span, TraceSettings};
//!
//! let settings = TraceSettings::default();
//! let span = Span::entry("request", &settings, []).unwrap();
//!
//! let result: Result<_, std::io::Error> = span.run_sync(|| {
//!     // traced app logic here...
//!     Ok("done")
//! });
//! # assert!(result.is_ok());
//! ```
//!
//! ## Unsampled traces
//!
//! The dominant case in production is a trace that is *not* sampled: nothing
//! it produces will ever be reported. Rather than paying a pair of events
//! per span anyway, the root span of an unsampled trace creates one shared
//! skeleton span, and every [`Span::descend`] call of arbitrary depth
//! resolves to that same handle.
//!
//! ## Asynchronous work
//!
//! [`Span::run_async`] wraps an operation whose real end happens in a later
//! callback. The wrapped closure receives a [`SpanCompletion`]; span exit is
//! deferred until the completion is finished, while the context scope the
//! closure ran under is released as soon as it returns. See [`FutureExt`]
//! for carrying a context across `.await` points.
//!
//! [`FutureExt`]: crate::FutureExt

use std::sync::PoisonError;
use thiserror::Error;

mod completion;
mod error;
mod event;
mod event_context;
mod id_generator;
mod in_memory_reporter;
mod reporter;
mod settings;
mod span;
pub mod stats;

pub use self::{
    completion::SpanCompletion,
    error::{ErrorValue, IgnoreErrorPredicate, SpanError},
    event::{Event, EventKind},
    event_context::{EventContext, OpId, TaskId, TraceFlags},
    id_generator::RandomIdGenerator,
    in_memory_reporter::{InMemoryReporter, Transaction},
    reporter::{NoopReporter, Reporter},
    settings::{SampleSource, TraceSettings, MAX_SAMPLE_RATE},
    span::{get_active_span, Span, TransactionName, SKELETON_NAME},
};

/// Describe the result of operations in the trace core.
pub type TraceResult<T> = Result<T, TraceError>;

/// Errors returned by the trace core.
///
/// Only usage errors surface here; instrumentation-internal failures are
/// logged and suppressed so they can never break instrumented code.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TraceError {
    /// Spans must be constructed with a non-empty name.
    #[error("span name must be a non-empty string")]
    EmptyName,

    /// Other errors not covered above
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl TraceError {
    pub(crate) fn from_lock<T>(_: PoisonError<T>) -> Self {
        TraceError::Other(Box::new(Custom("poisoned lock".into())))
    }
}

impl From<String> for TraceError {
    fn from(err_msg: String) -> Self {
        TraceError::Other(Box::new(Custom(err_msg)))
    }
}

impl From<&'static str> for TraceError {
    fn from(err_msg: &'static str) -> Self {
        TraceError::Other(Box::new(Custom(err_msg.into())))
    }
}

/// Wrap type for string
#[derive(Error, Debug)]
#[error("{0}")]
struct Custom(String);

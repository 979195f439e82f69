use crate::agent_debug;
use crate::trace::{ErrorValue, Span, SpanError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

type CompletionHandler = Box<dyn FnOnce() + Send>;

/// Completes an asynchronously running [`Span`], at most once.
///
/// [`Span::run_async`] hands one of these to the wrapped closure, which is
/// expected to carry it into whatever callback marks the real end of the
/// asynchronous operation. Calling [`finish`] there performs the metrics and
/// transaction-name finalization, attaches the completion error to the exit
/// event, and exits the span — long after the synchronous turn that entered
/// it has released its context scope. The completion reaches the span
/// through its own handle, so it does not depend on the context store still
/// being attached.
///
/// Completions are cheap to clone; all clones share the same once-state, and
/// only the first `finish` has any effect.
///
/// A completion that is dropped without being finished never reports the
/// span's exit event. That leak is inherent to a wrapped operation that
/// never completes; no timeout exists at this layer.
///
/// [`finish`]: SpanCompletion::finish
#[derive(Clone)]
pub struct SpanCompletion {
    inner: Arc<CompletionInner>,
}

struct CompletionInner {
    span: Span,
    start: Option<Instant>,
    finished: AtomicBool,
    handler: Mutex<Option<CompletionHandler>>,
}

impl SpanCompletion {
    pub(crate) fn new(
        span: Span,
        start: Option<Instant>,
        handler: Option<CompletionHandler>,
    ) -> Self {
        SpanCompletion {
            inner: Arc::new(CompletionInner {
                span,
                start,
                finished: AtomicBool::new(false),
                handler: Mutex::new(handler),
            }),
        }
    }

    /// The span this completion will exit.
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// Returns `true` once any clone of this completion has finished.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Finish without an error.
    pub fn finish_ok(&self) {
        self.finish(None);
    }

    /// Finish, normalizing whatever the callback was handed as its error.
    pub fn finish_err(&self, error: impl Into<ErrorValue>) {
        self.finish(Span::to_error(error));
    }

    /// Finish the span: finalize metrics and transaction naming, attach the
    /// error (if any) to the exit event, and exit.
    ///
    /// Only the first call across all clones does anything; later calls are
    /// logged and dropped. If the span was started with a legacy completion
    /// handler, the handler runs **instead** of the exit sequence and the
    /// exit event is never reported.
    pub fn finish(&self, error: Option<SpanError>) {
        if self.inner.finished.swap(true, Ordering::AcqRel) {
            agent_debug!(name: "span_completed_twice", layer = self.inner.span.name());
            return;
        }

        let handler = self.inner.handler.lock().ok().and_then(|mut h| h.take());
        if let Some(handler) = handler {
            // legacy carve-out: the handler replaces the exit sequence
            handler();
            return;
        }

        let span = &self.inner.span;
        if let Some(error) = error {
            span.set_exit_error(error);
        }
        span.finalize(self.inner.start);
        span.exit();
    }
}

impl fmt::Debug for SpanCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanCompletion")
            .field("layer", &self.inner.span.name())
            .field("finished", &self.is_finished())
            .finish()
    }
}

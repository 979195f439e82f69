use crate::trace::{EventContext, Span};
use futures_core::stream::Stream;
use futures_sink::Sink;
use pin_project_lite::pin_project;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

thread_local! {
    static CURRENT_CONTEXT: RefCell<Context> = RefCell::new(Context::default());
}

/// The per-logical-request trace state shared by every snapshot of one
/// [`Context`].
///
/// The scope is mutable behind its own locks: a span reported on one
/// snapshot is visible to every other snapshot holding the same scope, which
/// is what lets a deferred async continuation observe events reported after
/// it captured its context.
#[derive(Debug, Default)]
pub(crate) struct TraceScope {
    active_span: Mutex<Option<Span>>,
    last_span: Mutex<Option<Span>>,
    last_event: Mutex<Option<EventContext>>,
}

/// An execution-scoped handle to the trace context store.
///
/// A `Context` carries the "currently active span" and "most recently
/// reported event" for one logical request. It is attached to the caller's
/// execution unit with [`attach`], which returns a [`ContextGuard`] that
/// restores the previous context when dropped. Snapshots taken with
/// [`Context::current`] share the underlying scope, so mutations are seen by
/// every holder.
///
/// A default `Context` has no scope: reads answer `None` and writes are
/// dropped. Scopes are created on demand per logical request with
/// [`with_trace_scope`].
///
/// [`attach`]: Context::attach()
/// [`with_trace_scope`]: Context::with_trace_scope()
///
/// # Examples
///
/// ```
/// use spancore::Context;
///
/// let outer = Context::new().with_trace_scope();
/// let _outer_guard = outer.attach();
/// assert!(Context::current().has_scope());
///
/// {
///     let _inner_guard = Context::new().attach();
///     // the inner context has no scope of its own
///     assert!(!Context::current().has_scope());
/// }
///
/// // resets to the outer scope when the inner guard is dropped
/// assert!(Context::current().has_scope());
/// ```
#[derive(Clone, Default)]
pub struct Context {
    scope: Option<Arc<TraceScope>>,
}

impl Context {
    /// Creates an empty `Context`.
    ///
    /// No scope is allocated until [`with_trace_scope`] is called.
    ///
    /// [`with_trace_scope`]: Context::with_trace_scope()
    pub fn new() -> Self {
        Context::default()
    }

    /// Returns a snapshot of the current thread's context.
    ///
    /// The snapshot shares the underlying scope with the attached context,
    /// it does not copy it.
    pub fn current() -> Self {
        Context::map_current(|cx| cx.clone())
    }

    /// Applies a function to the current context returning its value.
    ///
    /// This avoids cloning the current context when a read or a scoped write
    /// is all that is needed.
    pub fn map_current<T>(f: impl FnOnce(&Context) -> T) -> T {
        CURRENT_CONTEXT.with(|cx| f(&cx.borrow()))
    }

    /// Returns a copy of this context with a fresh, empty trace scope.
    ///
    /// Called once per logical request, before any span of that request is
    /// entered.
    pub fn with_trace_scope(&self) -> Self {
        Context {
            scope: Some(Arc::new(TraceScope::default())),
        }
    }

    /// Returns `true` if a trace scope has been created for this context.
    pub fn has_scope(&self) -> bool {
        self.scope.is_some()
    }

    /// The span currently marked active for this logical request, if any.
    pub fn active_span(&self) -> Option<Span> {
        self.read(|scope| scope.active_span.lock().ok()?.clone())
    }

    pub(crate) fn set_active_span(&self, span: Option<Span>) {
        self.write(|scope| {
            if let Ok(mut active) = scope.active_span.lock() {
                *active = span;
            }
        });
    }

    /// The span most recently entered in this logical request, if any.
    pub fn last_span(&self) -> Option<Span> {
        self.read(|scope| scope.last_span.lock().ok()?.clone())
    }

    pub(crate) fn set_last_span(&self, span: Span) {
        self.write(|scope| {
            if let Ok(mut last) = scope.last_span.lock() {
                *last = Some(span);
            }
        });
    }

    /// The causal identity of the most recently reported event in this
    /// logical request, if any.
    pub fn last_event(&self) -> Option<EventContext> {
        self.read(|scope| *scope.last_event.lock().ok()?)
    }

    pub(crate) fn set_last_event(&self, event: EventContext) {
        self.write(|scope| {
            if let Ok(mut last) = scope.last_event.lock() {
                *last = Some(event);
            }
        });
    }

    fn read<T>(&self, f: impl FnOnce(&TraceScope) -> Option<T>) -> Option<T> {
        self.scope.as_deref().and_then(f)
    }

    fn write(&self, f: impl FnOnce(&TraceScope)) {
        // a context without a scope drops writes; spans tolerate that
        if let Some(scope) = self.scope.as_deref() {
            f(scope);
        }
    }

    /// Replaces the current context on this thread with this context.
    ///
    /// Dropping the returned [`ContextGuard`] will reset the current context
    /// to the previous value.
    ///
    /// # Examples
    ///
    /// ```
    /// use spancore::Context;
    ///
    /// let my_cx = Context::new().with_trace_scope();
    ///
    /// // Set the current thread context
    /// let cx_guard = my_cx.attach();
    /// assert!(Context::current().has_scope());
    ///
    /// // Drop the guard to restore the previous context
    /// drop(cx_guard);
    /// assert!(!Context::current().has_scope());
    /// ```
    pub fn attach(self) -> ContextGuard {
        let previous_cx = CURRENT_CONTEXT
            .try_with(|current| current.replace(self))
            .ok();

        ContextGuard {
            previous_cx,
            _marker: PhantomData,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("has_scope", &self.scope.is_some())
            .finish()
    }
}

/// A guard that resets the current context to the prior context when dropped.
#[allow(missing_debug_implementations)]
pub struct ContextGuard {
    previous_cx: Option<Context>,
    // ensure this type is !Send as it relies on thread locals
    _marker: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous_cx) = self.previous_cx.take() {
            let _ = CURRENT_CONTEXT.try_with(|current| current.replace(previous_cx));
        }
    }
}

pin_project! {
    /// A future, stream, or sink that has an associated trace context.
    #[derive(Clone, Debug)]
    pub struct WithContext<T> {
        #[pin]
        inner: T,
        trace_cx: Context,
    }
}

impl<T: Sized> FutureExt for T {}

impl<T: std::future::Future> std::future::Future for WithContext<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = this.trace_cx.clone().attach();

        this.inner.poll(task_cx)
    }
}

impl<T: Stream> Stream for WithContext<T> {
    type Item = T::Item;

    fn poll_next(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let _guard = this.trace_cx.clone().attach();
        T::poll_next(this.inner, task_cx)
    }
}

impl<I, T: Sink<I>> Sink<I> for WithContext<T>
where
    T: Sink<I>,
{
    type Error = T::Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let _guard = this.trace_cx.clone().attach();
        T::poll_ready(this.inner, task_cx)
    }

    fn start_send(self: Pin<&mut Self>, item: I) -> Result<(), Self::Error> {
        let this = self.project();
        let _guard = this.trace_cx.clone().attach();
        T::start_send(this.inner, item)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let _guard = this.trace_cx.clone().attach();
        T::poll_flush(this.inner, task_cx)
    }

    fn poll_close(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let _enter = this.trace_cx.clone().attach();
        T::poll_close(this.inner, task_cx)
    }
}

/// Extension trait allowing futures, streams, and sinks to carry a trace
/// context across suspension points.
pub trait FutureExt: Sized {
    /// Attaches the provided [`Context`] to this type, returning a
    /// `WithContext` wrapper.
    ///
    /// When the wrapped type is a future, stream, or sink, the attached
    /// context will be set as current while it is being polled.
    ///
    /// [`Context`]: crate::Context
    fn with_context(self, trace_cx: Context) -> WithContext<Self> {
        WithContext {
            inner: self,
            trace_cx,
        }
    }

    /// Attaches the current [`Context`] to this type, returning a
    /// `WithContext` wrapper.
    ///
    /// [`Context`]: crate::Context
    fn with_current_context(self) -> WithContext<Self> {
        let trace_cx = Context::current();
        self.with_context(trace_cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{OpId, TaskId, TraceFlags};

    fn event(op: u64) -> EventContext {
        EventContext::new(TaskId::from(1_u128), OpId::from(op), TraceFlags::SAMPLED)
    }

    #[test]
    fn nested_contexts_restore() {
        let outer = Context::new().with_trace_scope();
        outer.set_last_event(event(1));
        let _outer_guard = outer.attach();
        assert_eq!(Context::current().last_event(), Some(event(1)));

        {
            let inner = Context::current().with_trace_scope();
            let _inner_guard = inner.attach();
            // fresh scope starts empty
            assert_eq!(Context::current().last_event(), None);
            Context::map_current(|cx| cx.set_last_event(event(2)));
            assert_eq!(Context::current().last_event(), Some(event(2)));
        }

        assert_eq!(Context::current().last_event(), Some(event(1)));
    }

    #[test]
    fn snapshots_share_the_scope() {
        let cx = Context::new().with_trace_scope();
        let _guard = cx.attach();

        let snapshot = Context::current();
        Context::map_current(|current| current.set_last_event(event(3)));

        // the earlier snapshot observes the later write
        assert_eq!(snapshot.last_event(), Some(event(3)));
    }

    #[test]
    fn scopeless_context_drops_writes() {
        let cx = Context::new();
        cx.set_last_event(event(4));
        assert_eq!(cx.last_event(), None);
        assert!(cx.active_span().is_none());
        assert!(cx.last_span().is_none());
    }

    #[test]
    fn futures_reattach_their_scope() {
        let cx = Context::new().with_trace_scope();
        cx.set_last_event(event(5));

        let observed = futures_executor::block_on(
            async { Context::current().last_event() }.with_context(cx),
        );

        assert_eq!(observed, Some(event(5)));
        // the future's scope does not leak onto this thread
        assert_eq!(Context::current().last_event(), None);
    }
}

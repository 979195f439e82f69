//! # Span
//!
//! `Span`s represent a single operation within a trace. `Span`s can be
//! nested to form a trace tree, rooted at a top span that typically covers
//! the end-to-end handling of one request.
//!
//! A `Span` owns its entry and exit [`Event`]s. The entry event is reported
//! when the span is entered, the exit event when it exits, and the pair is
//! reported exactly once no matter how the wrapped work ends. Spans are
//! cheap-to-clone handles over shared state, so the same span can be held by
//! instrumentation code, the context store, and a deferred async completion
//! at once.
use crate::common::KeyValue;
use crate::trace::{
    stats, ErrorValue, Event, EventContext, EventKind, IgnoreErrorPredicate, OpId,
    RandomIdGenerator, Reporter, SpanCompletion, SpanError, TraceError, TraceFlags, TraceResult,
    TraceSettings,
};
use crate::{agent_debug, agent_error, agent_warn, Context};
use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Name of the degenerate span shared by every descendant of an unsampled
/// trace.
pub const SKELETON_NAME: &str = "__skeleton__";

/// The logical operation label of one trace, used for aggregated metrics.
///
/// Probes either know the name up front or only at completion time; the two
/// cases are explicit variants rather than a string-or-callable field.
#[derive(Clone)]
pub enum TransactionName {
    /// A name known when it is set.
    Fixed(String),
    /// A name resolved when the transaction completes. An `Err` is logged
    /// and the default name is used instead.
    Computed(Arc<dyn Fn() -> Result<String, Box<dyn Error + Send + Sync>> + Send + Sync>),
}

impl TransactionName {
    /// A fixed transaction name.
    pub fn fixed(name: impl Into<String>) -> Self {
        TransactionName::Fixed(name.into())
    }

    /// A transaction name computed when the transaction completes.
    pub fn computed<F>(compute: F) -> Self
    where
        F: Fn() -> Result<String, Box<dyn Error + Send + Sync>> + Send + Sync + 'static,
    {
        TransactionName::Computed(Arc::new(compute))
    }
}

impl fmt::Debug for TransactionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionName::Fixed(name) => f.debug_tuple("Fixed").field(name).finish(),
            TransactionName::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Entered,
    Exited,
}

struct SpanState {
    lifecycle: Lifecycle,
    entry: Event,
    exit: Event,
    default_name: String,
    custom_name: Option<TransactionName>,
    ignore_errors: Option<IgnoreErrorPredicate>,
    // present only on top spans of unsampled traces
    skeleton: Option<Span>,
}

struct SpanInner {
    name: Cow<'static, str>,
    sampled: bool,
    is_top: bool,
    metrics: bool,
    is_skeleton: bool,
    is_async: AtomicBool,
    reuse: AtomicU64,
    reporter: Option<Arc<dyn Reporter>>,
    state: Mutex<SpanState>,
}

#[derive(Clone, Copy)]
struct SpanOptions {
    top: bool,
    allow_unnamed: bool,
}

/// A named interval of work bounded by an entry and an exit event.
#[derive(Clone)]
pub struct Span {
    inner: Arc<SpanInner>,
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("name", &self.inner.name)
            .field("sampled", &self.inner.sampled)
            .field("top", &self.inner.is_top)
            .field("skeleton", &self.inner.is_skeleton)
            .finish()
    }
}

impl Span {
    /// Construct a span descending from the causal context in `settings`.
    ///
    /// The sample flag is read from the resolved trace context at
    /// construction time and never changes afterwards. `data` is merged onto
    /// the entry event immediately, to be reported when the span is entered.
    /// The exit event is created alongside and always edges back to the
    /// entry event.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::EmptyName`] if `name` is empty.
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        settings: &TraceSettings,
        data: impl IntoIterator<Item = KeyValue>,
    ) -> TraceResult<Span> {
        Span::build(
            name.into(),
            settings,
            data,
            SpanOptions {
                top: false,
                allow_unnamed: false,
            },
        )
    }

    /// Construct the root span of a trace within this process.
    ///
    /// If `settings` carries no inbound causal context, a fresh task id is
    /// synthesized and tagged with the sample decision. When the resulting
    /// span is not sampled, one skeleton span is created eagerly and reused
    /// by every descendant for the life of the trace, so an arbitrarily deep
    /// unsampled call tree costs a single allocation.
    ///
    /// Entry spans may be unnamed; their default transaction name is then
    /// empty.
    pub fn entry(
        name: impl Into<Cow<'static, str>>,
        settings: &TraceSettings,
        kvpairs: impl IntoIterator<Item = KeyValue>,
    ) -> TraceResult<Span> {
        stats::record_top_span_created();
        let name = name.into();
        let span = Span::build(
            name.clone(),
            settings,
            kvpairs,
            SpanOptions {
                top: true,
                allow_unnamed: true,
            },
        )?;

        if let Ok(mut state) = span.inner.state.lock() {
            state.default_name = if name.is_empty() {
                String::new()
            } else {
                format!("custom-{name}")
            };
            state.entry.set([
                KeyValue::new("SampleSource", settings.source.as_i64()),
                KeyValue::new("SampleRate", settings.rate as i64),
            ]);
            if !span.inner.sampled {
                let entry_context = *state.entry.context();
                state.skeleton = Some(Span::skeleton(
                    &entry_context,
                    span.inner.reporter.clone(),
                ));
            }
        }
        Ok(span)
    }

    fn build(
        name: Cow<'static, str>,
        settings: &TraceSettings,
        data: impl IntoIterator<Item = KeyValue>,
        opts: SpanOptions,
    ) -> TraceResult<Span> {
        if name.is_empty() && !opts.allow_unnamed {
            return Err(TraceError::EmptyName);
        }

        let parent = settings
            .trace_context
            .unwrap_or_else(|| Span::synthesize_context(settings));
        let mut entry = Event::new(name.clone(), EventKind::Entry, &parent, settings.edge);
        entry.set(data);
        let exit = Event::new(name.clone(), EventKind::Exit, entry.context(), true);
        let sampled = entry.is_sampled();
        stats::record_span_created();

        Ok(Span {
            inner: Arc::new(SpanInner {
                name,
                sampled,
                is_top: opts.top,
                metrics: opts.top && settings.do_metrics,
                is_skeleton: false,
                is_async: AtomicBool::new(false),
                reuse: AtomicU64::new(0),
                reporter: settings.reporter.clone(),
                state: Mutex::new(SpanState {
                    lifecycle: Lifecycle::Created,
                    entry,
                    exit,
                    default_name: String::new(),
                    custom_name: None,
                    ignore_errors: None,
                    skeleton: None,
                }),
            }),
        })
    }

    // Covers the no-inbound-context and test paths: a fresh random task id
    // tagged with the sample decision, with no operation to edge back to.
    fn synthesize_context(settings: &TraceSettings) -> EventContext {
        EventContext::new(
            RandomIdGenerator::default().new_task_id(),
            OpId::INVALID,
            TraceFlags::default().with_sampled(settings.do_sample),
        )
    }

    fn skeleton(entry_context: &EventContext, reporter: Option<Arc<dyn Reporter>>) -> Span {
        let entry = Event::new(SKELETON_NAME, EventKind::Entry, entry_context, true);
        let exit = Event::new(SKELETON_NAME, EventKind::Exit, entry.context(), true);
        stats::record_span_created();
        Span {
            inner: Arc::new(SpanInner {
                name: Cow::Borrowed(SKELETON_NAME),
                sampled: false,
                is_top: false,
                metrics: false,
                is_skeleton: true,
                is_async: AtomicBool::new(false),
                reuse: AtomicU64::new(0),
                reporter,
                state: Mutex::new(SpanState {
                    lifecycle: Lifecycle::Created,
                    entry,
                    exit,
                    default_name: String::new(),
                    custom_name: None,
                    ignore_errors: None,
                    skeleton: None,
                }),
            }),
        }
    }

    /// Create a child span of this span.
    ///
    /// When the trace is not sampled this returns the trace's shared
    /// skeleton instead of allocating, incrementing its reuse counter; every
    /// descendant of arbitrary depth resolves to the same handle.
    ///
    /// When sampled, the child's causal predecessor is the most recently
    /// reported event read from the context store, not this span directly:
    /// the recorded chain follows execution order, which is what matters
    /// once asynchronous work interleaves.
    pub fn descend(
        &self,
        name: impl Into<Cow<'static, str>>,
        data: impl IntoIterator<Item = KeyValue>,
    ) -> TraceResult<Span> {
        if !self.inner.sampled {
            let skeleton = if self.inner.is_top {
                self.inner
                    .state
                    .lock()
                    .ok()
                    .and_then(|state| state.skeleton.clone())
            } else {
                None
            };
            // an unsampled non-top span is (or stands in for) the skeleton
            let skeleton = skeleton.unwrap_or_else(|| self.clone());
            skeleton.inner.reuse.fetch_add(1, Ordering::Relaxed);
            return Ok(skeleton);
        }

        let parent = Context::map_current(|cx| cx.last_event())
            .unwrap_or_else(|| self.entry_context());
        let mut settings = TraceSettings::default().with_trace_context(parent);
        settings.reporter = self.inner.reporter.clone();
        Span::new(name, &settings, data)
    }

    /// The span name (its layer).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether this trace's events are reported.
    pub fn is_sampled(&self) -> bool {
        self.inner.sampled
    }

    /// Whether this is the root span of a trace within this process.
    pub fn is_top(&self) -> bool {
        self.inner.is_top
    }

    /// Whether this span is the shared stand-in of an unsampled trace.
    pub fn is_skeleton(&self) -> bool {
        self.inner.is_skeleton
    }

    /// Whether this span wraps asynchronously completing work.
    pub fn is_async(&self) -> bool {
        self.inner.is_async.load(Ordering::Acquire)
    }

    /// How many times this span has been handed out by [`Span::descend`] as
    /// the stand-in for an unsampled descendant.
    pub fn reuse_count(&self) -> u64 {
        self.inner.reuse.load(Ordering::Relaxed)
    }

    /// Returns `true` if `other` is a handle to this same span.
    pub fn same_as(&self, other: &Span) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns `true` while the span is between enter and exit.
    pub fn is_entered(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| state.lifecycle == Lifecycle::Entered)
            .unwrap_or(false)
    }

    /// Returns `true` once the span has exited.
    pub fn has_exited(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| state.lifecycle == Lifecycle::Exited)
            .unwrap_or(false)
    }

    /// The causal identity of this span's entry event.
    pub fn entry_context(&self) -> EventContext {
        self.inner
            .state
            .lock()
            .map(|state| *state.entry.context())
            .unwrap_or(EventContext::NONE)
    }

    /// The causal identity of this span's exit event.
    pub fn exit_context(&self) -> EventContext {
        self.inner
            .state
            .lock()
            .map(|state| *state.exit.context())
            .unwrap_or(EventContext::NONE)
    }

    /// Merge annotation data onto the not-yet-reported entry event.
    pub fn set(&self, data: impl IntoIterator<Item = KeyValue>) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.entry.set(data);
        }
    }

    /// Run `f` synchronously inside this span.
    ///
    /// The span is entered before `f` is invoked and exited on every path
    /// out, including unwinding. An `Err` returned by `f` is captured onto
    /// the exit event (unless the ignore predicate matches it) and returned
    /// unchanged.
    ///
    /// For a top span this acquires a fresh context scope for the duration
    /// of the call, and, when metrics are enabled, finalizes the transaction
    /// name and elapsed time just before exiting.
    pub fn run_sync<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display,
    {
        let mut scope_guard = None;
        let mut start = None;
        if self.inner.is_top {
            scope_guard = Some(Context::current().with_trace_scope().attach());
            if self.inner.metrics {
                start = Some(Instant::now());
            }
        }

        self.enter();
        let exit_guard = ExitGuard {
            span: self.clone(),
            start,
        };

        let result = f();
        if let Err(err) = &result {
            self.set_exit_error(err.to_string());
        }

        drop(exit_guard);
        drop(scope_guard);
        result
    }

    /// Run `f` for work that completes asynchronously.
    ///
    /// The span is marked async and entered, a fresh context scope is
    /// attached for the duration of the synchronous call only, and `f`
    /// receives a [`SpanCompletion`] to carry into the callback that marks
    /// the operation's real end. The span's exit is deferred until that
    /// completion is finished; if it never is, the exit event is never
    /// reported.
    pub fn run_async<T, F>(&self, f: F) -> T
    where
        F: FnOnce(SpanCompletion) -> T,
    {
        self.start_async(f, None)
    }

    /// [`Span::run_async`] with a legacy completion handler.
    ///
    /// When the completion is finished, `handler` runs **instead** of the
    /// normal exit sequence, so the span's exit event is bypassed entirely.
    /// This carve-out exists for instrumented libraries that complete
    /// through their own teardown path; prefer [`Span::run_async`].
    pub fn run_async_with_handler<T, F, H>(&self, f: F, handler: H) -> T
    where
        F: FnOnce(SpanCompletion) -> T,
        H: FnOnce() + Send + 'static,
    {
        self.start_async(f, Some(Box::new(handler)))
    }

    fn start_async<T, F>(&self, f: F, handler: Option<Box<dyn FnOnce() + Send>>) -> T
    where
        F: FnOnce(SpanCompletion) -> T,
    {
        self.inner.is_async.store(true, Ordering::Release);

        // The scope exists so the current synchronous turn sees this span
        // as active; the deferred completion reaches the span through its
        // own handle, not through the context store.
        let _scope_guard = Context::current().with_trace_scope().attach();
        self.enter();
        let start = (self.inner.is_top && self.inner.metrics).then(Instant::now);

        let completion = SpanCompletion::new(self.clone(), start, handler);
        f(completion)
    }

    /// Enter the span, reporting its entry event.
    ///
    /// Failures are logged, never propagated: entering a span must not break
    /// instrumented code.
    pub fn enter(&self) {
        self.enter_with(std::iter::empty());
    }

    /// [`Span::enter`] with extra annotation data for the entry event.
    pub fn enter_with(&self, data: impl IntoIterator<Item = KeyValue>) {
        if self.inner.is_top {
            stats::record_top_span_entered();
            Context::map_current(|cx| cx.set_active_span(Some(self.clone())));
        } else {
            stats::record_other_span_entered();
        }
        Context::map_current(|cx| cx.set_last_span(self.clone()));

        let Ok(mut state) = self.inner.state.lock() else {
            agent_error!(name: "span_enter_state_poisoned", layer = self.inner.name.as_ref());
            return;
        };
        if state.lifecycle == Lifecycle::Entered && !self.inner.is_skeleton {
            agent_debug!(name: "span_reentered", layer = self.inner.name.as_ref());
        }
        state.lifecycle = Lifecycle::Entered;

        if self.inner.is_skeleton {
            // reused for the whole trace; annotations must not accumulate
            state.entry.clear_data();
            state.exit.clear_data();
            return;
        }

        state.entry.report(self.inner.reporter.as_deref(), data);
        if self.inner.sampled {
            let entry_context = *state.entry.context();
            drop(state);
            Context::map_current(|cx| cx.set_last_event(entry_context));
        }
    }

    /// Exit the span, reporting its exit event.
    ///
    /// If an event was reported between this span's entry and now, the exit
    /// event gains an extra edge to it, capturing asynchronous work that ran
    /// in the interval. Failures are logged, never propagated.
    pub fn exit(&self) {
        self.do_exit(std::iter::empty(), true);
    }

    /// [`Span::exit`] with extra annotation data for the exit event.
    pub fn exit_with(&self, data: impl IntoIterator<Item = KeyValue>) {
        self.do_exit(data, true);
    }

    /// Exit without considering an extra edge to the live event, for callers
    /// whose causal chain is already captured.
    pub fn exit_without_edge(&self, data: impl IntoIterator<Item = KeyValue>) {
        self.do_exit(data, false);
    }

    fn do_exit(&self, data: impl IntoIterator<Item = KeyValue>, edge: bool) {
        if self.inner.is_top {
            stats::record_top_span_exited();
            Context::map_current(|cx| cx.set_active_span(None));
        } else {
            stats::record_other_span_exited();
        }

        let Ok(mut state) = self.inner.state.lock() else {
            agent_error!(name: "span_exit_state_poisoned", layer = self.inner.name.as_ref());
            return;
        };
        if state.lifecycle == Lifecycle::Exited && !self.inner.is_skeleton {
            agent_debug!(name: "span_exited_twice", layer = self.inner.name.as_ref());
        }
        state.lifecycle = Lifecycle::Exited;

        if self.inner.is_skeleton {
            state.entry.clear_data();
            state.exit.clear_data();
            return;
        }

        if edge {
            let entry_op = state.entry.context().op_id();
            let task_id = state.entry.context().task_id();
            if let Some(last) = Context::map_current(|cx| cx.last_event()) {
                // capture work causally interposed between entry and exit,
                // but never edge across traces or back to our own entry
                if last.task_id() == task_id && last.op_id() != entry_op {
                    state.exit.add_edge(last.op_id());
                }
            }
        }

        state.exit.report(self.inner.reporter.as_deref(), data);
        if self.inner.sampled {
            let exit_context = *state.exit.context();
            drop(state);
            Context::map_current(|cx| cx.set_last_event(exit_context));
        }
    }

    /// Normalize a value into a reportable error.
    ///
    /// A message becomes a new [`SpanError`] with that message, an error is
    /// kept unchanged, and anything else normalizes to `None`.
    pub fn to_error(value: impl Into<ErrorValue>) -> Option<SpanError> {
        value.into().normalize()
    }

    /// Attach a normalized error to the exit event.
    ///
    /// If the span's ignore predicate matches the error it is dropped
    /// entirely — never attached, never reported. This is the only path for
    /// application-level error filtering.
    pub fn set_exit_error(&self, error: impl Into<ErrorValue>) {
        let Some(error) = Span::to_error(error) else {
            return;
        };

        let ignore = self
            .inner
            .state
            .lock()
            .ok()
            .and_then(|state| state.ignore_errors.clone());
        if let Some(predicate) = ignore {
            // user predicate runs without holding the span lock
            if predicate(&error) {
                agent_debug!(name: "span_error_ignored", layer = self.inner.name.as_ref());
                return;
            }
        }

        if let Ok(mut state) = self.inner.state.lock() {
            state.exit.set_error(error);
        }
    }

    /// Set the predicate deciding which application errors to drop.
    pub fn set_ignore_errors<F>(&self, predicate: F)
    where
        F: Fn(&SpanError) -> bool + Send + Sync + 'static,
    {
        if let Ok(mut state) = self.inner.state.lock() {
            state.ignore_errors = Some(Arc::new(predicate));
        }
    }

    /// Attach `error` to the exit event, then exit.
    pub fn exit_checking_error(
        &self,
        error: impl Into<ErrorValue>,
        data: impl IntoIterator<Item = KeyValue>,
    ) {
        self.set_exit_error(error);
        self.exit_with(data);
    }

    /// Report an internal annotation event causally following the most
    /// recently reported event.
    ///
    /// Logged and skipped when no event is live: an internal event needs a
    /// causal predecessor.
    pub fn info(&self, data: impl IntoIterator<Item = KeyValue>) {
        self.internal_event(data, None);
    }

    /// Report an internal event carrying a normalized application error.
    pub fn error(&self, error: impl Into<ErrorValue>) {
        let Some(error) = Span::to_error(error) else {
            return;
        };
        self.internal_event(std::iter::empty(), Some(error));
    }

    fn internal_event(
        &self,
        data: impl IntoIterator<Item = KeyValue>,
        error: Option<SpanError>,
    ) {
        let Some(last) = Context::map_current(|cx| cx.last_event()) else {
            agent_debug!(name: "internal_event_no_predecessor", layer = self.inner.name.as_ref());
            return;
        };

        let mut event = Event::new(self.inner.name.clone(), EventKind::Info, &last, true);
        if let Some(error) = error {
            event.set_error(error);
        }
        event.report(self.inner.reporter.as_deref(), data);
        if event.is_sampled() {
            Context::map_current(|cx| cx.set_last_event(*event.context()));
        }
    }

    /// Set the custom transaction name for this trace.
    ///
    /// Only top spans carry transaction-name responsibilities; calls on
    /// other spans are logged and ignored.
    pub fn set_transaction_name(&self, name: TransactionName) {
        if !self.inner.is_top {
            agent_debug!(name: "transaction_name_on_non_top_span", layer = self.inner.name.as_ref());
            return;
        }
        if let Ok(mut state) = self.inner.state.lock() {
            state.custom_name = Some(name);
        }
    }

    /// Resolve the transaction name for this trace.
    ///
    /// Preference order: the custom fixed name if set; the result of the
    /// custom name function if set (a failing function is logged and falls
    /// through); the default name computed at creation (`custom-<name>`, or
    /// empty for an unnamed entry span).
    pub fn transaction_name(&self) -> String {
        let (custom, default_name) = match self.inner.state.lock() {
            Ok(state) => (state.custom_name.clone(), state.default_name.clone()),
            Err(_) => return String::new(),
        };

        match custom {
            Some(TransactionName::Fixed(name)) => name,
            Some(TransactionName::Computed(compute)) => match compute() {
                Ok(name) => name,
                Err(err) => {
                    agent_warn!(
                        name: "transaction_name_fn_failed",
                        layer = self.inner.name.as_ref(),
                        error = err.to_string()
                    );
                    default_name
                }
            },
            None => default_name,
        }
    }

    /// Hand a transaction summary to the reporter bridge.
    ///
    /// The bridge may override the proposed name; if its answer is not a
    /// usable string the proposed name is kept, with a logged warning.
    pub fn send_non_http_span(
        &self,
        txname: &str,
        duration: Duration,
        has_error: bool,
    ) -> String {
        match self.inner.reporter.as_deref() {
            Some(reporter) => match reporter.send_non_http_span(txname, duration, has_error) {
                Ok(name) if !name.is_empty() => name,
                Ok(_) => {
                    agent_warn!(name: "transaction_name_unusable", proposed = txname);
                    txname.to_string()
                }
                Err(err) => {
                    agent_warn!(name: "send_non_http_span_failed", error = err.to_string());
                    txname.to_string()
                }
            },
            None => {
                agent_debug!(name: "send_non_http_span_no_reporter");
                txname.to_string()
            }
        }
    }

    // Metrics finalization shared by the sync exit path and async
    // completions: resolve the transaction name through the bridge and
    // attach the answer to the not-yet-reported exit event.
    pub(crate) fn finalize(&self, start: Option<Instant>) {
        if !(self.inner.is_top && self.inner.metrics) {
            return;
        }
        let Some(start) = start else {
            return;
        };

        let duration = start.elapsed();
        let has_error = self
            .inner
            .state
            .lock()
            .map(|state| state.exit.error().is_some())
            .unwrap_or(false);
        let txname = self.transaction_name();
        let final_name = self.send_non_http_span(&txname, duration, has_error);
        if let Ok(mut state) = self.inner.state.lock() {
            state.exit.set([KeyValue::new("TransactionName", final_name)]);
        }
    }

    #[cfg(test)]
    pub(crate) fn with_entry_event<T>(&self, f: impl FnOnce(&Event) -> T) -> Option<T> {
        self.inner.state.lock().ok().map(|state| f(&state.entry))
    }

    #[cfg(test)]
    pub(crate) fn with_exit_event<T>(&self, f: impl FnOnce(&Event) -> T) -> Option<T> {
        self.inner.state.lock().ok().map(|state| f(&state.exit))
    }
}

// Pairs entry with exactly one exit on every path out of `run_sync`,
// including unwinding out of the wrapped function.
struct ExitGuard {
    span: Span,
    start: Option<Instant>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.span.finalize(self.start);
        self.span.exit();
    }
}

/// Executes a closure with a reference to this logical request's current
/// span, if one is live.
///
/// # Examples
///
/// ```
/// use spancore::trace::get_active_span;
/// use spancore::KeyValue;
///
/// fn my_other_function() {
///     // annotate the current span from anywhere below the probe
///     get_active_span(|span| {
///         if let Some(span) = span {
///             span.info([KeyValue::new("happened", true)]);
///         }
///     });
/// }
/// ```
pub fn get_active_span<F, T>(f: F) -> T
where
    F: FnOnce(Option<&Span>) -> T,
{
    let span = Context::map_current(|cx| cx.last_span().or_else(|| cx.active_span()));
    f(span.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{InMemoryReporter, SampleSource};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;

    fn sampled_settings(reporter: &InMemoryReporter) -> TraceSettings {
        TraceSettings::default().with_reporter(Arc::new(reporter.clone()))
    }

    fn events_of_kind(reporter: &InMemoryReporter, kind: EventKind) -> Vec<Event> {
        reporter
            .get_finished_events()
            .unwrap()
            .into_iter()
            .filter(|event| event.kind() == kind)
            .collect()
    }

    #[test]
    fn rejects_empty_name() {
        let settings = TraceSettings::default();
        assert!(matches!(
            Span::new("", &settings, []),
            Err(TraceError::EmptyName)
        ));
    }

    #[test]
    fn entry_span_may_be_unnamed() {
        let settings = TraceSettings::default();
        let span = Span::entry("", &settings, []).unwrap();
        assert_eq!(span.transaction_name(), "");
    }

    #[test]
    fn sample_flag_fixed_at_construction() {
        let settings = TraceSettings::default().with_sample(false);
        let span = Span::entry("http", &settings, []).unwrap();
        assert!(!span.is_sampled());

        let settings = TraceSettings::default().with_sample(true);
        let span = Span::entry("http", &settings, []).unwrap();
        assert!(span.is_sampled());
    }

    #[test]
    fn entry_event_carries_sample_annotations() {
        let settings = TraceSettings::default()
            .with_source(SampleSource::Remote)
            .with_rate(300_000);
        let span = Span::entry("http", &settings, []).unwrap();
        span.with_entry_event(|entry| {
            assert_eq!(entry.data().get("SampleSource"), Some(&3_i64.into()));
            assert_eq!(entry.data().get("SampleRate"), Some(&300_000_i64.into()));
        })
        .unwrap();
    }

    #[test]
    fn continues_an_inbound_trace_context() {
        let inbound: EventContext = "58406520a006649127e371903a2de979-27e371903a2de979-01"
            .parse()
            .unwrap();
        let settings = TraceSettings::default().with_trace_context(inbound);
        let span = Span::entry("http", &settings, []).unwrap();
        assert_eq!(span.entry_context().task_id(), inbound.task_id());
        assert!(span.is_sampled());
        span.with_entry_event(|entry| {
            assert_eq!(entry.edges(), &[inbound.op_id()]);
        })
        .unwrap();
    }

    #[test]
    fn new_trace_has_no_inbound_edge() {
        let span = Span::entry("http", &TraceSettings::default().with_edge(false), []).unwrap();
        span.with_entry_event(|entry| assert!(entry.edges().is_empty()))
            .unwrap();
    }

    #[test]
    fn run_sync_reports_entry_and_exit_exactly_once() {
        let reporter = InMemoryReporter::new();
        let span = Span::entry("http", &sampled_settings(&reporter), []).unwrap();

        let result: Result<i32, String> = span.run_sync(|| Ok(7));
        assert_eq!(result.unwrap(), 7);

        let events = reporter.get_finished_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), EventKind::Entry);
        assert_eq!(events[1].kind(), EventKind::Exit);
        // the exit event always edges back to its own entry
        assert!(events[1].edges().contains(&events[0].context().op_id()));
    }

    #[test]
    fn run_sync_returns_the_error_unchanged_after_capture() {
        let reporter = InMemoryReporter::new();
        let span = Span::entry("http", &sampled_settings(&reporter), []).unwrap();

        let result: Result<(), String> = span.run_sync(|| Err("connection refused".to_string()));
        assert_eq!(result.unwrap_err(), "connection refused");

        let exits = events_of_kind(&reporter, EventKind::Exit);
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].error().unwrap().message(), "connection refused");
    }

    #[test]
    fn run_sync_pairs_exit_even_on_unwind() {
        let reporter = InMemoryReporter::new();
        let span = Span::entry("http", &sampled_settings(&reporter), []).unwrap();

        let caught = catch_unwind(AssertUnwindSafe(|| {
            span.run_sync(|| -> Result<(), String> { panic!("kaboom") })
        }));
        assert!(caught.is_err());

        let events = reporter.get_finished_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind(), EventKind::Exit);
    }

    #[test]
    fn ignored_errors_never_reach_the_exit_event() {
        let reporter = InMemoryReporter::new();
        let span = Span::entry("http", &sampled_settings(&reporter), []).unwrap();
        span.set_ignore_errors(|err| err.message().contains("retryable"));

        let result: Result<(), String> = span.run_sync(|| Err("retryable timeout".to_string()));
        assert!(result.is_err());

        let exits = events_of_kind(&reporter, EventKind::Exit);
        assert!(exits[0].error().is_none());
    }

    #[test]
    fn unsampled_trace_reports_nothing() {
        let reporter = InMemoryReporter::new();
        let settings = sampled_settings(&reporter).with_sample(false);
        let span = Span::entry("http", &settings, []).unwrap();

        let result: Result<(), String> = span.run_sync(|| Ok(()));
        assert!(result.is_ok());
        assert!(reporter.get_finished_events().unwrap().is_empty());
    }

    #[test]
    fn unsampled_descendants_share_one_skeleton() {
        let settings = TraceSettings::default().with_sample(false);
        let top = Span::entry("", &settings, []).unwrap();

        let d1 = top.descend("a", []).unwrap();
        let d2 = d1.descend("b", []).unwrap();
        let d3 = d2.descend("c", []).unwrap();

        assert!(d1.same_as(&d2));
        assert!(d2.same_as(&d3));
        assert!(d3.is_skeleton());
        assert_eq!(d3.name(), SKELETON_NAME);
        assert_eq!(d3.reuse_count(), 3);
    }

    #[test]
    fn skeleton_annotations_never_outlive_an_enter_exit_cycle() {
        let settings = TraceSettings::default().with_sample(false);
        let top = Span::entry("http", &settings, []).unwrap();
        let skeleton = top.descend("child", []).unwrap();

        for _ in 0..3 {
            skeleton.set([KeyValue::new("accumulated", true)]);
            skeleton.enter();
            assert_eq!(skeleton.with_entry_event(|e| e.data().len()).unwrap(), 0);
            skeleton.set([KeyValue::new("more", 1)]);
            skeleton.exit();
            assert_eq!(skeleton.with_entry_event(|e| e.data().len()).unwrap(), 0);
            assert_eq!(skeleton.with_exit_event(|e| e.data().len()).unwrap(), 0);
        }
    }

    #[test]
    fn sampled_descend_chains_off_the_live_event() {
        let reporter = InMemoryReporter::new();
        let top = Span::entry("http", &sampled_settings(&reporter), []).unwrap();

        let result: Result<(), String> = top.run_sync(|| {
            let child = top.descend("db", []).unwrap();
            let inner: Result<(), String> = child.run_sync(|| Ok(()));
            assert!(inner.is_ok());
            Ok(())
        });
        assert!(result.is_ok());

        let events = reporter.get_finished_events().unwrap();
        assert_eq!(events.len(), 4);
        let top_entry = &events[0];
        let child_entry = &events[1];
        let child_exit = &events[2];
        let top_exit = &events[3];

        // the child descends from the live event, the top span's entry
        assert_eq!(child_entry.edges(), &[top_entry.context().op_id()]);
        // the top exit captures the interposed child work with an extra edge
        assert!(top_exit.edges().contains(&top_entry.context().op_id()));
        assert!(top_exit.edges().contains(&child_exit.context().op_id()));
    }

    #[test]
    fn exit_without_live_event_keeps_the_default_edge() {
        // no context scope is attached, so `last` stays null
        let reporter = InMemoryReporter::new();
        let span = Span::entry("lonely", &sampled_settings(&reporter), []).unwrap();
        span.enter();
        span.exit();

        let events = reporter.get_finished_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].edges(), &[events[0].context().op_id()]);
    }

    #[test]
    fn exit_without_edge_ignores_the_live_event() {
        let reporter = InMemoryReporter::new();
        let _guard = Context::current().with_trace_scope().attach();
        let span = Span::entry("job", &sampled_settings(&reporter), []).unwrap();
        span.enter();
        span.info([KeyValue::new("step", 1)]);
        span.exit_without_edge(std::iter::empty());

        let exits = events_of_kind(&reporter, EventKind::Exit);
        assert_eq!(exits[0].edges().len(), 1);
    }

    #[test]
    fn info_and_error_follow_the_live_event() {
        let reporter = InMemoryReporter::new();
        let span = Span::entry("http", &sampled_settings(&reporter), []).unwrap();

        let result: Result<(), String> = span.run_sync(|| {
            span.info([KeyValue::new("rows", 42_i64)]);
            span.error("deadline exceeded");
            Ok(())
        });
        assert!(result.is_ok());

        let events = reporter.get_finished_events().unwrap();
        assert_eq!(events.len(), 4);
        let info = &events[1];
        let error = &events[2];
        assert_eq!(info.kind(), EventKind::Info);
        assert_eq!(info.data().get("rows"), Some(&42_i64.into()));
        assert_eq!(error.edges(), &[info.context().op_id()]);
        assert_eq!(error.error().unwrap().message(), "deadline exceeded");
    }

    #[test]
    fn internal_events_need_a_predecessor() {
        let reporter = InMemoryReporter::new();
        let span = Span::entry("http", &sampled_settings(&reporter), []).unwrap();
        // no scope, no live event: logged and skipped
        span.info([KeyValue::new("ignored", true)]);
        assert!(reporter.get_finished_events().unwrap().is_empty());
    }

    #[test]
    fn to_error_normalization() {
        assert_eq!(Span::to_error("oops").unwrap().message(), "oops");

        let io: Box<dyn std::error::Error + Send + Sync> =
            Box::new(std::io::Error::new(std::io::ErrorKind::Other, "io down"));
        let err = Span::to_error(io).unwrap();
        assert_eq!(err.message(), "io down");
        assert!(std::error::Error::source(&err).is_some());

        assert!(Span::to_error(ErrorValue::Other).is_none());
    }

    #[test]
    fn transaction_name_for_named_entry_span() {
        let span = Span::entry("http", &TraceSettings::default(), []).unwrap();
        assert_eq!(span.transaction_name(), "custom-http");
    }

    #[test]
    fn transaction_name_precedence() {
        let span = Span::entry("http", &TraceSettings::default(), []).unwrap();

        span.set_transaction_name(TransactionName::computed(|| Ok("computed-name".into())));
        assert_eq!(span.transaction_name(), "computed-name");

        span.set_transaction_name(TransactionName::fixed("fixed-name"));
        assert_eq!(span.transaction_name(), "fixed-name");
    }

    #[test]
    fn failing_transaction_name_fn_falls_through_to_default() {
        let span = Span::entry("http", &TraceSettings::default(), []).unwrap();
        span.set_transaction_name(TransactionName::computed(|| Err("no name".into())));
        assert_eq!(span.transaction_name(), "custom-http");
    }

    #[test]
    fn transaction_name_ignored_on_non_top_spans() {
        let top = Span::entry("http", &TraceSettings::default(), []).unwrap();
        let child = top.descend("db", []).unwrap();
        child.set_transaction_name(TransactionName::fixed("nope"));
        assert_eq!(child.transaction_name(), "");
    }

    #[test]
    fn metrics_exit_records_a_transaction() {
        let reporter = InMemoryReporter::new();
        let settings = sampled_settings(&reporter).with_metrics(true);
        let span = Span::entry("order", &settings, []).unwrap();

        let result: Result<(), String> = span.run_sync(|| Ok(()));
        assert!(result.is_ok());

        let transactions = reporter.get_transactions().unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].name, "custom-order");
        assert!(!transactions[0].has_error);

        let exits = events_of_kind(&reporter, EventKind::Exit);
        assert_eq!(
            exits[0].data().get("TransactionName"),
            Some(&"custom-order".to_string().into())
        );
    }

    #[test]
    fn bridge_may_override_the_transaction_name() {
        let reporter = InMemoryReporter::new();
        reporter.rename_transactions("normalized-name");
        let settings = sampled_settings(&reporter).with_metrics(true);
        let span = Span::entry("order", &settings, []).unwrap();

        let result: Result<(), String> = span.run_sync(|| Ok(()));
        assert!(result.is_ok());

        let exits = events_of_kind(&reporter, EventKind::Exit);
        assert_eq!(
            exits[0].data().get("TransactionName"),
            Some(&"normalized-name".to_string().into())
        );
    }

    #[test]
    fn unusable_bridge_answer_keeps_the_proposed_name() {
        let reporter = InMemoryReporter::new();
        reporter.rename_transactions("");
        let settings = sampled_settings(&reporter).with_metrics(true);
        let span = Span::entry("order", &settings, []).unwrap();

        let result: Result<(), String> = span.run_sync(|| Ok(()));
        assert!(result.is_ok());

        let exits = events_of_kind(&reporter, EventKind::Exit);
        assert_eq!(
            exits[0].data().get("TransactionName"),
            Some(&"custom-order".to_string().into())
        );
    }

    #[test]
    fn run_async_defers_exit_to_the_completion() {
        let reporter = InMemoryReporter::new();
        let span = Span::entry("async-op", &sampled_settings(&reporter), []).unwrap();

        let completion = span.run_async(|completion| completion);
        assert!(span.is_async());
        // only the entry has been reported so far
        assert_eq!(reporter.get_finished_events().unwrap().len(), 1);
        assert!(!span.has_exited());

        completion.finish_ok();
        assert!(span.has_exited());
        let events = reporter.get_finished_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind(), EventKind::Exit);
    }

    #[test]
    fn completion_finishes_at_most_once() {
        let reporter = InMemoryReporter::new();
        let span = Span::entry("async-op", &sampled_settings(&reporter), []).unwrap();

        let completion = span.run_async(|completion| completion);
        completion.finish_ok();
        completion.finish_err("late failure");
        completion.finish_ok();

        let events = reporter.get_finished_events().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[1].error().is_none());
    }

    #[test]
    fn completion_error_lands_on_the_exit_event() {
        let reporter = InMemoryReporter::new();
        let span = Span::entry("async-op", &sampled_settings(&reporter), []).unwrap();

        let completion = span.run_async(|completion| completion);
        completion.finish_err("socket closed");

        let exits = events_of_kind(&reporter, EventKind::Exit);
        assert_eq!(exits[0].error().unwrap().message(), "socket closed");
    }

    #[test]
    fn unfinished_completion_never_reports_the_exit() {
        let reporter = InMemoryReporter::new();
        let span = Span::entry("async-op", &sampled_settings(&reporter), []).unwrap();

        {
            let _dropped = span.run_async(|completion| completion);
        }

        // the wrapped function never finished its completion: the exit
        // event is never reported
        let events = reporter.get_finished_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Entry);
        assert!(!span.has_exited());
    }

    #[test]
    fn async_scope_is_released_with_the_synchronous_turn() {
        let reporter = InMemoryReporter::new();
        let span = Span::entry("async-op", &sampled_settings(&reporter), []).unwrap();

        let _completion = span.run_async(|completion| {
            assert!(Context::current().has_scope());
            completion
        });
        assert!(!Context::current().has_scope());
    }

    #[test]
    fn completion_handler_bypasses_span_exit() {
        let reporter = InMemoryReporter::new();
        let span = Span::entry("legacy-op", &sampled_settings(&reporter), []).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let handler_ran = ran.clone();
        let completion = span.run_async_with_handler(
            |completion| completion,
            move || {
                handler_ran.fetch_add(1, Ordering::SeqCst);
            },
        );
        completion.finish_ok();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        // the handler replaced the exit sequence entirely
        assert_eq!(reporter.get_finished_events().unwrap().len(), 1);
        assert!(!span.has_exited());
    }

    #[test]
    fn async_metrics_finalize_on_completion() {
        let reporter = InMemoryReporter::new();
        let settings = sampled_settings(&reporter).with_metrics(true);
        let span = Span::entry("async-order", &settings, []).unwrap();

        let completion = span.run_async(|completion| completion);
        completion.finish_ok();

        let transactions = reporter.get_transactions().unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].name, "custom-async-order");
    }

    #[test]
    fn active_span_visible_inside_run_sync() {
        let reporter = InMemoryReporter::new();
        let span = Span::entry("http", &sampled_settings(&reporter), []).unwrap();

        let result: Result<(), String> = span.run_sync(|| {
            get_active_span(|active| {
                assert!(active.unwrap().same_as(&span));
            });
            Ok(())
        });
        assert!(result.is_ok());
    }

    #[test]
    fn span_counters_advance() {
        let before = stats::snapshot();
        let span = Span::entry("counted", &TraceSettings::default(), []).unwrap();
        let result: Result<(), String> = span.run_sync(|| Ok(()));
        assert!(result.is_ok());
        let after = stats::snapshot();
        assert!(after.spans_created > before.spans_created);
        assert!(after.top_spans_created > before.top_spans_created);
        assert!(after.top_spans_exited > before.top_spans_exited);
    }
}

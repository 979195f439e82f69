//! Events are the reportable points of a trace.
//!
//! A [`Span`] is bounded by an entry and an exit `Event`, and may report
//! internal events between them. Each event carries the causal identity of
//! the trace it belongs to and an edge list naming the events that causally
//! precede it. Once an event has been handed to the reporter bridge it is
//! frozen: further edits are ignored.
//!
//! [`Span`]: crate::trace::Span
use crate::common::{Key, KeyValue, Value};
use crate::trace::{EventContext, RandomIdGenerator, Reporter, SpanError};
use crate::{agent_debug, agent_warn};
use std::borrow::Cow;
use std::collections::HashMap;

/// Whether an event marks span entry, span exit, or an internal annotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Marks the beginning of a span.
    Entry,
    /// Marks the end of a span.
    Exit,
    /// An annotation between entry and exit (info or error data).
    Info,
}

impl EventKind {
    /// The wire label for this kind of event.
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Entry => "entry",
            EventKind::Exit => "exit",
            EventKind::Info => "info",
        }
    }
}

/// A single reportable point in a trace.
#[derive(Clone, Debug)]
pub struct Event {
    name: Cow<'static, str>,
    kind: EventKind,
    context: EventContext,
    edges: Vec<crate::trace::OpId>,
    data: HashMap<Key, Value>,
    error: Option<SpanError>,
    reported: bool,
}

impl Event {
    /// Create a new `Event` causally following `predecessor`.
    ///
    /// The event inherits the predecessor's task id and trace flags and is
    /// assigned a fresh operation id. When `edge` is set and the predecessor
    /// has a valid operation id, the new event's edge list starts with it.
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        kind: EventKind,
        predecessor: &EventContext,
        edge: bool,
    ) -> Self {
        let op_id = RandomIdGenerator::default().new_op_id();
        let context = EventContext::new(predecessor.task_id(), op_id, predecessor.trace_flags());
        let mut edges = Vec::new();
        if edge && predecessor.op_id().is_valid() {
            edges.push(predecessor.op_id());
        }
        Event {
            name: name.into(),
            kind,
            context,
            edges,
            data: HashMap::new(),
            error: None,
            reported: false,
        }
    }

    /// The event name (the layer it belongs to).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is an entry, exit, or internal event.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The causal identity of this event.
    pub fn context(&self) -> &EventContext {
        &self.context
    }

    /// Operation ids of the events causally preceding this one.
    pub fn edges(&self) -> &[crate::trace::OpId] {
        &self.edges
    }

    /// The annotation data accumulated so far.
    pub fn data(&self) -> &HashMap<Key, Value> {
        &self.data
    }

    /// The application error attached to this event, if any.
    pub fn error(&self) -> Option<&SpanError> {
        self.error.as_ref()
    }

    /// Returns `true` if the `sampled` flag of the owning trace is set.
    pub fn is_sampled(&self) -> bool {
        self.context.is_sampled()
    }

    /// Returns `true` once the event has been handed to the reporter bridge.
    pub fn has_reported(&self) -> bool {
        self.reported
    }

    /// Merge key/value pairs into the annotation mapping without reporting.
    ///
    /// Ignored with a log line once the event has been reported.
    pub fn set(&mut self, data: impl IntoIterator<Item = KeyValue>) {
        if self.reported {
            agent_debug!(name: "event_set_after_report", layer = self.name.as_ref());
            return;
        }
        for KeyValue { key, value } in data {
            self.data.insert(key, value);
        }
    }

    pub(crate) fn add_edge(&mut self, op_id: crate::trace::OpId) {
        if self.reported {
            agent_debug!(name: "event_edge_after_report", layer = self.name.as_ref());
            return;
        }
        if op_id.is_valid() && !self.edges.contains(&op_id) {
            self.edges.push(op_id);
        }
    }

    pub(crate) fn set_error(&mut self, error: SpanError) {
        if self.reported {
            agent_debug!(name: "event_error_after_report", layer = self.name.as_ref());
            return;
        }
        self.error = Some(error);
    }

    pub(crate) fn clear_data(&mut self) {
        self.data.clear();
        self.reported = false;
        self.error = None;
    }

    /// Merge `extra` into the annotation mapping and hand the event to the
    /// reporter bridge.
    ///
    /// Reporting happens at most once per event and must never disturb
    /// instrumented code: a second call, a missing bridge, or a bridge
    /// failure are all logged and swallowed. Events of unsampled traces are
    /// marked reported without ever reaching the bridge.
    pub fn report(
        &mut self,
        reporter: Option<&dyn Reporter>,
        extra: impl IntoIterator<Item = KeyValue>,
    ) {
        if self.reported {
            agent_warn!(name: "event_reported_twice", layer = self.name.as_ref(), label = self.kind.label());
            return;
        }
        self.set(extra);
        self.reported = true;

        if !self.is_sampled() {
            return;
        }

        match reporter {
            Some(reporter) => {
                if let Err(err) = reporter.report_event(self) {
                    agent_warn!(
                        name: "event_report_failed",
                        layer = self.name.as_ref(),
                        label = self.kind.label(),
                        error = err.to_string()
                    );
                }
            }
            None => {
                agent_debug!(name: "event_report_no_reporter", layer = self.name.as_ref());
            }
        }
    }
}

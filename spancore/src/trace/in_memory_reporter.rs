use crate::trace::{Event, Reporter, TraceError, TraceResult};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A transaction summary recorded by [`InMemoryReporter`].
#[derive(Clone, Debug)]
pub struct Transaction {
    /// The transaction name the bridge recorded.
    pub name: String,
    /// Elapsed wall time of the top span.
    pub duration: Duration,
    /// Whether the top span exited with an error.
    pub has_error: bool,
}

/// An in-memory reporter that stores finished events in memory.
///
/// This reporter is useful for testing and debugging purposes. Events can be
/// retrieved using the `get_finished_events` method.
///
/// # Example
///
/// ```
/// use spancore::trace::{InMemoryReporter, Span, TraceSettings};
/// use std::sync::Arc;
///
/// let reporter = InMemoryReporter::new();
/// let settings = TraceSettings::default().with_reporter(Arc::new(reporter.clone()));
///
/// let span = Span::entry("say-hello", &settings, []).unwrap();
/// let greeting: Result<_, std::io::Error> = span.run_sync(|| Ok("hello"));
/// assert!(greeting.is_ok());
///
/// let events = reporter.get_finished_events().unwrap();
/// for event in events {
///     println!("{event:?}");
/// }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryReporter {
    events: Arc<Mutex<Vec<Event>>>,
    transactions: Arc<Mutex<Vec<Transaction>>>,
    rename: Arc<Mutex<Option<String>>>,
}

impl InMemoryReporter {
    /// Create a new in-memory reporter.
    pub fn new() -> Self {
        InMemoryReporter::default()
    }

    /// Have `send_non_http_span` answer with `name` instead of echoing the
    /// proposed transaction name. An empty override exercises the caller's
    /// unusable-response fallback.
    pub fn rename_transactions(&self, name: impl Into<String>) {
        if let Ok(mut rename) = self.rename.lock() {
            *rename = Some(name.into());
        }
    }

    /// Returns the finished events as a vector of `Event`.
    ///
    /// # Errors
    ///
    /// Returns a `TraceError` if the internal lock cannot be acquired.
    pub fn get_finished_events(&self) -> TraceResult<Vec<Event>> {
        self.events
            .lock()
            .map(|events| events.clone())
            .map_err(TraceError::from_lock)
    }

    /// Returns the recorded transaction summaries.
    pub fn get_transactions(&self) -> TraceResult<Vec<Transaction>> {
        self.transactions
            .lock()
            .map(|txns| txns.clone())
            .map_err(TraceError::from_lock)
    }

    /// Clears the recorded events and transactions.
    pub fn reset(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
        if let Ok(mut txns) = self.transactions.lock() {
            txns.clear();
        }
    }
}

impl Reporter for InMemoryReporter {
    fn report_event(&self, event: &Event) -> TraceResult<()> {
        self.events
            .lock()
            .map(|mut events| events.push(event.clone()))
            .map_err(TraceError::from_lock)
    }

    fn send_non_http_span(
        &self,
        txname: &str,
        duration: Duration,
        has_error: bool,
    ) -> TraceResult<String> {
        let name = self
            .rename
            .lock()
            .ok()
            .and_then(|rename| rename.clone())
            .unwrap_or_else(|| txname.to_string());
        self.transactions
            .lock()
            .map(|mut txns| {
                txns.push(Transaction {
                    name: name.clone(),
                    duration,
                    has_error,
                })
            })
            .map_err(TraceError::from_lock)?;
        Ok(name)
    }
}

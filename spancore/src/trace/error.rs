//! Error values attached to spans and events.
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// A normalized application error carried on an event.
///
/// Spans do not interpret errors, they only record them: a `SpanError` is a
/// message plus an optional source, cheap to clone because reported events
/// may be snapshotted by the reporter bridge.
#[derive(Clone)]
pub struct SpanError {
    message: String,
    source: Option<Arc<dyn Error + Send + Sync>>,
}

impl SpanError {
    /// Create a new error from a bare message.
    pub fn new(message: impl Into<String>) -> Self {
        SpanError {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an existing error unchanged, keeping it as the source.
    pub fn from_error(err: impl Error + Send + Sync + 'static) -> Self {
        SpanError {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }

    fn from_boxed(err: Box<dyn Error + Send + Sync>) -> Self {
        SpanError {
            message: err.to_string(),
            source: Some(Arc::from(err)),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for SpanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for SpanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanError")
            .field("message", &self.message)
            .finish()
    }
}

impl Error for SpanError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|src| src.as_ref() as &(dyn Error + 'static))
    }
}

/// A value offered to [`Span::to_error`] for normalization.
///
/// Instrumented code reports failure in whatever shape it has on hand: a
/// message, a real error, or something that is not an error at all. The
/// variants make that explicit instead of sniffing types at runtime.
///
/// [`Span::to_error`]: crate::trace::Span::to_error
#[non_exhaustive]
pub enum ErrorValue {
    /// A bare message, normalized into a new [`SpanError`].
    Message(String),
    /// An error value, kept unchanged.
    Error(Box<dyn Error + Send + Sync>),
    /// Not an error; normalizes to nothing.
    Other,
}

impl ErrorValue {
    pub(crate) fn normalize(self) -> Option<SpanError> {
        match self {
            ErrorValue::Message(message) => Some(SpanError::new(message)),
            ErrorValue::Error(err) => Some(SpanError::from_boxed(err)),
            ErrorValue::Other => None,
        }
    }
}

impl fmt::Debug for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorValue::Message(message) => f.debug_tuple("Message").field(message).finish(),
            ErrorValue::Error(err) => f.debug_tuple("Error").field(&err.to_string()).finish(),
            ErrorValue::Other => f.write_str("Other"),
        }
    }
}

impl From<&str> for ErrorValue {
    fn from(message: &str) -> Self {
        ErrorValue::Message(message.to_string())
    }
}

impl From<String> for ErrorValue {
    fn from(message: String) -> Self {
        ErrorValue::Message(message)
    }
}

impl From<Box<dyn Error + Send + Sync>> for ErrorValue {
    fn from(err: Box<dyn Error + Send + Sync>) -> Self {
        ErrorValue::Error(err)
    }
}

impl From<SpanError> for ErrorValue {
    fn from(err: SpanError) -> Self {
        ErrorValue::Error(Box::new(err))
    }
}

/// Per-span predicate deciding whether an application error should be
/// dropped before it ever reaches the exit event.
pub type IgnoreErrorPredicate = Arc<dyn Fn(&SpanError) -> bool + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_normalizes_to_new_error() {
        let err = ErrorValue::from("boom").normalize().unwrap();
        assert_eq!(err.message(), "boom");
        assert!(err.source().is_none());
    }

    #[test]
    fn error_normalizes_to_itself() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = ErrorValue::Error(Box::new(io)).normalize().unwrap();
        assert_eq!(err.message(), "disk on fire");
        assert!(err.source().is_some());
    }

    #[test]
    fn other_normalizes_to_none() {
        assert!(ErrorValue::Other.normalize().is_none());
    }
}

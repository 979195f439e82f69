//! Trace settings
//!
//! Settings carry the upstream sampling decision into span construction.
//! They are computed outside this crate (by the sampling decision engine and
//! configuration loading); overrides for local runs can be picked up from
//! the environment.
use crate::agent_warn;
use crate::trace::{EventContext, Reporter};
use std::env;
use std::str::FromStr;
use std::sync::Arc;

/// Sample rates are expressed in parts per million.
pub const MAX_SAMPLE_RATE: u32 = 1_000_000;

/// Where the effective sample rate came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleSource {
    /// No decision source recorded.
    Unset,
    /// Rate read from a local configuration file.
    File,
    /// Built-in default rate.
    Default,
    /// Rate pushed by the remote decision engine.
    Remote,
}

impl SampleSource {
    /// Integer form used when annotating entry events.
    pub fn as_i64(&self) -> i64 {
        match self {
            SampleSource::Unset => 0,
            SampleSource::File => 1,
            SampleSource::Default => 2,
            SampleSource::Remote => 3,
        }
    }
}

/// Per-trace settings resolved before the root span is created.
///
/// `trace_context` is the inbound causal id when this process continues a
/// trace started upstream; when absent a fresh task id is synthesized and
/// tagged with `do_sample`. The sample flag a span reads from these settings
/// is fixed for the span's entire life.
#[derive(Clone, Debug)]
pub struct TraceSettings {
    /// Inbound causal context, if the trace continues one from upstream.
    pub trace_context: Option<EventContext>,
    /// Whether the entry event should edge back to the inbound context.
    /// Only brand-new top-level traces with no inbound context set this to
    /// `false`.
    pub edge: bool,
    /// Sample decision for traces this process starts.
    pub do_sample: bool,
    /// Whether top spans should produce transaction metrics.
    pub do_metrics: bool,
    /// Where the sample rate came from.
    pub source: SampleSource,
    /// Effective sample rate, in parts per million.
    pub rate: u32,
    /// The reporter bridge finished events are handed to. `None` leaves the
    /// core fully functional with reporting reduced to log lines.
    pub reporter: Option<Arc<dyn Reporter>>,
}

impl Default for TraceSettings {
    fn default() -> Self {
        TraceSettings {
            trace_context: None,
            edge: true,
            do_sample: true,
            do_metrics: false,
            source: SampleSource::Default,
            rate: MAX_SAMPLE_RATE,
            reporter: None,
        }
    }
}

impl TraceSettings {
    /// Create settings with the built-in defaults.
    pub fn new() -> Self {
        TraceSettings::default()
    }

    /// Create default settings, honoring environment overrides.
    ///
    /// `SPANCORE_TRACING` may be `enabled` or `disabled`, and
    /// `SPANCORE_SAMPLE_RATE` an integer in `0..=1_000_000`. Invalid values
    /// are logged and replaced by the defaults.
    pub fn from_env() -> Self {
        let mut settings = TraceSettings::default();

        if let Ok(mode) = env::var("SPANCORE_TRACING") {
            match mode.as_str() {
                "enabled" => settings.do_sample = true,
                "disabled" => settings.do_sample = false,
                other => {
                    agent_warn!(
                        name: "settings_invalid_tracing_mode",
                        message = format!(
                            "SPANCORE_TRACING is set to '{other}', expected 'enabled' or 'disabled'. Using default: enabled"
                        )
                    );
                }
            }
        }

        if let Ok(rate) = env::var("SPANCORE_SAMPLE_RATE") {
            match u32::from_str(&rate) {
                Ok(rate) if rate <= MAX_SAMPLE_RATE => settings.rate = rate,
                _ => {
                    agent_warn!(
                        name: "settings_invalid_sample_rate",
                        message = format!(
                            "SPANCORE_SAMPLE_RATE is set to '{rate}', expected an integer in 0..={MAX_SAMPLE_RATE}. Using default: {MAX_SAMPLE_RATE}"
                        )
                    );
                }
            }
        }

        settings
    }

    /// Continue the trace described by an inbound causal context.
    pub fn with_trace_context(mut self, context: EventContext) -> Self {
        self.trace_context = Some(context);
        self
    }

    /// Control whether the entry event edges back to the inbound context.
    pub fn with_edge(mut self, edge: bool) -> Self {
        self.edge = edge;
        self
    }

    /// Set the sample decision for traces started by this process.
    pub fn with_sample(mut self, do_sample: bool) -> Self {
        self.do_sample = do_sample;
        self
    }

    /// Enable transaction metrics on top spans.
    pub fn with_metrics(mut self, do_metrics: bool) -> Self {
        self.do_metrics = do_metrics;
        self
    }

    /// Record where the sample rate came from.
    pub fn with_source(mut self, source: SampleSource) -> Self {
        self.source = source;
        self
    }

    /// Set the effective sample rate, clamping out-of-range values.
    pub fn with_rate(mut self, rate: u32) -> Self {
        if rate > MAX_SAMPLE_RATE {
            agent_warn!(
                name: "settings_rate_clamped",
                requested = rate,
                max = MAX_SAMPLE_RATE
            );
            self.rate = MAX_SAMPLE_RATE;
        } else {
            self.rate = rate;
        }
        self
    }

    /// Attach the reporter bridge.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }
}

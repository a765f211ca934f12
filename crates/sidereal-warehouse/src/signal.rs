//! Signal and attribute context identifiers.

use serde::{Deserialize, Serialize};

/// Telemetry signal type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Trace spans.
    Traces,
    /// Metrics (gauges, counters, histograms).
    Metrics,
    /// Log records.
    Logs,
}

impl Signal {
    /// Get the string representation for use in logs and errors.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Traces => "traces",
            Self::Metrics => "metrics",
            Self::Logs => "logs",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The kind of row an attribute set belongs to.
///
/// Each context owns its own family of typed attribute tables and one
/// catch-all table, and is the unit the promotion policy is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeContext {
    /// Resource-level attributes (service.name, etc.)
    Resource,
    /// Instrumentation scope attributes
    Scope,
    /// Log record attributes
    Log,
    /// Span attributes
    Span,
    /// Span event attributes
    SpanEvent,
    /// Span link attributes
    SpanLink,
    /// Metric data point attributes
    DataPoint,
}

impl AttributeContext {
    /// All contexts, in table-creation order.
    pub const ALL: [Self; 7] = [
        Self::Resource,
        Self::Scope,
        Self::Log,
        Self::Span,
        Self::SpanEvent,
        Self::SpanLink,
        Self::DataPoint,
    ];

    /// Table-name prefix for this context.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Resource => "resource",
            Self::Scope => "scope",
            Self::Log => "log",
            Self::Span => "span",
            Self::SpanEvent => "span_event",
            Self::SpanLink => "span_link",
            Self::DataPoint => "data_point",
        }
    }

    /// The signal that owns this context, if it belongs to exactly one.
    ///
    /// Resources and scopes are shared dimensions and return `None`.
    pub const fn signal(&self) -> Option<Signal> {
        match self {
            Self::Resource | Self::Scope => None,
            Self::Log => Some(Signal::Logs),
            Self::Span | Self::SpanEvent | Self::SpanLink => Some(Signal::Traces),
            Self::DataPoint => Some(Signal::Metrics),
        }
    }
}

impl std::fmt::Display for AttributeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//! Row types shared by the managers and the store backends.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::identity::IdentityHash;
use crate::value::{json_f64, AttributeValue, ValueType};

// ============================================================================
// Identifiers
// ============================================================================

/// Resource dimension identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub i64);

/// Scope dimension identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub i64);

/// Metric identity dimension identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricId(pub i64);

/// Interned attribute key identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub i32);

/// Fact row identifier (log record, span, event, link, data point).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactId(pub i64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Attribute keys and write sets
// ============================================================================

/// A row of the attribute key catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeKeyRecord {
    pub key_id: KeyId,
    pub key: String,
    /// Value type of the first promoted observation.
    pub declared_type: ValueType,
    /// Set once the key has been written to a typed, indexed table.
    pub searchable: bool,
}

/// Everything to write for one parent row's attributes.
///
/// Each key appears in at most one of the typed vectors or the catch-all
/// document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeWriteSet {
    pub strings: Vec<(KeyId, String)>,
    pub ints: Vec<(KeyId, i64)>,
    pub doubles: Vec<(KeyId, f64)>,
    pub bools: Vec<(KeyId, bool)>,
    pub bytes: Vec<(KeyId, Vec<u8>)>,
    /// Attribute name to tagged value.
    pub catch_all: serde_json::Map<String, serde_json::Value>,
}

impl AttributeWriteSet {
    /// Returns true if there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.typed_len() == 0 && self.catch_all.is_empty()
    }

    /// Number of typed entries across all value types.
    pub fn typed_len(&self) -> usize {
        self.strings.len() + self.ints.len() + self.doubles.len() + self.bools.len() + self.bytes.len()
    }

    /// Add a promoted value to the set for its type.
    pub fn push_typed(&mut self, key_id: KeyId, value: AttributeValue) {
        match value {
            AttributeValue::String(v) => self.strings.push((key_id, v)),
            AttributeValue::Int(v) => self.ints.push((key_id, v)),
            AttributeValue::Double(v) => self.doubles.push((key_id, v)),
            AttributeValue::Bool(v) => self.bools.push((key_id, v)),
            AttributeValue::Bytes(v) => self.bytes.push((key_id, v)),
            AttributeValue::Complex(_) => {}
        }
    }
}

/// Attributes read back for one parent row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredAttributes {
    /// Promoted attributes, by key name, sorted by key.
    pub typed: Vec<(String, AttributeValue)>,
    /// The catch-all document, if one was written.
    pub catch_all: Option<serde_json::Map<String, serde_json::Value>>,
}

impl StoredAttributes {
    /// Number of places the key is stored (0 or 1 when routing is exclusive).
    pub fn locations(&self, key: &str) -> usize {
        let typed = self.typed.iter().filter(|(k, _)| k == key).count();
        let catch_all = self
            .catch_all
            .as_ref()
            .is_some_and(|doc| doc.contains_key(key));
        typed + usize::from(catch_all)
    }

    /// Look up a promoted value.
    pub fn typed_value(&self, key: &str) -> Option<&AttributeValue> {
        self.typed.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

// ============================================================================
// Dimension rows
// ============================================================================

/// Outcome of an idempotent dimension upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observed<Id> {
    pub id: Id,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Whether this call inserted the row.
    pub created: bool,
}

/// A resource to insert if its hash is new.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewResource {
    pub hash: IdentityHash,
    pub service_name: Option<String>,
    pub service_namespace: Option<String>,
    pub schema_url: Option<String>,
    pub dropped_attribute_count: u32,
}

/// A stored resource row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub id: ResourceId,
    pub hash: IdentityHash,
    pub service_name: Option<String>,
    pub service_namespace: Option<String>,
    pub schema_url: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub dropped_attribute_count: u32,
}

/// A scope to insert if its hash is new.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewScope {
    pub hash: IdentityHash,
    pub name: String,
    pub version: Option<String>,
    pub schema_url: Option<String>,
    pub dropped_attribute_count: u32,
}

/// A stored scope row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeRecord {
    pub id: ScopeId,
    pub hash: IdentityHash,
    pub name: String,
    pub version: Option<String>,
    pub schema_url: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub dropped_attribute_count: u32,
}

/// Metric data kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    Gauge,
    Sum,
    Histogram,
    ExponentialHistogram,
    Summary,
}

impl MetricType {
    pub const ALL: [Self; 5] = [
        Self::Gauge,
        Self::Sum,
        Self::Histogram,
        Self::ExponentialHistogram,
        Self::Summary,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Sum => "sum",
            Self::Histogram => "histogram",
            Self::ExponentialHistogram => "exponential_histogram",
            Self::Summary => "summary",
        }
    }
}

impl std::str::FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown metric type '{s}'"))
    }
}

/// Aggregation temporality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Temporality {
    Unspecified,
    Delta,
    Cumulative,
}

impl Temporality {
    pub const ALL: [Self; 3] = [Self::Unspecified, Self::Delta, Self::Cumulative];

    /// Map the OTLP `AggregationTemporality` enum value.
    pub const fn from_otlp(value: i32) -> Self {
        match value {
            1 => Self::Delta,
            2 => Self::Cumulative,
            _ => Self::Unspecified,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Delta => "delta",
            Self::Cumulative => "cumulative",
        }
    }
}

impl std::str::FromStr for Temporality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown temporality '{s}'"))
    }
}

/// A metric variant to insert if its full hash is new.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMetric {
    pub metric_hash: IdentityHash,
    pub identity_hash: IdentityHash,
    pub name: String,
    pub metric_type: MetricType,
    pub unit: Option<String>,
    pub temporality: Temporality,
    pub is_monotonic: bool,
    pub description: Option<String>,
}

/// A stored metric variant row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricRecord {
    pub id: MetricId,
    pub metric_hash: IdentityHash,
    pub identity_hash: IdentityHash,
    pub name: String,
    pub metric_type: MetricType,
    pub unit: Option<String>,
    pub temporality: Temporality,
    pub is_monotonic: bool,
    pub description: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

// ============================================================================
// Fact rows
// ============================================================================

/// A log record fact row.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub resource_id: ResourceId,
    pub scope_id: Option<ScopeId>,
    pub time_unix_nano: u64,
    pub observed_time_unix_nano: u64,
    pub severity_number: i16,
    pub severity_text: Option<String>,
    /// Tagged JSON form of the body value.
    pub body: Option<serde_json::Value>,
    /// Soft correlation, never enforced.
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub flags: u32,
    pub dropped_attributes_count: u32,
}

/// A span fact row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanRow {
    pub resource_id: ResourceId,
    pub scope_id: Option<ScopeId>,
    pub trace_id: String,
    pub span_id: String,
    /// Soft correlation, never enforced.
    pub parent_span_id: Option<String>,
    pub trace_state: Option<String>,
    pub name: String,
    pub kind: i16,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    pub status_code: i16,
    pub status_message: Option<String>,
    pub flags: u32,
    pub dropped_attributes_count: u32,
    pub dropped_events_count: u32,
    pub dropped_links_count: u32,
}

/// A span event, child of a span row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanEventRow {
    pub span_row_id: FactId,
    pub time_unix_nano: u64,
    pub name: String,
    pub dropped_attributes_count: u32,
}

/// A span link, child of a span row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanLinkRow {
    pub span_row_id: FactId,
    /// Linked trace, soft correlation.
    pub trace_id: String,
    pub span_id: String,
    pub trace_state: Option<String>,
    pub flags: u32,
    pub dropped_attributes_count: u32,
}

/// Explicit-bucket histogram payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramValue {
    pub count: u64,
    #[serde(serialize_with = "json_f64::serialize_option")]
    pub sum: Option<f64>,
    #[serde(serialize_with = "json_f64::serialize_option")]
    pub min: Option<f64>,
    #[serde(serialize_with = "json_f64::serialize_option")]
    pub max: Option<f64>,
    pub bucket_counts: Vec<u64>,
    #[serde(serialize_with = "json_f64::serialize_slice")]
    pub explicit_bounds: Vec<f64>,
}

/// One side of an exponential histogram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExponentialBuckets {
    pub offset: i32,
    pub bucket_counts: Vec<u64>,
}

/// Exponential histogram payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExponentialHistogramValue {
    pub count: u64,
    #[serde(serialize_with = "json_f64::serialize_option")]
    pub sum: Option<f64>,
    #[serde(serialize_with = "json_f64::serialize_option")]
    pub min: Option<f64>,
    #[serde(serialize_with = "json_f64::serialize_option")]
    pub max: Option<f64>,
    pub scale: i32,
    pub zero_count: u64,
    #[serde(serialize_with = "json_f64::serialize")]
    pub zero_threshold: f64,
    pub positive: Option<ExponentialBuckets>,
    pub negative: Option<ExponentialBuckets>,
}

/// Summary payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryValue {
    pub count: u64,
    #[serde(serialize_with = "json_f64::serialize")]
    pub sum: f64,
    /// `(quantile, value)` pairs.
    #[serde(serialize_with = "json_f64::serialize_pairs")]
    pub quantiles: Vec<(f64, f64)>,
}

/// Value carried by a metric data point.
#[derive(Debug, Clone, PartialEq)]
pub enum DataPointValue {
    Int(i64),
    Double(f64),
    /// A number point with no value set.
    Empty,
    Histogram(HistogramValue),
    ExponentialHistogram(ExponentialHistogramValue),
    Summary(SummaryValue),
}

impl DataPointValue {
    /// Stored `kind` column.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) | Self::Double(_) | Self::Empty => "number",
            Self::Histogram(_) => "histogram",
            Self::ExponentialHistogram(_) => "exponential_histogram",
            Self::Summary(_) => "summary",
        }
    }

    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Distribution document for non-number points.
    pub fn distribution(&self) -> Result<Option<serde_json::Value>, serde_json::Error> {
        match self {
            Self::Int(_) | Self::Double(_) | Self::Empty => Ok(None),
            Self::Histogram(h) => serde_json::to_value(h).map(Some),
            Self::ExponentialHistogram(h) => serde_json::to_value(h).map(Some),
            Self::Summary(s) => serde_json::to_value(s).map(Some),
        }
    }
}

/// A metric data point fact row.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPointRow {
    pub metric_id: MetricId,
    pub resource_id: ResourceId,
    pub scope_id: Option<ScopeId>,
    pub start_time_unix_nano: Option<u64>,
    pub time_unix_nano: u64,
    pub flags: u32,
    pub value: DataPointValue,
    pub exemplar_count: u32,
}

/// Row counts per fact table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactCounts {
    pub logs: u64,
    pub spans: u64,
    pub span_events: u64,
    pub span_links: u64,
    pub data_points: u64,
}

// ============================================================================
// Static reference data
// ============================================================================

/// OTel severity numbers (0-24) and their display names.
pub const SEVERITY_LEVELS: [(i16, &str); 25] = [
    (0, "UNSPECIFIED"),
    (1, "TRACE"),
    (2, "TRACE2"),
    (3, "TRACE3"),
    (4, "TRACE4"),
    (5, "DEBUG"),
    (6, "DEBUG2"),
    (7, "DEBUG3"),
    (8, "DEBUG4"),
    (9, "INFO"),
    (10, "INFO2"),
    (11, "INFO3"),
    (12, "INFO4"),
    (13, "WARN"),
    (14, "WARN2"),
    (15, "WARN3"),
    (16, "WARN4"),
    (17, "ERROR"),
    (18, "ERROR2"),
    (19, "ERROR3"),
    (20, "ERROR4"),
    (21, "FATAL"),
    (22, "FATAL2"),
    (23, "FATAL3"),
    (24, "FATAL4"),
];

/// OTLP span kinds.
pub const SPAN_KINDS: [(i16, &str); 6] = [
    (0, "UNSPECIFIED"),
    (1, "INTERNAL"),
    (2, "SERVER"),
    (3, "CLIENT"),
    (4, "PRODUCER"),
    (5, "CONSUMER"),
];

/// OTLP span status codes.
pub const STATUS_CODES: [(i16, &str); 3] = [(0, "UNSET"), (1, "OK"), (2, "ERROR")];

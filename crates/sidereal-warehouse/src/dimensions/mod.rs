//! Dimension managers.
//!
//! Each manager turns a raw identity (resource attributes, scope, metric
//! descriptor) into a stable row id. A hit in the process-local cache only
//! advances `last_seen`; a miss performs an idempotent upsert keyed by the
//! identity hash and rewrites the dimension's attributes. Each store call
//! commits on its own, so concurrent workers resolving the same new
//! dimension never wait on each other's transactions.

mod cache;
mod metric;
mod resource;
mod scope;

pub use cache::DimensionCache;
pub use metric::{MetricDescriptor, MetricDimensionManager};
pub use resource::{semconv, ResourceManager};
pub use scope::ScopeManager;

use crate::value::storable_text;

/// Treat an empty OTLP string as absent.
pub(crate) fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

/// An optional OTLP string as stored: absent when empty, NUL replaced.
pub(crate) fn stored_text(value: &str) -> Option<String> {
    non_empty(value).map(|v| storable_text(v).into_owned())
}

//! Durable storage backends.
//!
//! This module provides the traits the managers and orchestrators write
//! through. The primary implementation uses PostgreSQL, but an in-memory
//! implementation is provided for testing.
//!
//! Dimension writes (keys, resources, scopes, metrics and their attributes)
//! go straight to [`WarehouseStore`] and commit independently. Fact writes
//! go through a [`FactTransaction`] that commits or rolls back as one unit.

mod memory;
mod postgres;

use std::sync::Arc;
use std::time::Duration;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::StoreConfig;
use crate::error::WarehouseResult;
use crate::identity::IdentityHash;
use crate::model::{
    AttributeKeyRecord, AttributeWriteSet, DataPointRow, FactCounts, FactId, LogRow,
    MetricId, MetricRecord, NewMetric, NewResource, NewScope, Observed, ResourceId,
    ResourceRecord, ScopeId, ScopeRecord, SpanEventRow, SpanLinkRow, SpanRow, StoredAttributes,
};
use crate::signal::AttributeContext;
use crate::value::ValueType;

/// Backend for dimension rows, attribute rows and fact transactions.
///
/// Every dimension operation is an idempotent, independently committed
/// upsert. Concurrent callers racing on the same hash or key must converge
/// on one row without surfacing an error.
#[async_trait]
pub trait WarehouseStore: Send + Sync + std::fmt::Debug {
    /// Insert an attribute key or return the existing one.
    ///
    /// `declared_type` is only used on insert. `searchable` is OR-merged
    /// into an existing row, never cleared.
    async fn upsert_attribute_key(
        &self,
        key: &str,
        declared_type: ValueType,
        searchable: bool,
    ) -> WarehouseResult<AttributeKeyRecord>;

    /// Look up an attribute key by name.
    async fn attribute_key(&self, key: &str) -> WarehouseResult<Option<AttributeKeyRecord>>;

    /// Insert a resource keyed by hash, or advance `last_seen` on the
    /// existing row.
    async fn upsert_resource(
        &self,
        resource: &NewResource,
        seen_at: DateTime<Utc>,
    ) -> WarehouseResult<Observed<ResourceId>>;

    /// Advance `last_seen` of a known resource.
    async fn touch_resource(&self, id: ResourceId, seen_at: DateTime<Utc>) -> WarehouseResult<()>;

    /// Insert a scope keyed by hash, or advance `last_seen`.
    async fn upsert_scope(
        &self,
        scope: &NewScope,
        seen_at: DateTime<Utc>,
    ) -> WarehouseResult<Observed<ScopeId>>;

    /// Advance `last_seen` of a known scope.
    async fn touch_scope(&self, id: ScopeId, seen_at: DateTime<Utc>) -> WarehouseResult<()>;

    /// Insert a metric variant keyed by full hash, or advance `last_seen`.
    async fn upsert_metric(
        &self,
        metric: &NewMetric,
        seen_at: DateTime<Utc>,
    ) -> WarehouseResult<Observed<MetricId>>;

    /// Advance `last_seen` of a known metric variant.
    async fn touch_metric(&self, id: MetricId, seen_at: DateTime<Utc>) -> WarehouseResult<()>;

    /// Replace the stored attributes of a dimension row.
    ///
    /// Typed rows not present in `attributes` are removed, typed rows that
    /// are present are upserted, and the catch-all document is replaced
    /// (or removed if empty). The write commits on its own.
    async fn replace_attributes(
        &self,
        context: AttributeContext,
        parent_id: i64,
        attributes: &AttributeWriteSet,
    ) -> WarehouseResult<()>;

    /// Open a fact transaction.
    async fn begin(&self) -> WarehouseResult<Box<dyn FactTransaction>>;

    /// Get a resource by ID.
    async fn get_resource(&self, id: ResourceId) -> WarehouseResult<Option<ResourceRecord>>;

    /// Get a scope by ID.
    async fn get_scope(&self, id: ScopeId) -> WarehouseResult<Option<ScopeRecord>>;

    /// Get a metric variant by ID.
    async fn get_metric(&self, id: MetricId) -> WarehouseResult<Option<MetricRecord>>;

    /// All metric variants sharing an identity hash, oldest first.
    async fn list_metric_variants(
        &self,
        identity_hash: &IdentityHash,
    ) -> WarehouseResult<Vec<MetricId>>;

    /// Typed and catch-all attributes stored for one parent row.
    async fn load_attributes(
        &self,
        context: AttributeContext,
        parent_id: i64,
    ) -> WarehouseResult<StoredAttributes>;

    /// Row counts of every fact table.
    async fn fact_counts(&self) -> WarehouseResult<FactCounts>;
}

/// A single all-or-nothing fact write.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait FactTransaction: Send {
    /// Insert a log record.
    async fn insert_log(&mut self, row: &LogRow) -> WarehouseResult<FactId>;

    /// Insert a span.
    async fn insert_span(&mut self, row: &SpanRow) -> WarehouseResult<FactId>;

    /// Insert a span event.
    async fn insert_span_event(&mut self, row: &SpanEventRow) -> WarehouseResult<FactId>;

    /// Insert a span link.
    async fn insert_span_link(&mut self, row: &SpanLinkRow) -> WarehouseResult<FactId>;

    /// Insert a metric data point.
    async fn insert_data_point(&mut self, row: &DataPointRow) -> WarehouseResult<FactId>;

    /// Write attributes for a fact row created in this transaction.
    async fn write_attributes(
        &mut self,
        context: AttributeContext,
        parent_id: FactId,
        attributes: &AttributeWriteSet,
    ) -> WarehouseResult<()>;

    /// Commit every write.
    async fn commit(self: Box<Self>) -> WarehouseResult<()>;

    /// Discard every write.
    async fn rollback(self: Box<Self>) -> WarehouseResult<()>;
}

/// Create a store from configuration.
pub async fn create_store(config: &StoreConfig) -> WarehouseResult<Arc<dyn WarehouseStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreConfig::Postgres {
            url,
            max_connections,
            acquire_timeout_secs,
        } => {
            let store = PostgresStore::connect(
                url,
                *max_connections,
                Duration::from_secs(*acquire_timeout_secs),
            )
            .await?;
            Ok(Arc::new(store))
        }
    }
}

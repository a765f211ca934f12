//! In-memory warehouse store for testing.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{WarehouseError, WarehouseResult};
use crate::identity::IdentityHash;
use crate::model::{
    AttributeKeyRecord, AttributeWriteSet, DataPointRow, FactCounts, FactId, KeyId, LogRow,
    MetricId, MetricRecord, NewMetric, NewResource, NewScope, Observed, ResourceId,
    ResourceRecord, ScopeId, ScopeRecord, SpanEventRow, SpanLinkRow, SpanRow, StoredAttributes,
};
use crate::signal::AttributeContext;
use crate::value::{AttributeValue, ValueType};

use super::{FactTransaction, WarehouseStore};

type TypedTable = BTreeMap<(i64, KeyId), AttributeValue>;

#[derive(Debug, Default)]
struct Tables {
    keys: HashMap<String, AttributeKeyRecord>,
    key_names: HashMap<KeyId, String>,
    resources: BTreeMap<ResourceId, ResourceRecord>,
    resources_by_hash: HashMap<IdentityHash, ResourceId>,
    scopes: BTreeMap<ScopeId, ScopeRecord>,
    scopes_by_hash: HashMap<IdentityHash, ScopeId>,
    metrics: BTreeMap<MetricId, MetricRecord>,
    metrics_by_hash: HashMap<IdentityHash, MetricId>,
    /// One map per `{context}_attrs_{type}` table.
    typed: HashMap<(AttributeContext, ValueType), TypedTable>,
    /// One map per `{context}_attrs_other` table.
    catch_all: HashMap<(AttributeContext, i64), serde_json::Map<String, serde_json::Value>>,
    logs: BTreeMap<FactId, LogRow>,
    spans: BTreeMap<FactId, SpanRow>,
    span_events: BTreeMap<FactId, SpanEventRow>,
    span_links: BTreeMap<FactId, SpanLinkRow>,
    data_points: BTreeMap<FactId, DataPointRow>,
}

impl Tables {
    fn write_attributes(
        &mut self,
        context: AttributeContext,
        parent_id: i64,
        attributes: &AttributeWriteSet,
        replace: bool,
    ) {
        if replace {
            for value_type in ValueType::ALL {
                if let Some(table) = self.typed.get_mut(&(context, value_type)) {
                    table.retain(|(parent, _), _| *parent != parent_id);
                }
            }
            self.catch_all.remove(&(context, parent_id));
        }

        let mut put = |value_type: ValueType, key_id: KeyId, value: AttributeValue| {
            self.typed
                .entry((context, value_type))
                .or_default()
                .insert((parent_id, key_id), value);
        };
        for (key_id, v) in &attributes.strings {
            put(ValueType::String, *key_id, AttributeValue::String(v.clone()));
        }
        for (key_id, v) in &attributes.ints {
            put(ValueType::Int, *key_id, AttributeValue::Int(*v));
        }
        for (key_id, v) in &attributes.doubles {
            put(ValueType::Double, *key_id, AttributeValue::Double(*v));
        }
        for (key_id, v) in &attributes.bools {
            put(ValueType::Bool, *key_id, AttributeValue::Bool(*v));
        }
        for (key_id, v) in &attributes.bytes {
            put(ValueType::Bytes, *key_id, AttributeValue::Bytes(v.clone()));
        }

        if !attributes.catch_all.is_empty() {
            self.catch_all
                .insert((context, parent_id), attributes.catch_all.clone());
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: Mutex<Tables>,
    next_key_id: AtomicI64,
    next_dimension_id: AtomicI64,
    next_fact_id: AtomicI64,
    fail_next_commit: AtomicBool,
}

impl Inner {
    fn next(counter: &AtomicI64) -> i64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// In-memory warehouse store for testing.
///
/// This implementation is not suitable for production use as data is lost
/// when the process exits. Clones share the same tables, which lets tests
/// run independent managers against one store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next fact transaction commit fail and roll back.
    pub fn fail_next_commit(&self) {
        self.inner.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Number of resource rows.
    pub fn resource_count(&self) -> usize {
        self.inner.tables.lock().resources.len()
    }

    /// Number of scope rows.
    pub fn scope_count(&self) -> usize {
        self.inner.tables.lock().scopes.len()
    }

    /// Number of metric variant rows.
    pub fn metric_count(&self) -> usize {
        self.inner.tables.lock().metrics.len()
    }

    /// Number of attribute key rows.
    pub fn key_count(&self) -> usize {
        self.inner.tables.lock().keys.len()
    }

    /// Committed log rows in insertion order.
    pub fn logs(&self) -> Vec<(FactId, LogRow)> {
        Self::rows(&self.inner.tables.lock().logs)
    }

    /// Committed span rows in insertion order.
    pub fn spans(&self) -> Vec<(FactId, SpanRow)> {
        Self::rows(&self.inner.tables.lock().spans)
    }

    /// Committed span event rows in insertion order.
    pub fn span_events(&self) -> Vec<(FactId, SpanEventRow)> {
        Self::rows(&self.inner.tables.lock().span_events)
    }

    /// Committed span link rows in insertion order.
    pub fn span_links(&self) -> Vec<(FactId, SpanLinkRow)> {
        Self::rows(&self.inner.tables.lock().span_links)
    }

    /// Committed data point rows in insertion order.
    pub fn data_points(&self) -> Vec<(FactId, DataPointRow)> {
        Self::rows(&self.inner.tables.lock().data_points)
    }

    /// Number of tables (typed or catch-all) holding `key` for a parent.
    pub fn attribute_locations(&self, context: AttributeContext, parent_id: i64, key: &str) -> usize {
        let tables = self.inner.tables.lock();
        let typed = tables.keys.get(key).map_or(0, |record| {
            ValueType::ALL
                .iter()
                .filter(|vt| {
                    tables
                        .typed
                        .get(&(context, **vt))
                        .is_some_and(|t| t.contains_key(&(parent_id, record.key_id)))
                })
                .count()
        });
        let catch_all = tables
            .catch_all
            .get(&(context, parent_id))
            .is_some_and(|doc| doc.contains_key(key));
        typed + usize::from(catch_all)
    }

    /// Whether `key` is stored anywhere, for any parent, in any context.
    pub fn key_stored_anywhere(&self, key: &str) -> bool {
        let tables = self.inner.tables.lock();
        let in_catch_all = tables.catch_all.values().any(|doc| doc.contains_key(key));
        let in_typed = tables.keys.get(key).is_some_and(|record| {
            tables
                .typed
                .values()
                .any(|t| t.keys().any(|(_, key_id)| *key_id == record.key_id))
        });
        in_catch_all || in_typed
    }

    fn rows<T: Clone>(table: &BTreeMap<FactId, T>) -> Vec<(FactId, T)> {
        table.iter().map(|(id, row)| (*id, row.clone())).collect()
    }
}

#[async_trait]
impl WarehouseStore for MemoryStore {
    async fn upsert_attribute_key(
        &self,
        key: &str,
        declared_type: ValueType,
        searchable: bool,
    ) -> WarehouseResult<AttributeKeyRecord> {
        let mut tables = self.inner.tables.lock();
        if let Some(existing) = tables.keys.get_mut(key) {
            existing.searchable |= searchable;
            return Ok(existing.clone());
        }

        let key_id = i32::try_from(Inner::next(&self.inner.next_key_id))
            .map_err(|_| WarehouseError::internal("attribute key id space exhausted"))?;
        let record = AttributeKeyRecord {
            key_id: KeyId(key_id),
            key: key.to_owned(),
            declared_type,
            searchable,
        };
        tables.key_names.insert(record.key_id, record.key.clone());
        tables.keys.insert(record.key.clone(), record.clone());
        Ok(record)
    }

    async fn attribute_key(&self, key: &str) -> WarehouseResult<Option<AttributeKeyRecord>> {
        Ok(self.inner.tables.lock().keys.get(key).cloned())
    }

    async fn upsert_resource(
        &self,
        resource: &NewResource,
        seen_at: DateTime<Utc>,
    ) -> WarehouseResult<Observed<ResourceId>> {
        let mut tables = self.inner.tables.lock();
        if let Some(id) = tables.resources_by_hash.get(&resource.hash).copied() {
            let record = tables
                .resources
                .get_mut(&id)
                .ok_or_else(|| WarehouseError::internal(format!("resource {id} missing")))?;
            record.last_seen = record.last_seen.max(seen_at);
            return Ok(Observed {
                id,
                first_seen: record.first_seen,
                last_seen: record.last_seen,
                created: false,
            });
        }

        let id = ResourceId(Inner::next(&self.inner.next_dimension_id));
        tables.resources.insert(
            id,
            ResourceRecord {
                id,
                hash: resource.hash,
                service_name: resource.service_name.clone(),
                service_namespace: resource.service_namespace.clone(),
                schema_url: resource.schema_url.clone(),
                first_seen: seen_at,
                last_seen: seen_at,
                dropped_attribute_count: resource.dropped_attribute_count,
            },
        );
        tables.resources_by_hash.insert(resource.hash, id);
        Ok(Observed {
            id,
            first_seen: seen_at,
            last_seen: seen_at,
            created: true,
        })
    }

    async fn touch_resource(&self, id: ResourceId, seen_at: DateTime<Utc>) -> WarehouseResult<()> {
        if let Some(record) = self.inner.tables.lock().resources.get_mut(&id) {
            record.last_seen = record.last_seen.max(seen_at);
        }
        Ok(())
    }

    async fn upsert_scope(
        &self,
        scope: &NewScope,
        seen_at: DateTime<Utc>,
    ) -> WarehouseResult<Observed<ScopeId>> {
        let mut tables = self.inner.tables.lock();
        if let Some(id) = tables.scopes_by_hash.get(&scope.hash).copied() {
            let record = tables
                .scopes
                .get_mut(&id)
                .ok_or_else(|| WarehouseError::internal(format!("scope {id} missing")))?;
            record.last_seen = record.last_seen.max(seen_at);
            return Ok(Observed {
                id,
                first_seen: record.first_seen,
                last_seen: record.last_seen,
                created: false,
            });
        }

        let id = ScopeId(Inner::next(&self.inner.next_dimension_id));
        tables.scopes.insert(
            id,
            ScopeRecord {
                id,
                hash: scope.hash,
                name: scope.name.clone(),
                version: scope.version.clone(),
                schema_url: scope.schema_url.clone(),
                first_seen: seen_at,
                last_seen: seen_at,
                dropped_attribute_count: scope.dropped_attribute_count,
            },
        );
        tables.scopes_by_hash.insert(scope.hash, id);
        Ok(Observed {
            id,
            first_seen: seen_at,
            last_seen: seen_at,
            created: true,
        })
    }

    async fn touch_scope(&self, id: ScopeId, seen_at: DateTime<Utc>) -> WarehouseResult<()> {
        if let Some(record) = self.inner.tables.lock().scopes.get_mut(&id) {
            record.last_seen = record.last_seen.max(seen_at);
        }
        Ok(())
    }

    async fn upsert_metric(
        &self,
        metric: &NewMetric,
        seen_at: DateTime<Utc>,
    ) -> WarehouseResult<Observed<MetricId>> {
        let mut tables = self.inner.tables.lock();
        if let Some(id) = tables.metrics_by_hash.get(&metric.metric_hash).copied() {
            let record = tables
                .metrics
                .get_mut(&id)
                .ok_or_else(|| WarehouseError::internal(format!("metric {id} missing")))?;
            record.last_seen = record.last_seen.max(seen_at);
            return Ok(Observed {
                id,
                first_seen: record.first_seen,
                last_seen: record.last_seen,
                created: false,
            });
        }

        let id = MetricId(Inner::next(&self.inner.next_dimension_id));
        tables.metrics.insert(
            id,
            MetricRecord {
                id,
                metric_hash: metric.metric_hash,
                identity_hash: metric.identity_hash,
                name: metric.name.clone(),
                metric_type: metric.metric_type,
                unit: metric.unit.clone(),
                temporality: metric.temporality,
                is_monotonic: metric.is_monotonic,
                description: metric.description.clone(),
                first_seen: seen_at,
                last_seen: seen_at,
            },
        );
        tables.metrics_by_hash.insert(metric.metric_hash, id);
        Ok(Observed {
            id,
            first_seen: seen_at,
            last_seen: seen_at,
            created: true,
        })
    }

    async fn touch_metric(&self, id: MetricId, seen_at: DateTime<Utc>) -> WarehouseResult<()> {
        if let Some(record) = self.inner.tables.lock().metrics.get_mut(&id) {
            record.last_seen = record.last_seen.max(seen_at);
        }
        Ok(())
    }

    async fn replace_attributes(
        &self,
        context: AttributeContext,
        parent_id: i64,
        attributes: &AttributeWriteSet,
    ) -> WarehouseResult<()> {
        self.inner
            .tables
            .lock()
            .write_attributes(context, parent_id, attributes, true);
        Ok(())
    }

    async fn begin(&self) -> WarehouseResult<Box<dyn FactTransaction>> {
        Ok(Box::new(MemoryFactTransaction {
            inner: Arc::clone(&self.inner),
            staged: Vec::new(),
        }))
    }

    async fn get_resource(&self, id: ResourceId) -> WarehouseResult<Option<ResourceRecord>> {
        Ok(self.inner.tables.lock().resources.get(&id).cloned())
    }

    async fn get_scope(&self, id: ScopeId) -> WarehouseResult<Option<ScopeRecord>> {
        Ok(self.inner.tables.lock().scopes.get(&id).cloned())
    }

    async fn get_metric(&self, id: MetricId) -> WarehouseResult<Option<MetricRecord>> {
        Ok(self.inner.tables.lock().metrics.get(&id).cloned())
    }

    async fn list_metric_variants(
        &self,
        identity_hash: &IdentityHash,
    ) -> WarehouseResult<Vec<MetricId>> {
        Ok(self
            .inner
            .tables
            .lock()
            .metrics
            .values()
            .filter(|m| m.identity_hash == *identity_hash)
            .map(|m| m.id)
            .collect())
    }

    async fn load_attributes(
        &self,
        context: AttributeContext,
        parent_id: i64,
    ) -> WarehouseResult<StoredAttributes> {
        let tables = self.inner.tables.lock();
        let range = (parent_id, KeyId(i32::MIN))..=(parent_id, KeyId(i32::MAX));

        let mut typed = Vec::new();
        for value_type in ValueType::ALL {
            let Some(table) = tables.typed.get(&(context, value_type)) else {
                continue;
            };
            for ((_, key_id), value) in table.range(range.clone()) {
                let key = tables.key_names.get(key_id).cloned().ok_or_else(|| {
                    WarehouseError::internal(format!("attribute key {} missing", key_id.0))
                })?;
                typed.push((key, value.clone()));
            }
        }
        typed.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(StoredAttributes {
            typed,
            catch_all: tables.catch_all.get(&(context, parent_id)).cloned(),
        })
    }

    async fn fact_counts(&self) -> WarehouseResult<FactCounts> {
        let tables = self.inner.tables.lock();
        let count = |n: usize| u64::try_from(n).unwrap_or(u64::MAX);
        Ok(FactCounts {
            logs: count(tables.logs.len()),
            spans: count(tables.spans.len()),
            span_events: count(tables.span_events.len()),
            span_links: count(tables.span_links.len()),
            data_points: count(tables.data_points.len()),
        })
    }
}

#[derive(Debug)]
enum StagedWrite {
    Log(FactId, LogRow),
    Span(FactId, SpanRow),
    SpanEvent(FactId, SpanEventRow),
    SpanLink(FactId, SpanLinkRow),
    DataPoint(FactId, DataPointRow),
    Attributes(AttributeContext, FactId, AttributeWriteSet),
}

/// Buffers writes and applies them under one lock on commit.
#[derive(Debug)]
struct MemoryFactTransaction {
    inner: Arc<Inner>,
    staged: Vec<StagedWrite>,
}

impl MemoryFactTransaction {
    fn stage(&mut self, write: impl FnOnce(FactId) -> StagedWrite) -> FactId {
        let id = FactId(Inner::next(&self.inner.next_fact_id));
        self.staged.push(write(id));
        id
    }
}

#[async_trait]
impl FactTransaction for MemoryFactTransaction {
    async fn insert_log(&mut self, row: &LogRow) -> WarehouseResult<FactId> {
        Ok(self.stage(|id| StagedWrite::Log(id, row.clone())))
    }

    async fn insert_span(&mut self, row: &SpanRow) -> WarehouseResult<FactId> {
        Ok(self.stage(|id| StagedWrite::Span(id, row.clone())))
    }

    async fn insert_span_event(&mut self, row: &SpanEventRow) -> WarehouseResult<FactId> {
        Ok(self.stage(|id| StagedWrite::SpanEvent(id, row.clone())))
    }

    async fn insert_span_link(&mut self, row: &SpanLinkRow) -> WarehouseResult<FactId> {
        Ok(self.stage(|id| StagedWrite::SpanLink(id, row.clone())))
    }

    async fn insert_data_point(&mut self, row: &DataPointRow) -> WarehouseResult<FactId> {
        Ok(self.stage(|id| StagedWrite::DataPoint(id, row.clone())))
    }

    async fn write_attributes(
        &mut self,
        context: AttributeContext,
        parent_id: FactId,
        attributes: &AttributeWriteSet,
    ) -> WarehouseResult<()> {
        if !attributes.is_empty() {
            self.staged.push(StagedWrite::Attributes(
                context,
                parent_id,
                attributes.clone(),
            ));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> WarehouseResult<()> {
        if self.inner.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(WarehouseError::internal("injected commit failure"));
        }

        let mut tables = self.inner.tables.lock();
        for write in self.staged {
            match write {
                StagedWrite::Log(id, row) => {
                    tables.logs.insert(id, row);
                }
                StagedWrite::Span(id, row) => {
                    tables.spans.insert(id, row);
                }
                StagedWrite::SpanEvent(id, row) => {
                    tables.span_events.insert(id, row);
                }
                StagedWrite::SpanLink(id, row) => {
                    tables.span_links.insert(id, row);
                }
                StagedWrite::DataPoint(id, row) => {
                    tables.data_points.insert(id, row);
                }
                StagedWrite::Attributes(context, parent, set) => {
                    tables.write_attributes(context, parent.0, &set, false);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> WarehouseResult<()> {
        Ok(())
    }
}

//! Metric identity dimension.
//!
//! A metric is identified twice. The identity hash covers everything except
//! the free-text description and groups variants of one metric; the full
//! hash adds the description and keys the stored row. A changed
//! description therefore creates a new variant row instead of rewriting
//! the old one.

use std::sync::Arc;

use chrono::Utc;
use opentelemetry_proto::tonic::metrics::v1::{metric::Data, Metric};
use tracing::debug;

use super::{stored_text, DimensionCache};
use crate::config::CacheConfig;
use crate::error::WarehouseResult;
use crate::identity::{IdentityHash, IdentityHasher};
use crate::model::{MetricId, MetricType, NewMetric, Temporality};
use crate::store::WarehouseStore;
use crate::value::storable_text;

/// The identifying fields of a metric stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDescriptor {
    pub name: String,
    pub metric_type: MetricType,
    pub unit: Option<String>,
    pub temporality: Temporality,
    pub is_monotonic: bool,
    pub description: Option<String>,
}

impl MetricDescriptor {
    /// Describe an OTLP metric.
    ///
    /// Returns `None` for a metric with no data, which has no type.
    pub fn from_otlp(metric: &Metric) -> Option<Self> {
        let (metric_type, temporality, is_monotonic) = match metric.data.as_ref()? {
            Data::Gauge(_) => (MetricType::Gauge, Temporality::Unspecified, false),
            Data::Sum(sum) => (
                MetricType::Sum,
                Temporality::from_otlp(sum.aggregation_temporality),
                sum.is_monotonic,
            ),
            Data::Histogram(h) => (
                MetricType::Histogram,
                Temporality::from_otlp(h.aggregation_temporality),
                false,
            ),
            Data::ExponentialHistogram(h) => (
                MetricType::ExponentialHistogram,
                Temporality::from_otlp(h.aggregation_temporality),
                false,
            ),
            Data::Summary(_) => (MetricType::Summary, Temporality::Unspecified, false),
        };

        Some(Self {
            name: storable_text(&metric.name).into_owned(),
            metric_type,
            unit: stored_text(&metric.unit),
            temporality,
            is_monotonic,
            description: stored_text(&metric.description),
        })
    }

    fn identity_hasher(&self) -> IdentityHasher {
        let mut hasher = IdentityHasher::new();
        hasher
            .str("metric")
            .str(&self.name)
            .str(self.metric_type.as_str())
            .opt_str(self.unit.as_deref())
            .str(self.temporality.as_str())
            .bool(self.is_monotonic);
        hasher
    }

    /// Hash of every field except the description.
    pub fn identity_hash(&self) -> IdentityHash {
        self.identity_hasher().finish()
    }

    /// Hash of every field including the description.
    pub fn full_hash(&self) -> IdentityHash {
        self.identity_hasher()
            .opt_str(self.description.as_deref())
            .finish()
    }
}

/// Deduplicates metric variants by full hash.
#[derive(Debug)]
pub struct MetricDimensionManager {
    store: Arc<dyn WarehouseStore>,
    cache: DimensionCache<IdentityHash, MetricId>,
}

impl MetricDimensionManager {
    /// Create a metric dimension manager.
    pub fn new(store: Arc<dyn WarehouseStore>, cache: &CacheConfig) -> Self {
        Self {
            store,
            cache: DimensionCache::new("metrics", cache),
        }
    }

    /// Resolve a metric variant to its id, creating it on first observation.
    pub async fn get_or_create(&self, descriptor: &MetricDescriptor) -> WarehouseResult<MetricId> {
        let metric_hash = descriptor.full_hash();
        let now = Utc::now();

        if let Some(id) = self.cache.get(&metric_hash) {
            self.store.touch_metric(id, now).await?;
            return Ok(id);
        }

        let metric = NewMetric {
            metric_hash,
            identity_hash: descriptor.identity_hash(),
            name: descriptor.name.clone(),
            metric_type: descriptor.metric_type,
            unit: descriptor.unit.clone(),
            temporality: descriptor.temporality,
            is_monotonic: descriptor.is_monotonic,
            description: descriptor.description.clone(),
        };
        let observed = self.store.upsert_metric(&metric, now).await?;

        if observed.created {
            debug!(
                metric_id = %observed.id,
                name = %descriptor.name,
                metric_type = descriptor.metric_type.as_str(),
                "Metric variant created"
            );
        }

        self.cache.insert(metric_hash, observed.id);
        Ok(observed.id)
    }

    /// Every variant sharing an identity hash.
    pub async fn list_variants(&self, identity_hash: &IdentityHash) -> WarehouseResult<Vec<MetricId>> {
        self.store.list_metric_variants(identity_hash).await
    }
}

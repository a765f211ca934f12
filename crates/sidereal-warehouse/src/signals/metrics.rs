//! Metric data point ingestion.

use std::sync::Arc;

use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::common::v1::KeyValue;
use opentelemetry_proto::tonic::metrics::v1::{
    exponential_histogram_data_point::Buckets, metric::Data, number_data_point, NumberDataPoint,
};
use tracing::{debug, instrument};

use super::{batch_failed, finish, Managers};
use crate::attributes::PreparedAttributes;
use crate::dimensions::MetricDescriptor;
use crate::error::WarehouseResult;
use crate::model::{
    DataPointRow, DataPointValue, ExponentialBuckets, ExponentialHistogramValue, HistogramValue,
    MetricId, ResourceId, ScopeId, SummaryValue,
};
use crate::signal::{AttributeContext, Signal};
use crate::store::WarehouseStore;
use crate::value::attributes_from_otlp;

struct PendingPoint {
    row: DataPointRow,
    attributes: PreparedAttributes,
}

/// The parts of any OTLP data point shape that become a fact row.
struct PointParts<'a> {
    attributes: &'a [KeyValue],
    start_time_unix_nano: u64,
    time_unix_nano: u64,
    flags: u32,
    value: DataPointValue,
    exemplar_count: usize,
}

/// Stores metric batches.
#[derive(Debug, Clone)]
pub struct MetricStorage {
    store: Arc<dyn WarehouseStore>,
    managers: Managers,
}

impl MetricStorage {
    /// Create a metric orchestrator.
    pub fn new(store: Arc<dyn WarehouseStore>, managers: Managers) -> Self {
        Self { store, managers }
    }

    /// Store a batch, returning the number of data points written.
    #[instrument(skip_all, fields(signal = %Signal::Metrics))]
    pub async fn ingest(&self, request: &ExportMetricsServiceRequest) -> WarehouseResult<usize> {
        let records: usize = request
            .resource_metrics
            .iter()
            .flat_map(|rm| &rm.scope_metrics)
            .map(|sm| sm.metrics.len())
            .sum();

        let result: WarehouseResult<usize> = async {
            let pending = self.resolve(request).await?;
            self.write(pending).await
        }
        .await;

        result.map_err(|err| batch_failed(Signal::Metrics, records, err))
    }

    /// Phase 1: resolve dimensions and classify attributes.
    async fn resolve(
        &self,
        request: &ExportMetricsServiceRequest,
    ) -> WarehouseResult<Vec<PendingPoint>> {
        let mut pending = Vec::new();
        for resource_metrics in &request.resource_metrics {
            let resource_id = self
                .managers
                .resources
                .resolve(
                    resource_metrics.resource.as_ref(),
                    &resource_metrics.schema_url,
                )
                .await?;

            for scope_metrics in &resource_metrics.scope_metrics {
                let scope_id = self
                    .managers
                    .scopes
                    .resolve(scope_metrics.scope.as_ref(), &scope_metrics.schema_url)
                    .await?;

                for metric in &scope_metrics.metrics {
                    let (Some(descriptor), Some(data)) =
                        (MetricDescriptor::from_otlp(metric), metric.data.as_ref())
                    else {
                        debug!(metric = %metric.name, "Skipping metric without data");
                        continue;
                    };
                    let metric_id = self.managers.metrics.get_or_create(&descriptor).await?;

                    for parts in data_points(data) {
                        pending.push(self.prepare(parts, metric_id, resource_id, scope_id).await?);
                    }
                }
            }
        }
        Ok(pending)
    }

    async fn prepare(
        &self,
        parts: PointParts<'_>,
        metric_id: MetricId,
        resource_id: ResourceId,
        scope_id: Option<ScopeId>,
    ) -> WarehouseResult<PendingPoint> {
        let attributes = self
            .managers
            .attributes
            .prepare(
                AttributeContext::DataPoint,
                &attributes_from_otlp(parts.attributes),
            )
            .await?;

        let row = DataPointRow {
            metric_id,
            resource_id,
            scope_id,
            start_time_unix_nano: (parts.start_time_unix_nano != 0)
                .then_some(parts.start_time_unix_nano),
            time_unix_nano: parts.time_unix_nano,
            flags: parts.flags,
            value: parts.value,
            exemplar_count: u32::try_from(parts.exemplar_count).unwrap_or(u32::MAX),
        };
        Ok(PendingPoint { row, attributes })
    }

    /// Phase 2: write every data point in one transaction.
    async fn write(&self, pending: Vec<PendingPoint>) -> WarehouseResult<usize> {
        if pending.is_empty() {
            return Ok(0);
        }

        let mut tx = self.store.begin().await?;
        let written: WarehouseResult<()> = async {
            for point in &pending {
                let id = tx.insert_data_point(&point.row).await?;
                tx.write_attributes(AttributeContext::DataPoint, id, &point.attributes.set)
                    .await?;
            }
            Ok(())
        }
        .await;
        finish(tx, written).await?;

        debug!(data_points = pending.len(), "Metric batch stored");
        Ok(pending.len())
    }
}

/// Flatten any metric data shape into fact row parts.
fn data_points(data: &Data) -> Vec<PointParts<'_>> {
    match data {
        Data::Gauge(gauge) => gauge.data_points.iter().map(number_point).collect(),
        Data::Sum(sum) => sum.data_points.iter().map(number_point).collect(),
        Data::Histogram(histogram) => histogram
            .data_points
            .iter()
            .map(|p| PointParts {
                attributes: &p.attributes,
                start_time_unix_nano: p.start_time_unix_nano,
                time_unix_nano: p.time_unix_nano,
                flags: p.flags,
                value: DataPointValue::Histogram(HistogramValue {
                    count: p.count,
                    sum: p.sum,
                    min: p.min,
                    max: p.max,
                    bucket_counts: p.bucket_counts.clone(),
                    explicit_bounds: p.explicit_bounds.clone(),
                }),
                exemplar_count: p.exemplars.len(),
            })
            .collect(),
        Data::ExponentialHistogram(histogram) => histogram
            .data_points
            .iter()
            .map(|p| PointParts {
                attributes: &p.attributes,
                start_time_unix_nano: p.start_time_unix_nano,
                time_unix_nano: p.time_unix_nano,
                flags: p.flags,
                value: DataPointValue::ExponentialHistogram(ExponentialHistogramValue {
                    count: p.count,
                    sum: p.sum,
                    min: p.min,
                    max: p.max,
                    scale: p.scale,
                    zero_count: p.zero_count,
                    zero_threshold: p.zero_threshold,
                    positive: p.positive.as_ref().map(buckets),
                    negative: p.negative.as_ref().map(buckets),
                }),
                exemplar_count: p.exemplars.len(),
            })
            .collect(),
        Data::Summary(summary) => summary
            .data_points
            .iter()
            .map(|p| PointParts {
                attributes: &p.attributes,
                start_time_unix_nano: p.start_time_unix_nano,
                time_unix_nano: p.time_unix_nano,
                flags: p.flags,
                value: DataPointValue::Summary(SummaryValue {
                    count: p.count,
                    sum: p.sum,
                    quantiles: p
                        .quantile_values
                        .iter()
                        .map(|q| (q.quantile, q.value))
                        .collect(),
                }),
                exemplar_count: 0,
            })
            .collect(),
    }
}

fn number_point(p: &NumberDataPoint) -> PointParts<'_> {
    let value = match p.value {
        Some(number_data_point::Value::AsInt(v)) => DataPointValue::Int(v),
        Some(number_data_point::Value::AsDouble(v)) => DataPointValue::Double(v),
        None => DataPointValue::Empty,
    };
    PointParts {
        attributes: &p.attributes,
        start_time_unix_nano: p.start_time_unix_nano,
        time_unix_nano: p.time_unix_nano,
        flags: p.flags,
        value,
        exemplar_count: p.exemplars.len(),
    }
}

fn buckets(b: &Buckets) -> ExponentialBuckets {
    ExponentialBuckets {
        offset: b.offset,
        bucket_counts: b.bucket_counts.clone(),
    }
}

//! Composable test fixtures using rstest.
//!
//! ```text
//! memory_warehouse  (MemoryStore + Warehouse with the shipped policy)
//! checkout_resource (service.name = "checkout")
//!    └── log_request / trace_request / metric_request
//! ```

use std::sync::Arc;

use opentelemetry_proto::tonic::collector::{
    logs::v1::ExportLogsServiceRequest, metrics::v1::ExportMetricsServiceRequest,
    trace::v1::ExportTraceServiceRequest,
};
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::logs::v1::{LogRecord, ResourceLogs, ScopeLogs};
use opentelemetry_proto::tonic::metrics::v1::{
    metric, number_data_point, Gauge, Metric, NumberDataPoint, ResourceMetrics, ScopeMetrics,
};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{span, ResourceSpans, ScopeSpans, Span};
use rstest::fixture;

use crate::config::CacheConfig;
use crate::policy::PolicyHandle;
use crate::store::MemoryStore;
use crate::warehouse::Warehouse;

const BASE_TIME_NANOS: u64 = 1_704_067_200_000_000_000;

/// An in-memory warehouse with the shipped policy, plus a handle on its
/// store for assertions.
#[fixture]
pub fn memory_warehouse() -> (MemoryStore, Warehouse) {
    let store = MemoryStore::new();
    let policy = PolicyHandle::new(None).expect("shipped policy is valid");
    let warehouse = Warehouse::with_store(
        Arc::new(store.clone()),
        Arc::new(policy),
        &CacheConfig::default(),
    );
    (store, warehouse)
}

/// A resource identifying the checkout service.
#[fixture]
pub fn checkout_resource() -> Resource {
    Resource {
        attributes: vec![kv(
            "service.name",
            any_value::Value::StringValue("checkout".into()),
        )],
        ..Default::default()
    }
}

pub fn kv(key: &str, value: any_value::Value) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue { value: Some(value) }),
    }
}

fn test_scope() -> InstrumentationScope {
    InstrumentationScope {
        name: "test-scope".into(),
        version: "1.0.0".into(),
        ..Default::default()
    }
}

/// `count` INFO log records under one resource and scope.
pub fn log_request(resource: Resource, count: usize) -> ExportLogsServiceRequest {
    let log_records = (0..count as u64)
        .map(|i| LogRecord {
            time_unix_nano: BASE_TIME_NANOS + i,
            observed_time_unix_nano: BASE_TIME_NANOS + i,
            severity_number: 9,
            severity_text: "INFO".into(),
            ..Default::default()
        })
        .collect();

    ExportLogsServiceRequest {
        resource_logs: vec![ResourceLogs {
            resource: Some(resource),
            scope_logs: vec![ScopeLogs {
                scope: Some(test_scope()),
                log_records,
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

/// `count` server spans in one trace under one resource and scope.
pub fn trace_request(resource: Resource, count: usize) -> ExportTraceServiceRequest {
    let spans = (0..count)
        .map(|i| {
            let id = u8::try_from(i + 1).unwrap_or(u8::MAX);
            Span {
                trace_id: vec![1; 16],
                span_id: vec![id; 8],
                name: format!("span-{i}"),
                kind: span::SpanKind::Server as i32,
                start_time_unix_nano: BASE_TIME_NANOS,
                end_time_unix_nano: BASE_TIME_NANOS + 1_000_000,
                ..Default::default()
            }
        })
        .collect();

    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Some(resource),
            scope_spans: vec![ScopeSpans {
                scope: Some(test_scope()),
                spans,
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

/// A gauge with one double data point per value.
pub fn gauge_metric(name: &str, values: &[f64]) -> Metric {
    let data_points = values
        .iter()
        .map(|v| NumberDataPoint {
            time_unix_nano: BASE_TIME_NANOS,
            value: Some(number_data_point::Value::AsDouble(*v)),
            ..Default::default()
        })
        .collect();

    Metric {
        name: name.to_string(),
        unit: "1".into(),
        data: Some(metric::Data::Gauge(Gauge { data_points })),
        ..Default::default()
    }
}

/// The given metrics under one resource and scope.
pub fn metric_request(resource: Resource, metrics: Vec<Metric>) -> ExportMetricsServiceRequest {
    ExportMetricsServiceRequest {
        resource_metrics: vec![ResourceMetrics {
            resource: Some(resource),
            scope_metrics: vec![ScopeMetrics {
                scope: Some(test_scope()),
                metrics,
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

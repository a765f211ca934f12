//! Span ingestion.

use std::sync::Arc;

use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::trace::v1::{span, Span};
use tracing::{debug, instrument};

use super::{batch_failed, clamp_enum, finish, hex_id, Managers};
use crate::attributes::PreparedAttributes;
use crate::dimensions::stored_text;
use crate::error::WarehouseResult;
use crate::model::{FactId, ResourceId, ScopeId, SpanEventRow, SpanLinkRow, SpanRow};
use crate::signal::{AttributeContext, Signal};
use crate::store::WarehouseStore;
use crate::value::{attributes_from_otlp, storable_text};

/// Highest OTLP span kind.
const MAX_SPAN_KIND: i16 = 5;

/// Highest OTLP status code.
const MAX_STATUS_CODE: i16 = 2;

/// A child row whose parent span id is only known in phase 2.
struct PendingChild<R> {
    row: R,
    attributes: PreparedAttributes,
}

struct PendingSpan {
    row: SpanRow,
    attributes: PreparedAttributes,
    events: Vec<PendingChild<SpanEventRow>>,
    links: Vec<PendingChild<SpanLinkRow>>,
}

/// Stores trace batches.
#[derive(Debug, Clone)]
pub struct TraceStorage {
    store: Arc<dyn WarehouseStore>,
    managers: Managers,
}

impl TraceStorage {
    /// Create a trace orchestrator.
    pub fn new(store: Arc<dyn WarehouseStore>, managers: Managers) -> Self {
        Self { store, managers }
    }

    /// Store a batch, returning the number of spans written.
    #[instrument(skip_all, fields(signal = %Signal::Traces))]
    pub async fn ingest(&self, request: &ExportTraceServiceRequest) -> WarehouseResult<usize> {
        let records: usize = request
            .resource_spans
            .iter()
            .flat_map(|rs| &rs.scope_spans)
            .map(|ss| ss.spans.len())
            .sum();

        let result: WarehouseResult<usize> = async {
            let pending = self.resolve(request).await?;
            self.write(pending).await
        }
        .await;

        result.map_err(|err| batch_failed(Signal::Traces, records, err))
    }

    /// Phase 1: resolve dimensions and classify attributes.
    async fn resolve(
        &self,
        request: &ExportTraceServiceRequest,
    ) -> WarehouseResult<Vec<PendingSpan>> {
        let mut pending = Vec::new();
        for resource_spans in &request.resource_spans {
            let resource_id = self
                .managers
                .resources
                .resolve(resource_spans.resource.as_ref(), &resource_spans.schema_url)
                .await?;

            for scope_spans in &resource_spans.scope_spans {
                let scope_id = self
                    .managers
                    .scopes
                    .resolve(scope_spans.scope.as_ref(), &scope_spans.schema_url)
                    .await?;

                for span in &scope_spans.spans {
                    pending.push(self.prepare(span, resource_id, scope_id).await?);
                }
            }
        }
        Ok(pending)
    }

    async fn prepare(
        &self,
        span: &Span,
        resource_id: ResourceId,
        scope_id: Option<ScopeId>,
    ) -> WarehouseResult<PendingSpan> {
        let attributes = self
            .managers
            .attributes
            .prepare(AttributeContext::Span, &attributes_from_otlp(&span.attributes))
            .await?;

        let mut events = Vec::with_capacity(span.events.len());
        for event in &span.events {
            events.push(self.prepare_event(event).await?);
        }
        let mut links = Vec::with_capacity(span.links.len());
        for link in &span.links {
            links.push(self.prepare_link(link).await?);
        }

        let (status_code, status_message) = span.status.as_ref().map_or((0, None), |status| {
            (
                clamp_enum(status.code, MAX_STATUS_CODE),
                stored_text(&status.message),
            )
        });

        let row = SpanRow {
            resource_id,
            scope_id,
            trace_id: hex::encode(&span.trace_id),
            span_id: hex::encode(&span.span_id),
            parent_span_id: hex_id(&span.parent_span_id),
            trace_state: stored_text(&span.trace_state),
            name: storable_text(&span.name).into_owned(),
            kind: clamp_enum(span.kind, MAX_SPAN_KIND),
            start_time_unix_nano: span.start_time_unix_nano,
            end_time_unix_nano: span.end_time_unix_nano,
            status_code,
            status_message,
            flags: span.flags,
            dropped_attributes_count: span
                .dropped_attributes_count
                .saturating_add(attributes.dropped),
            dropped_events_count: span.dropped_events_count,
            dropped_links_count: span.dropped_links_count,
        };

        Ok(PendingSpan {
            row,
            attributes,
            events,
            links,
        })
    }

    async fn prepare_event(
        &self,
        event: &span::Event,
    ) -> WarehouseResult<PendingChild<SpanEventRow>> {
        let attributes = self
            .managers
            .attributes
            .prepare(
                AttributeContext::SpanEvent,
                &attributes_from_otlp(&event.attributes),
            )
            .await?;
        let row = SpanEventRow {
            span_row_id: FactId(0),
            time_unix_nano: event.time_unix_nano,
            name: storable_text(&event.name).into_owned(),
            dropped_attributes_count: event
                .dropped_attributes_count
                .saturating_add(attributes.dropped),
        };
        Ok(PendingChild { row, attributes })
    }

    async fn prepare_link(&self, link: &span::Link) -> WarehouseResult<PendingChild<SpanLinkRow>> {
        let attributes = self
            .managers
            .attributes
            .prepare(
                AttributeContext::SpanLink,
                &attributes_from_otlp(&link.attributes),
            )
            .await?;
        let row = SpanLinkRow {
            span_row_id: FactId(0),
            trace_id: hex::encode(&link.trace_id),
            span_id: hex::encode(&link.span_id),
            trace_state: stored_text(&link.trace_state),
            flags: link.flags,
            dropped_attributes_count: link
                .dropped_attributes_count
                .saturating_add(attributes.dropped),
        };
        Ok(PendingChild { row, attributes })
    }

    /// Phase 2: write every span, event and link in one transaction.
    async fn write(&self, pending: Vec<PendingSpan>) -> WarehouseResult<usize> {
        if pending.is_empty() {
            return Ok(0);
        }

        let mut tx = self.store.begin().await?;
        let written: WarehouseResult<()> = async {
            for span in &pending {
                let span_row_id = tx.insert_span(&span.row).await?;
                tx.write_attributes(AttributeContext::Span, span_row_id, &span.attributes.set)
                    .await?;

                for event in &span.events {
                    let row = SpanEventRow {
                        span_row_id,
                        ..event.row.clone()
                    };
                    let id = tx.insert_span_event(&row).await?;
                    tx.write_attributes(AttributeContext::SpanEvent, id, &event.attributes.set)
                        .await?;
                }

                for link in &span.links {
                    let row = SpanLinkRow {
                        span_row_id,
                        ..link.row.clone()
                    };
                    let id = tx.insert_span_link(&row).await?;
                    tx.write_attributes(AttributeContext::SpanLink, id, &link.attributes.set)
                        .await?;
                }
            }
            Ok(())
        }
        .await;
        finish(tx, written).await?;

        debug!(spans = pending.len(), "Trace batch stored");
        Ok(pending.len())
    }
}

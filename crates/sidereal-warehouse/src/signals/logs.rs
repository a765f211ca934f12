//! Log record ingestion.

use std::sync::Arc;

use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::logs::v1::LogRecord;
use tracing::{debug, instrument};

use super::{batch_failed, clamp_enum, finish, hex_id, Managers};
use crate::attributes::PreparedAttributes;
use crate::dimensions::stored_text;
use crate::error::WarehouseResult;
use crate::model::{LogRow, ResourceId, ScopeId};
use crate::signal::{AttributeContext, Signal};
use crate::store::WarehouseStore;
use crate::value::{attributes_from_otlp, AttributeValue};

/// Highest OTel severity number.
const MAX_SEVERITY: i16 = 24;

struct PendingLog {
    row: LogRow,
    attributes: PreparedAttributes,
}

/// Stores log batches.
#[derive(Debug, Clone)]
pub struct LogStorage {
    store: Arc<dyn WarehouseStore>,
    managers: Managers,
}

impl LogStorage {
    /// Create a log orchestrator.
    pub fn new(store: Arc<dyn WarehouseStore>, managers: Managers) -> Self {
        Self { store, managers }
    }

    /// Store a batch, returning the number of log records written.
    #[instrument(skip_all, fields(signal = %Signal::Logs))]
    pub async fn ingest(&self, request: &ExportLogsServiceRequest) -> WarehouseResult<usize> {
        let records: usize = request
            .resource_logs
            .iter()
            .flat_map(|rl| &rl.scope_logs)
            .map(|sl| sl.log_records.len())
            .sum();

        let result: WarehouseResult<usize> = async {
            let pending = self.resolve(request).await?;
            self.write(pending).await
        }
        .await;

        result.map_err(|err| batch_failed(Signal::Logs, records, err))
    }

    /// Phase 1: resolve dimensions and classify attributes.
    async fn resolve(&self, request: &ExportLogsServiceRequest) -> WarehouseResult<Vec<PendingLog>> {
        let mut pending = Vec::new();
        for resource_logs in &request.resource_logs {
            let resource_id = self
                .managers
                .resources
                .resolve(resource_logs.resource.as_ref(), &resource_logs.schema_url)
                .await?;

            for scope_logs in &resource_logs.scope_logs {
                let scope_id = self
                    .managers
                    .scopes
                    .resolve(scope_logs.scope.as_ref(), &scope_logs.schema_url)
                    .await?;

                for record in &scope_logs.log_records {
                    pending.push(self.prepare(record, resource_id, scope_id).await?);
                }
            }
        }
        Ok(pending)
    }

    async fn prepare(
        &self,
        record: &LogRecord,
        resource_id: ResourceId,
        scope_id: Option<ScopeId>,
    ) -> WarehouseResult<PendingLog> {
        let attributes = self
            .managers
            .attributes
            .prepare(AttributeContext::Log, &attributes_from_otlp(&record.attributes))
            .await?;
        let body = record
            .body
            .as_ref()
            .map(|body| serde_json::to_value(AttributeValue::from(body)))
            .transpose()?;

        let row = LogRow {
            resource_id,
            scope_id,
            time_unix_nano: record.time_unix_nano,
            observed_time_unix_nano: record.observed_time_unix_nano,
            severity_number: clamp_enum(record.severity_number, MAX_SEVERITY),
            severity_text: stored_text(&record.severity_text),
            body,
            trace_id: hex_id(&record.trace_id),
            span_id: hex_id(&record.span_id),
            flags: record.flags,
            dropped_attributes_count: record
                .dropped_attributes_count
                .saturating_add(attributes.dropped),
        };
        Ok(PendingLog { row, attributes })
    }

    /// Phase 2: write every fact in one transaction.
    async fn write(&self, pending: Vec<PendingLog>) -> WarehouseResult<usize> {
        if pending.is_empty() {
            return Ok(0);
        }

        let mut tx = self.store.begin().await?;
        let written: WarehouseResult<()> = async {
            for log in &pending {
                let id = tx.insert_log(&log.row).await?;
                tx.write_attributes(AttributeContext::Log, id, &log.attributes.set)
                    .await?;
            }
            Ok(())
        }
        .await;
        finish(tx, written).await?;

        debug!(records = pending.len(), "Log batch stored");
        Ok(pending.len())
    }
}

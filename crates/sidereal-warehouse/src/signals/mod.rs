//! Per-signal ingestion orchestrators.
//!
//! Every batch is stored in two phases:
//!
//! 1. **Dimension resolution.** Every resource, scope and metric the batch
//!    references is resolved through its manager. Each resolution commits
//!    on its own and is a no-op when repeated.
//! 2. **Fact write.** All fact rows and their attributes are written in a
//!    single transaction that references only ids resolved in phase 1.
//!
//! A failure in either phase surfaces as
//! [`WarehouseError::BatchFailed`](crate::error::WarehouseError::BatchFailed).
//! Facts are all-or-nothing per batch, and dimensions left behind by a
//! failed batch are reused when it is retried.

mod logs;
mod metrics;
mod traces;

use std::sync::Arc;

use tracing::warn;

pub use logs::LogStorage;
pub use metrics::MetricStorage;
pub use traces::TraceStorage;

use crate::attributes::AttributeManager;
use crate::config::CacheConfig;
use crate::dimensions::{MetricDimensionManager, ResourceManager, ScopeManager};
use crate::error::{WarehouseError, WarehouseResult};
use crate::policy::PolicyHandle;
use crate::signal::Signal;
use crate::store::{FactTransaction, WarehouseStore};

/// The managers shared by every orchestrator.
///
/// Cloning is cheap; clones share caches.
#[derive(Debug, Clone)]
pub struct Managers {
    pub attributes: Arc<AttributeManager>,
    pub resources: Arc<ResourceManager>,
    pub scopes: Arc<ScopeManager>,
    pub metrics: Arc<MetricDimensionManager>,
}

impl Managers {
    /// Build a full set of managers over one store and policy.
    pub fn new(
        store: &Arc<dyn WarehouseStore>,
        policy: Arc<PolicyHandle>,
        cache: &CacheConfig,
    ) -> Self {
        let attributes = Arc::new(AttributeManager::new(Arc::clone(store), policy, cache));
        Self {
            resources: Arc::new(ResourceManager::new(
                Arc::clone(store),
                Arc::clone(&attributes),
                cache,
            )),
            scopes: Arc::new(ScopeManager::new(
                Arc::clone(store),
                Arc::clone(&attributes),
                cache,
            )),
            metrics: Arc::new(MetricDimensionManager::new(Arc::clone(store), cache)),
            attributes,
        }
    }
}

/// Commit the transaction if every write succeeded, else roll it back.
async fn finish(
    tx: Box<dyn FactTransaction>,
    written: WarehouseResult<()>,
) -> WarehouseResult<()> {
    match written {
        Ok(()) => tx.commit().await,
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Fact transaction rollback failed");
            }
            Err(err)
        }
    }
}

/// Log a failed batch and wrap the error as retryable.
fn batch_failed(signal: Signal, records: usize, err: WarehouseError) -> WarehouseError {
    warn!(%signal, records, error = %err, "Batch ingestion failed");
    WarehouseError::batch_failed(signal, err)
}

/// Hex-encode a trace or span id; empty and all-zero ids are absent.
fn hex_id(bytes: &[u8]) -> Option<String> {
    if bytes.iter().all(|b| *b == 0) {
        None
    } else {
        Some(hex::encode(bytes))
    }
}

/// Clamp an OTLP enum value into its reference table range.
fn clamp_enum(value: i32, max: i16) -> i16 {
    i16::try_from(value.clamp(0, i32::from(max))).unwrap_or_default()
}

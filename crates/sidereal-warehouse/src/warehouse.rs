//! The assembled storage engine.

use std::sync::Arc;

use tracing::info;

use crate::config::{CacheConfig, StoreConfig, WarehouseConfig};
use crate::error::WarehouseResult;
use crate::policy::PolicyHandle;
use crate::signals::{LogStorage, Managers, MetricStorage, TraceStorage};
use crate::store::{create_store, WarehouseStore};

/// One store, one policy and the orchestrators for every signal.
///
/// Cloning is cheap. Clones share the store, the policy and every cache.
#[derive(Debug, Clone)]
pub struct Warehouse {
    store: Arc<dyn WarehouseStore>,
    policy: Arc<PolicyHandle>,
    managers: Managers,
    logs: LogStorage,
    traces: TraceStorage,
    metrics: MetricStorage,
}

impl Warehouse {
    /// Open a warehouse from configuration.
    ///
    /// Fails if the store is unreachable or the policy override cannot be
    /// loaded. Neither is recoverable at runtime.
    pub async fn open(config: &WarehouseConfig) -> WarehouseResult<Self> {
        let policy = match &config.policy.override_path {
            Some(path) => PolicyHandle::from_override_path(path)?,
            None => PolicyHandle::new(None)?,
        };
        let store = create_store(&config.store).await?;

        info!(
            store = match config.store {
                StoreConfig::Memory => "memory",
                StoreConfig::Postgres { .. } => "postgres",
            },
            cache_enabled = config.cache.enabled,
            "Warehouse opened"
        );

        Ok(Self::with_store(store, Arc::new(policy), &config.cache))
    }

    /// Assemble a warehouse over an existing store and policy.
    pub fn with_store(
        store: Arc<dyn WarehouseStore>,
        policy: Arc<PolicyHandle>,
        cache: &CacheConfig,
    ) -> Self {
        let managers = Managers::new(&store, Arc::clone(&policy), cache);
        Self {
            logs: LogStorage::new(Arc::clone(&store), managers.clone()),
            traces: TraceStorage::new(Arc::clone(&store), managers.clone()),
            metrics: MetricStorage::new(Arc::clone(&store), managers.clone()),
            store,
            policy,
            managers,
        }
    }

    pub fn logs(&self) -> &LogStorage {
        &self.logs
    }

    pub fn traces(&self) -> &TraceStorage {
        &self.traces
    }

    pub fn metrics(&self) -> &MetricStorage {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn WarehouseStore> {
        &self.store
    }

    /// The live policy; reloading it affects every later batch.
    pub fn policy(&self) -> &Arc<PolicyHandle> {
        &self.policy
    }

    pub fn managers(&self) -> &Managers {
        &self.managers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use std::io::Write;

    #[tokio::test]
    async fn opens_with_default_config() {
        let warehouse = Warehouse::open(&WarehouseConfig::default()).await.unwrap();
        assert_eq!(warehouse.policy().load().version(), 1);
        assert_eq!(warehouse.store().fact_counts().await.unwrap().logs, 0);
    }

    #[tokio::test]
    async fn invalid_override_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[promote.nowhere]\nstring = [\"a\"]").unwrap();

        let config = WarehouseConfig {
            policy: PolicyConfig {
                override_path: Some(file.path().to_path_buf()),
            },
            ..Default::default()
        };
        assert!(Warehouse::open(&config).await.is_err());
    }

    #[tokio::test]
    async fn missing_override_is_fatal() {
        let config = WarehouseConfig {
            policy: PolicyConfig {
                override_path: Some("/nonexistent/policy.toml".into()),
            },
            ..Default::default()
        };
        assert!(Warehouse::open(&config).await.is_err());
    }
}

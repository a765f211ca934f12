//! Attribute key interning.

use std::sync::Arc;

use tracing::debug;

use crate::config::CacheConfig;
use crate::dimensions::DimensionCache;
use crate::error::{WarehouseError, WarehouseResult};
use crate::model::{AttributeKeyRecord, KeyId};
use crate::store::WarehouseStore;
use crate::value::ValueType;

/// Upsert attempts before a unique-constraint race is surfaced.
const MAX_UPSERT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy)]
struct CachedKey {
    key_id: KeyId,
    searchable: bool,
}

/// Maps attribute key names to stable key ids.
///
/// Resolution is an upsert-or-fetch against the store, fronted by a local
/// cache. Concurrent first-time resolution of one key from many workers
/// converges on a single id.
#[derive(Debug)]
pub struct AttributeKeyRegistry {
    store: Arc<dyn WarehouseStore>,
    cache: DimensionCache<String, CachedKey>,
}

impl AttributeKeyRegistry {
    /// Create a registry over a store.
    pub fn new(store: Arc<dyn WarehouseStore>, cache: &CacheConfig) -> Self {
        Self {
            store,
            cache: DimensionCache::new("attribute_keys", cache),
        }
    }

    /// Resolve a key about to be written to a typed table.
    pub async fn resolve(&self, key: &str, value_type: ValueType) -> WarehouseResult<KeyId> {
        self.resolve_with(key, value_type, true).await
    }

    /// Resolve a key, widening it to searchable if requested.
    ///
    /// A cached entry only short-circuits the store when it already carries
    /// the requested searchability; a searchable request for a key cached as
    /// non-searchable goes to the store so the flag is widened there.
    pub async fn resolve_with(
        &self,
        key: &str,
        value_type: ValueType,
        searchable: bool,
    ) -> WarehouseResult<KeyId> {
        if let Some(cached) = self.cache.get(key) {
            if cached.searchable || !searchable {
                return Ok(cached.key_id);
            }
        }

        let record = self.upsert(key, value_type, searchable).await?;
        debug!(
            key = %record.key,
            key_id = record.key_id.0,
            searchable = record.searchable,
            "Attribute key resolved"
        );
        self.cache.insert(
            record.key.clone(),
            CachedKey {
                key_id: record.key_id,
                searchable: record.searchable,
            },
        );
        Ok(record.key_id)
    }

    async fn upsert(
        &self,
        key: &str,
        value_type: ValueType,
        searchable: bool,
    ) -> WarehouseResult<AttributeKeyRecord> {
        let mut attempt = 1;
        loop {
            match self.store.upsert_attribute_key(key, value_type, searchable).await {
                Ok(record) => return Ok(record),
                Err(WarehouseError::UniqueViolation(msg)) if attempt < MAX_UPSERT_ATTEMPTS => {
                    debug!(key, attempt, error = %msg, "Attribute key insert raced, retrying");
                    if let Some(existing) = self.store.attribute_key(key).await? {
                        if existing.searchable || !searchable {
                            return Ok(existing);
                        }
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Number of cached keys.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

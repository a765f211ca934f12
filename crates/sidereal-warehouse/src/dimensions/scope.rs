//! Instrumentation scope dimension.

use std::sync::Arc;

use chrono::Utc;
use opentelemetry_proto::tonic::common::v1::InstrumentationScope;
use tracing::debug;

use super::{non_empty, DimensionCache};
use crate::attributes::AttributeManager;
use crate::config::CacheConfig;
use crate::error::WarehouseResult;
use crate::identity::{scope_hash, IdentityHash};
use crate::model::{NewScope, ScopeId};
use crate::signal::AttributeContext;
use crate::store::WarehouseStore;
use crate::value::{attributes_from_otlp, storable_text, Attribute};

/// Deduplicates instrumentation scopes by identity hash.
#[derive(Debug)]
pub struct ScopeManager {
    store: Arc<dyn WarehouseStore>,
    attributes: Arc<AttributeManager>,
    /// Id and the policy version its attributes were last written under.
    cache: DimensionCache<IdentityHash, (ScopeId, u64)>,
}

impl ScopeManager {
    /// Create a scope manager.
    pub fn new(
        store: Arc<dyn WarehouseStore>,
        attributes: Arc<AttributeManager>,
        cache: &CacheConfig,
    ) -> Self {
        Self {
            store,
            attributes,
            cache: DimensionCache::new("scopes", cache),
        }
    }

    /// Resolve an OTLP scope.
    ///
    /// Returns `None` when the scope is absent or carries no name, version
    /// or attributes.
    pub async fn resolve(
        &self,
        scope: Option<&InstrumentationScope>,
        schema_url: &str,
    ) -> WarehouseResult<Option<ScopeId>> {
        let Some(scope) = scope else {
            return Ok(None);
        };
        let attributes = attributes_from_otlp(&scope.attributes);
        if scope.name.is_empty() && scope.version.is_empty() && attributes.is_empty() {
            return Ok(None);
        }

        self.get_or_create(
            &scope.name,
            non_empty(&scope.version),
            &attributes,
            non_empty(schema_url),
            scope.dropped_attributes_count,
        )
        .await
        .map(Some)
    }

    /// Resolve a scope to its id, creating it on first observation.
    ///
    /// Cache hits from an older policy version are handled as misses.
    pub async fn get_or_create(
        &self,
        name: &str,
        version: Option<&str>,
        attributes: &[Attribute],
        schema_url: Option<&str>,
        sdk_dropped: u32,
    ) -> WarehouseResult<ScopeId> {
        let hash = scope_hash(name, version, attributes, schema_url);
        let now = Utc::now();

        let policy_version = self.attributes.policy().load().version();
        if let Some((id, version)) = self.cache.get(&hash) {
            if version == policy_version {
                self.store.touch_scope(id, now).await?;
                return Ok(id);
            }
        }

        let prepared = self
            .attributes
            .prepare(AttributeContext::Scope, attributes)
            .await?;
        let scope = NewScope {
            hash,
            name: storable_text(name).into_owned(),
            version: version.map(|v| storable_text(v).into_owned()),
            schema_url: schema_url.map(|s| storable_text(s).into_owned()),
            dropped_attribute_count: sdk_dropped.saturating_add(prepared.dropped),
        };

        let observed = self.store.upsert_scope(&scope, now).await?;
        self.attributes
            .write_prepared(AttributeContext::Scope, observed.id.0, &prepared)
            .await?;

        if observed.created {
            debug!(scope_id = %observed.id, name, version, "Scope created");
        }

        self.cache
            .insert(hash, (observed.id, prepared.policy_version));
        Ok(observed.id)
    }
}

//! Resource dimension.

use std::sync::Arc;

use chrono::Utc;
use opentelemetry_proto::tonic::resource::v1::Resource;
use tracing::debug;

use super::{non_empty, DimensionCache};
use crate::attributes::AttributeManager;
use crate::config::CacheConfig;
use crate::error::WarehouseResult;
use crate::identity::{resource_hash, IdentityHash};
use crate::model::{NewResource, ResourceId};
use crate::signal::AttributeContext;
use crate::store::WarehouseStore;
use crate::value::{attributes_from_otlp, storable_text, Attribute};

/// OpenTelemetry semantic convention attribute names extracted onto
/// dimension rows.
pub mod semconv {
    /// Logical service name.
    pub const SERVICE_NAME: &str = "service.name";
    /// Service namespace.
    pub const SERVICE_NAMESPACE: &str = "service.namespace";
}

/// Deduplicates resources by identity hash.
#[derive(Debug)]
pub struct ResourceManager {
    store: Arc<dyn WarehouseStore>,
    attributes: Arc<AttributeManager>,
    /// Id and the policy version its attributes were last written under.
    cache: DimensionCache<IdentityHash, (ResourceId, u64)>,
}

impl ResourceManager {
    /// Create a resource manager.
    pub fn new(
        store: Arc<dyn WarehouseStore>,
        attributes: Arc<AttributeManager>,
        cache: &CacheConfig,
    ) -> Self {
        Self {
            store,
            attributes,
            cache: DimensionCache::new("resources", cache),
        }
    }

    /// Resolve an OTLP resource. A missing resource is the empty resource.
    pub async fn resolve(
        &self,
        resource: Option<&Resource>,
        schema_url: &str,
    ) -> WarehouseResult<ResourceId> {
        let (attributes, sdk_dropped) = resource.map_or_else(
            || (Vec::new(), 0),
            |r| (attributes_from_otlp(&r.attributes), r.dropped_attributes_count),
        );
        self.get_or_create(&attributes, non_empty(schema_url), sdk_dropped)
            .await
    }

    /// Resolve a resource to its id, creating it on first observation.
    ///
    /// `sdk_dropped` is the count the SDK reported; attributes dropped by
    /// the policy are added to it on the stored row.
    ///
    /// A cache hit written under an older policy version is handled as a
    /// miss, so the first observation after a reload reroutes the
    /// resource's attributes.
    pub async fn get_or_create(
        &self,
        attributes: &[Attribute],
        schema_url: Option<&str>,
        sdk_dropped: u32,
    ) -> WarehouseResult<ResourceId> {
        let hash = resource_hash(attributes, schema_url);
        let now = Utc::now();

        let policy_version = self.attributes.policy().load().version();
        if let Some((id, version)) = self.cache.get(&hash) {
            if version == policy_version {
                self.store.touch_resource(id, now).await?;
                return Ok(id);
            }
        }

        let prepared = self
            .attributes
            .prepare(AttributeContext::Resource, attributes)
            .await?;
        let resource = NewResource {
            hash,
            service_name: string_attribute(attributes, semconv::SERVICE_NAME),
            service_namespace: string_attribute(attributes, semconv::SERVICE_NAMESPACE),
            schema_url: schema_url.map(|s| storable_text(s).into_owned()),
            dropped_attribute_count: sdk_dropped.saturating_add(prepared.dropped),
        };

        let observed = self.store.upsert_resource(&resource, now).await?;
        self.attributes
            .write_prepared(AttributeContext::Resource, observed.id.0, &prepared)
            .await?;

        if observed.created {
            debug!(
                resource_id = %observed.id,
                service_name = resource.service_name.as_deref().unwrap_or_default(),
                hash = ?hash,
                "Resource created"
            );
        }

        self.cache
            .insert(hash, (observed.id, prepared.policy_version));
        Ok(observed.id)
    }

    /// Number of cached resources.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

/// Last string value for `key`, ignoring other value types.
fn string_attribute(attributes: &[Attribute], key: &str) -> Option<String> {
    attributes
        .iter()
        .rev()
        .find(|a| a.key == key)
        .and_then(|a| a.value.as_str())
        .map(|s| storable_text(s).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyDocument, PolicyHandle};
    use crate::store::MemoryStore;
    use crate::value::{AttributeValue, ValueType};

    fn manager(store: &MemoryStore, policy: PolicyDocument) -> ResourceManager {
        let store: Arc<dyn WarehouseStore> = Arc::new(store.clone());
        let handle = Arc::new(PolicyHandle::with_base(policy, None).unwrap());
        let attributes = Arc::new(AttributeManager::new(
            Arc::clone(&store),
            handle,
            &CacheConfig::default(),
        ));
        ResourceManager::new(store, attributes, &CacheConfig::default())
    }

    fn checkout() -> Vec<Attribute> {
        vec![
            Attribute::new("service.name", AttributeValue::String("checkout".into())),
            Attribute::new("region", AttributeValue::String("us-east".into())),
        ]
    }

    #[tokio::test]
    async fn key_order_does_not_create_new_rows() {
        let store = MemoryStore::new();
        let manager = manager(&store, PolicyDocument::default());

        let mut reversed = checkout();
        reversed.reverse();

        let a = manager.get_or_create(&checkout(), None, 0).await.unwrap();
        let b = manager.get_or_create(&reversed, None, 0).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.resource_count(), 1);
    }

    #[tokio::test]
    async fn extracts_service_fields() {
        let store = MemoryStore::new();
        let manager = manager(&store, PolicyDocument::default());

        let mut attrs = checkout();
        attrs.push(Attribute::new(
            "service.namespace",
            AttributeValue::String("shop".into()),
        ));
        let id = manager
            .get_or_create(&attrs, Some("https://opentelemetry.io/schemas/1.26.0"), 2)
            .await
            .unwrap();

        let record = store.get_resource(id).await.unwrap().unwrap();
        assert_eq!(record.service_name.as_deref(), Some("checkout"));
        assert_eq!(record.service_namespace.as_deref(), Some("shop"));
        assert_eq!(
            record.schema_url.as_deref(),
            Some("https://opentelemetry.io/schemas/1.26.0")
        );
        assert_eq!(record.dropped_attribute_count, 2);
    }

    #[tokio::test]
    async fn non_string_service_name_is_not_extracted() {
        let store = MemoryStore::new();
        let manager = manager(&store, PolicyDocument::default());

        let id = manager
            .get_or_create(
                &[Attribute::new("service.name", AttributeValue::Int(7))],
                None,
                0,
            )
            .await
            .unwrap();
        let record = store.get_resource(id).await.unwrap().unwrap();
        assert_eq!(record.service_name, None);
    }

    #[tokio::test]
    async fn dropped_attributes_still_hash_and_count() {
        let store = MemoryStore::new();
        let policy = PolicyDocument::default()
            .promote(AttributeContext::Resource, ValueType::String, "service.name")
            .drop_key(AttributeContext::Resource, "region");
        let manager = manager(&store, policy);

        let with_region = manager.get_or_create(&checkout(), None, 1).await.unwrap();
        let without_region = manager
            .get_or_create(&checkout()[..1], None, 1)
            .await
            .unwrap();
        assert_ne!(with_region, without_region);

        let record = store.get_resource(with_region).await.unwrap().unwrap();
        assert_eq!(record.dropped_attribute_count, 2);
        assert!(!store.key_stored_anywhere("region"));
    }

    #[tokio::test]
    async fn cache_hit_advances_last_seen() {
        let store = MemoryStore::new();
        let manager = manager(&store, PolicyDocument::default());

        let id = manager.get_or_create(&checkout(), None, 0).await.unwrap();
        let first = store.get_resource(id).await.unwrap().unwrap();
        assert_eq!(manager.cached_len(), 1);

        manager.get_or_create(&checkout(), None, 0).await.unwrap();
        let second = store.get_resource(id).await.unwrap().unwrap();
        assert_eq!(first.first_seen, second.first_seen);
        assert!(second.last_seen >= first.last_seen);
    }

    #[tokio::test]
    async fn policy_reload_rewrites_cached_resource() {
        let store = MemoryStore::new();
        let manager = manager(&store, PolicyDocument::default());

        let id = manager.get_or_create(&checkout(), None, 0).await.unwrap();
        let before = store
            .load_attributes(AttributeContext::Resource, id.0)
            .await
            .unwrap();
        assert!(before.typed_value("region").is_none());
        assert_eq!(manager.cached_len(), 1);

        manager
            .attributes
            .policy()
            .reload(Some(&PolicyDocument::default().promote(
                AttributeContext::Resource,
                ValueType::String,
                "region",
            )))
            .unwrap();

        let again = manager.get_or_create(&checkout(), None, 0).await.unwrap();
        assert_eq!(id, again);
        assert_eq!(store.resource_count(), 1);

        let after = store
            .load_attributes(AttributeContext::Resource, id.0)
            .await
            .unwrap();
        assert_eq!(
            after.typed_value("region"),
            Some(&AttributeValue::String("us-east".into()))
        );
        assert_eq!(after.locations("region"), 1);
    }

    #[tokio::test]
    async fn missing_otlp_resource_is_empty_resource() {
        let store = MemoryStore::new();
        let manager = manager(&store, PolicyDocument::default());

        let a = manager.resolve(None, "").await.unwrap();
        let b = manager
            .resolve(Some(&Resource::default()), "")
            .await
            .unwrap();
        assert_eq!(a, b);
    }
}

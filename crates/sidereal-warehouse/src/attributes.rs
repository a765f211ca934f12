//! Attribute routing and storage.
//!
//! Every attribute of a parent row ends up in exactly one place: dropped,
//! one typed table, or the parent's catch-all document.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::error::WarehouseResult;
use crate::model::AttributeWriteSet;
use crate::policy::{AttributeAction, PolicyHandle};
use crate::registry::AttributeKeyRegistry;
use crate::signal::AttributeContext;
use crate::store::WarehouseStore;
use crate::value::{Attribute, AttributeValue};

/// Attributes classified under one policy snapshot, ready to write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedAttributes {
    /// Rows to write.
    pub set: AttributeWriteSet,
    /// Attributes discarded by the policy.
    pub dropped: u32,
    /// Version of the policy used for classification.
    pub policy_version: u64,
}

/// Classifies attributes and writes them to typed or catch-all storage.
#[derive(Debug)]
pub struct AttributeManager {
    store: Arc<dyn WarehouseStore>,
    registry: AttributeKeyRegistry,
    policy: Arc<PolicyHandle>,
}

impl AttributeManager {
    /// Create a manager with its own key registry.
    pub fn new(
        store: Arc<dyn WarehouseStore>,
        policy: Arc<PolicyHandle>,
        cache: &CacheConfig,
    ) -> Self {
        Self {
            registry: AttributeKeyRegistry::new(Arc::clone(&store), cache),
            store,
            policy,
        }
    }

    /// The policy handle this manager classifies with.
    pub fn policy(&self) -> &Arc<PolicyHandle> {
        &self.policy
    }

    /// The key registry.
    pub fn registry(&self) -> &AttributeKeyRegistry {
        &self.registry
    }

    /// Classify a parent's attributes and resolve promoted keys.
    ///
    /// Duplicate keys keep their last occurrence. The policy is loaded once,
    /// so the whole set is routed against one consistent version.
    pub async fn prepare(
        &self,
        context: AttributeContext,
        attributes: &[Attribute],
    ) -> WarehouseResult<PreparedAttributes> {
        let policy = self.policy.load();
        let mut prepared = PreparedAttributes {
            policy_version: policy.version(),
            ..PreparedAttributes::default()
        };

        for (key, value) in dedup(attributes) {
            match policy.classify(context, key, value.value_type()) {
                AttributeAction::Drop => prepared.dropped += 1,
                AttributeAction::Promote(value_type) => {
                    let key_id = self.registry.resolve(key, value_type).await?;
                    prepared.set.push_typed(key_id, value.clone());
                }
                AttributeAction::CatchAll => {
                    prepared
                        .set
                        .catch_all
                        .insert(key.to_owned(), serde_json::to_value(value)?);
                }
            }
        }

        Ok(prepared)
    }

    /// Classify and store a dimension row's attributes.
    ///
    /// The parent's previous attribute rows are replaced. Returns the number
    /// of attributes dropped by the policy.
    pub async fn store(
        &self,
        context: AttributeContext,
        parent_id: i64,
        attributes: &[Attribute],
    ) -> WarehouseResult<u32> {
        let prepared = self.prepare(context, attributes).await?;
        self.write_prepared(context, parent_id, &prepared).await?;
        Ok(prepared.dropped)
    }

    /// Store attributes classified earlier with [`Self::prepare`].
    pub async fn write_prepared(
        &self,
        context: AttributeContext,
        parent_id: i64,
        prepared: &PreparedAttributes,
    ) -> WarehouseResult<()> {
        self.store
            .replace_attributes(context, parent_id, &prepared.set)
            .await
    }

    /// Count the attributes the current policy would drop.
    pub fn count_dropped(&self, context: AttributeContext, attributes: &[Attribute]) -> u32 {
        let policy = self.policy.load();
        let dropped = dedup(attributes)
            .filter(|(key, _)| policy.should_drop(context, key))
            .count();
        u32::try_from(dropped).unwrap_or(u32::MAX)
    }
}

/// Attributes keyed by name, last occurrence winning, in key order.
fn dedup(attributes: &[Attribute]) -> impl Iterator<Item = (&str, &AttributeValue)> {
    attributes
        .iter()
        .map(|a| (a.key.as_str(), &a.value))
        .collect::<BTreeMap<_, _>>()
        .into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyDocument;
    use crate::store::MemoryStore;
    use crate::value::ValueType;

    fn manager(store: &MemoryStore, policy: PolicyDocument) -> AttributeManager {
        let handle = PolicyHandle::with_base(policy, None).unwrap();
        AttributeManager::new(
            Arc::new(store.clone()),
            Arc::new(handle),
            &CacheConfig::default(),
        )
    }

    fn attrs() -> Vec<Attribute> {
        vec![
            Attribute::new("http.route", AttributeValue::String("/cart".into())),
            Attribute::new("http.response.status_code", AttributeValue::Int(200)),
            Attribute::new("user.email", AttributeValue::String("a@b.c".into())),
            Attribute::new("retries", AttributeValue::Int(2)),
            Attribute::new("tags", AttributeValue::Complex(serde_json::json!(["a", "b"]))),
        ]
    }

    fn span_policy() -> PolicyDocument {
        PolicyDocument::default()
            .promote(AttributeContext::Span, ValueType::String, "http.route")
            .promote(AttributeContext::Span, ValueType::Int, "http.response.status_code")
            .drop_key(AttributeContext::Span, "user.email")
    }

    #[tokio::test]
    async fn prepare_routes_each_attribute_once() {
        let store = MemoryStore::new();
        let manager = manager(&store, span_policy());

        let prepared = manager.prepare(AttributeContext::Span, &attrs()).await.unwrap();
        assert_eq!(prepared.dropped, 1);
        assert_eq!(prepared.set.strings.len(), 1);
        assert_eq!(prepared.set.ints.len(), 1);
        assert_eq!(prepared.set.catch_all.len(), 2);
        assert_eq!(prepared.set.catch_all["retries"], serde_json::json!({"int": 2}));
        assert_eq!(
            prepared.set.catch_all["tags"],
            serde_json::json!({"complex": ["a", "b"]})
        );
        assert!(!prepared.set.catch_all.contains_key("user.email"));
    }

    #[tokio::test]
    async fn only_promoted_keys_are_registered() {
        let store = MemoryStore::new();
        let manager = manager(&store, span_policy());

        manager.prepare(AttributeContext::Span, &attrs()).await.unwrap();
        assert_eq!(store.key_count(), 2);
        let key = store.attribute_key("http.route").await.unwrap().unwrap();
        assert!(key.searchable);
        assert_eq!(key.declared_type, ValueType::String);
    }

    #[tokio::test]
    async fn wrong_type_falls_back_to_catch_all() {
        let store = MemoryStore::new();
        let manager = manager(&store, span_policy());

        let prepared = manager
            .prepare(
                AttributeContext::Span,
                &[Attribute::new(
                    "http.response.status_code",
                    AttributeValue::String("200".into()),
                )],
            )
            .await
            .unwrap();
        assert!(prepared.set.ints.is_empty());
        assert_eq!(
            prepared.set.catch_all["http.response.status_code"],
            serde_json::json!({"string": "200"})
        );
    }

    #[tokio::test]
    async fn duplicate_keys_keep_last() {
        let store = MemoryStore::new();
        let manager = manager(&store, span_policy());

        let prepared = manager
            .prepare(
                AttributeContext::Span,
                &[
                    Attribute::new("http.route", AttributeValue::String("/a".into())),
                    Attribute::new("http.route", AttributeValue::String("/b".into())),
                ],
            )
            .await
            .unwrap();
        assert_eq!(prepared.set.strings.len(), 1);
        assert_eq!(prepared.set.strings[0].1, "/b");
    }

    #[tokio::test]
    async fn store_writes_exclusive_rows() {
        let store = MemoryStore::new();
        let manager = manager(&store, span_policy());

        let dropped = manager.store(AttributeContext::Span, 7, &attrs()).await.unwrap();
        assert_eq!(dropped, 1);

        for attr in attrs() {
            let expected = usize::from(attr.key != "user.email");
            assert_eq!(
                store.attribute_locations(AttributeContext::Span, 7, &attr.key),
                expected,
                "{}",
                attr.key
            );
        }
    }

    #[tokio::test]
    async fn reload_changes_routing_of_rewrites() {
        let store = MemoryStore::new();
        let manager = manager(&store, PolicyDocument::default());
        let region = [Attribute::new("region", AttributeValue::String("eu".into()))];

        manager.store(AttributeContext::Resource, 1, &region).await.unwrap();
        let stored = store.load_attributes(AttributeContext::Resource, 1).await.unwrap();
        assert!(stored.typed.is_empty());

        manager
            .policy()
            .reload(Some(&PolicyDocument::default().promote(
                AttributeContext::Resource,
                ValueType::String,
                "region",
            )))
            .unwrap();
        manager.store(AttributeContext::Resource, 1, &region).await.unwrap();

        let stored = store.load_attributes(AttributeContext::Resource, 1).await.unwrap();
        assert_eq!(
            stored.typed_value("region"),
            Some(&AttributeValue::String("eu".into()))
        );
        assert!(stored.catch_all.is_none());
    }

    #[test]
    fn count_dropped_uses_policy() {
        let store = MemoryStore::new();
        let manager = manager(&store, span_policy());
        assert_eq!(manager.count_dropped(AttributeContext::Span, &attrs()), 1);
        assert_eq!(manager.count_dropped(AttributeContext::Log, &attrs()), 0);
    }
}

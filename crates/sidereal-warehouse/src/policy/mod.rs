//! Attribute promotion policy.
//!
//! Decides, per attribute context, key and value type, whether an attribute
//! is dropped, promoted into a typed table, or left to the catch-all
//! document.
//!
//! # Configuration
//!
//! ```toml
//! [promote.resource]
//! string = ["service.name", "service.namespace"]
//!
//! [promote.span]
//! int = ["http.response.status_code"]
//!
//! [drop]
//! resource = ["process.command_args"]
//! ```
//!
//! A shipped base document is always enforced. An optional override
//! document is merged over it: promotions are the union of both, and a key
//! listed in either `drop` section is never promoted.

mod handle;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use self::handle::PolicyHandle;
use crate::error::{WarehouseError, WarehouseResult};
use crate::signal::AttributeContext;
use crate::value::ValueType;

/// The policy document shipped with the crate.
const SHIPPED_BASE_POLICY: &str = include_str!("base_policy.toml");

/// Routing decision for a single attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeAction {
    /// Discard the attribute.
    Drop,
    /// Store in the typed table for this value type.
    Promote(ValueType),
    /// Store in the catch-all document.
    CatchAll,
}

/// A promotion/drop document, as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyDocument {
    /// Keys to promote, by context and value type.
    pub promote: BTreeMap<AttributeContext, BTreeMap<ValueType, Vec<String>>>,
    /// Keys to drop, by context.
    pub drop: BTreeMap<AttributeContext, Vec<String>>,
}

impl PolicyDocument {
    /// Parse the base document shipped with the crate.
    pub fn shipped() -> WarehouseResult<Self> {
        Self::from_toml_str(SHIPPED_BASE_POLICY)
    }

    /// Parse a TOML policy document.
    pub fn from_toml_str(s: &str) -> WarehouseResult<Self> {
        toml::from_str(s).map_err(|e| WarehouseError::policy(format!("invalid TOML policy: {e}")))
    }

    /// Parse a JSON policy document.
    pub fn from_json_str(s: &str) -> WarehouseResult<Self> {
        serde_json::from_str(s)
            .map_err(|e| WarehouseError::policy(format!("invalid JSON policy: {e}")))
    }

    /// Load a policy document from disk.
    ///
    /// Files ending in `.json` are parsed as JSON, everything else as TOML.
    pub fn from_path(path: &Path) -> WarehouseResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            WarehouseError::policy(format!("cannot read {}: {e}", path.display()))
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&contents)
        } else {
            Self::from_toml_str(&contents)
        }
    }

    /// Add a promotion entry.
    #[must_use]
    pub fn promote(
        mut self,
        context: AttributeContext,
        value_type: ValueType,
        key: impl Into<String>,
    ) -> Self {
        self.promote
            .entry(context)
            .or_default()
            .entry(value_type)
            .or_default()
            .push(key.into());
        self
    }

    /// Add a drop entry.
    #[must_use]
    pub fn drop_key(mut self, context: AttributeContext, key: impl Into<String>) -> Self {
        self.drop.entry(context).or_default().push(key.into());
        self
    }

    fn validate(&self, label: &str) -> WarehouseResult<()> {
        let promoted = self
            .promote
            .iter()
            .flat_map(|(context, by_type)| by_type.values().flatten().map(move |k| (context, k)));
        let dropped = self
            .drop
            .iter()
            .flat_map(|(context, keys)| keys.iter().map(move |k| (context, k)));

        for (context, key) in promoted.chain(dropped) {
            if key.is_empty() {
                return Err(WarehouseError::policy(format!(
                    "{label} policy lists an empty key for context '{context}'"
                )));
            }
        }
        Ok(())
    }
}

/// A merged, immutable promotion policy.
///
/// Lookups are pure and safe for concurrent reads.
#[derive(Debug, Clone, Default)]
pub struct PromotionPolicy {
    version: u64,
    promoted: HashMap<AttributeContext, HashMap<String, BTreeSet<ValueType>>>,
    dropped: HashMap<AttributeContext, HashSet<String>>,
}

impl PromotionPolicy {
    /// Merge a base document with an optional override.
    ///
    /// Promotions are the union of both documents; drops from either
    /// document remove the key from every promoted type.
    pub fn merge(
        base: &PolicyDocument,
        overrides: Option<&PolicyDocument>,
        version: u64,
    ) -> WarehouseResult<Self> {
        base.validate("base")?;
        if let Some(o) = overrides {
            o.validate("override")?;
        }

        let mut policy = Self {
            version,
            ..Self::default()
        };

        for doc in std::iter::once(base).chain(overrides) {
            for (context, by_type) in &doc.promote {
                let keys = policy.promoted.entry(*context).or_default();
                for (value_type, names) in by_type {
                    for name in names {
                        keys.entry(name.clone()).or_default().insert(*value_type);
                    }
                }
            }
            for (context, names) in &doc.drop {
                policy
                    .dropped
                    .entry(*context)
                    .or_default()
                    .extend(names.iter().cloned());
            }
        }

        for (context, dropped) in &policy.dropped {
            if let Some(promoted) = policy.promoted.get_mut(context) {
                promoted.retain(|key, _| !dropped.contains(key));
            }
        }

        Ok(policy)
    }

    /// Version number assigned when this policy was built.
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Whether the key is dropped in this context.
    pub fn should_drop(&self, context: AttributeContext, key: &str) -> bool {
        self.dropped
            .get(&context)
            .is_some_and(|keys| keys.contains(key))
    }

    /// Whether the key is promoted for exactly this value type.
    pub fn is_promoted(&self, context: AttributeContext, key: &str, value_type: ValueType) -> bool {
        self.promoted
            .get(&context)
            .and_then(|keys| keys.get(key))
            .is_some_and(|types| types.contains(&value_type))
    }

    /// Route a single attribute.
    ///
    /// `value_type` is `None` for complex values, which are never promoted.
    pub fn classify(
        &self,
        context: AttributeContext,
        key: &str,
        value_type: Option<ValueType>,
    ) -> AttributeAction {
        if self.should_drop(context, key) {
            return AttributeAction::Drop;
        }
        match value_type {
            Some(vt) if self.is_promoted(context, key, vt) => AttributeAction::Promote(vt),
            _ => AttributeAction::CatchAll,
        }
    }

    /// Number of (context, key, type) promotions.
    pub fn promoted_count(&self) -> usize {
        self.promoted
            .values()
            .flat_map(HashMap::values)
            .map(BTreeSet::len)
            .sum()
    }

    /// Number of (context, key) drops.
    pub fn dropped_count(&self) -> usize {
        self.dropped.values().map(HashSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shipped_policy_parses() {
        let base = PolicyDocument::shipped().unwrap();
        let policy = PromotionPolicy::merge(&base, None, 1).unwrap();
        assert!(policy.is_promoted(
            AttributeContext::Resource,
            "service.name",
            ValueType::String
        ));
        assert!(policy.is_promoted(
            AttributeContext::Span,
            "http.response.status_code",
            ValueType::Int
        ));
    }

    #[test]
    fn deserialise_override_toml() {
        let doc = PolicyDocument::from_toml_str(
            r#"
            [promote.span]
            string = ["tenant.id"]
            bool = ["cache.hit"]

            [drop]
            log = ["password"]
            "#,
        )
        .unwrap();

        assert_eq!(
            doc.promote[&AttributeContext::Span][&ValueType::Bool],
            vec!["cache.hit".to_string()]
        );
        assert_eq!(doc.drop[&AttributeContext::Log], vec!["password".to_string()]);
    }

    #[test]
    fn deserialise_override_json() {
        let doc = PolicyDocument::from_json_str(
            r#"{"promote": {"data_point": {"double": ["ratio"]}}, "drop": {"scope": ["x"]}}"#,
        )
        .unwrap();
        let policy = PromotionPolicy::merge(&PolicyDocument::default(), Some(&doc), 1).unwrap();
        assert!(policy.is_promoted(AttributeContext::DataPoint, "ratio", ValueType::Double));
        assert!(policy.should_drop(AttributeContext::Scope, "x"));
    }

    #[test]
    fn unknown_context_is_rejected() {
        let err = PolicyDocument::from_toml_str("[drop]\nmetric_name = [\"x\"]\n").unwrap_err();
        assert!(matches!(err, WarehouseError::Policy(_)));
    }

    #[test]
    fn unknown_section_is_rejected() {
        let err = PolicyDocument::from_toml_str("[demote]\nlog = [\"x\"]\n").unwrap_err();
        assert!(matches!(err, WarehouseError::Policy(_)));
    }

    #[test]
    fn empty_key_is_rejected() {
        let doc = PolicyDocument::default().drop_key(AttributeContext::Log, "");
        let err = PromotionPolicy::merge(&PolicyDocument::default(), Some(&doc), 1).unwrap_err();
        assert!(matches!(err, WarehouseError::Policy(_)));
    }

    #[test]
    fn promotions_are_a_union() {
        let base = PolicyDocument::default().promote(
            AttributeContext::Span,
            ValueType::String,
            "http.route",
        );
        let overrides = PolicyDocument::default().promote(
            AttributeContext::Span,
            ValueType::Int,
            "retry.count",
        );
        let policy = PromotionPolicy::merge(&base, Some(&overrides), 1).unwrap();

        assert!(policy.is_promoted(AttributeContext::Span, "http.route", ValueType::String));
        assert!(policy.is_promoted(AttributeContext::Span, "retry.count", ValueType::Int));
        assert_eq!(policy.promoted_count(), 2);
    }

    #[test]
    fn drop_wins_over_promotion() {
        let base = PolicyDocument::default().promote(
            AttributeContext::Resource,
            ValueType::String,
            "region",
        );
        let overrides = PolicyDocument::default()
            .promote(AttributeContext::Resource, ValueType::String, "region")
            .drop_key(AttributeContext::Resource, "region");
        let policy = PromotionPolicy::merge(&base, Some(&overrides), 1).unwrap();

        assert_eq!(
            policy.classify(AttributeContext::Resource, "region", Some(ValueType::String)),
            AttributeAction::Drop
        );
        assert!(!policy.is_promoted(AttributeContext::Resource, "region", ValueType::String));
    }

    #[test]
    fn base_drop_cannot_be_undone() {
        let base = PolicyDocument::default().drop_key(AttributeContext::Log, "secret");
        let overrides =
            PolicyDocument::default().promote(AttributeContext::Log, ValueType::String, "secret");
        let policy = PromotionPolicy::merge(&base, Some(&overrides), 1).unwrap();
        assert!(policy.should_drop(AttributeContext::Log, "secret"));
    }

    #[test]
    fn promotion_is_type_exact() {
        let base = PolicyDocument::default().promote(
            AttributeContext::Span,
            ValueType::Int,
            "http.response.status_code",
        );
        let policy = PromotionPolicy::merge(&base, None, 1).unwrap();

        assert_eq!(
            policy.classify(
                AttributeContext::Span,
                "http.response.status_code",
                Some(ValueType::String)
            ),
            AttributeAction::CatchAll
        );
        assert_eq!(
            policy.classify(
                AttributeContext::Span,
                "http.response.status_code",
                Some(ValueType::Int)
            ),
            AttributeAction::Promote(ValueType::Int)
        );
    }

    #[test]
    fn complex_values_never_promote() {
        let base = PolicyDocument::default().promote(
            AttributeContext::Log,
            ValueType::String,
            "tags",
        );
        let policy = PromotionPolicy::merge(&base, None, 1).unwrap();
        assert_eq!(
            policy.classify(AttributeContext::Log, "tags", None),
            AttributeAction::CatchAll
        );
    }

    #[test]
    fn contexts_are_independent() {
        let base = PolicyDocument::default().drop_key(AttributeContext::Log, "user.email");
        let policy = PromotionPolicy::merge(&base, None, 1).unwrap();
        assert!(policy.should_drop(AttributeContext::Log, "user.email"));
        assert!(!policy.should_drop(AttributeContext::Span, "user.email"));
    }

    #[test]
    fn load_from_json_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("override.json");
        std::fs::write(&path, r#"{"drop": {"span": ["db.statement"]}}"#).unwrap();

        let doc = PolicyDocument::from_path(&path).unwrap();
        assert_eq!(doc.drop[&AttributeContext::Span], vec!["db.statement".to_string()]);
    }

    #[test]
    fn missing_path_is_policy_error() {
        let err = PolicyDocument::from_path(Path::new("/nonexistent/policy.toml")).unwrap_err();
        assert!(matches!(err, WarehouseError::Policy(_)));
    }
}

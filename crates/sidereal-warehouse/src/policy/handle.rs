//! Shared, reloadable access to the merged promotion policy.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use super::{PolicyDocument, PromotionPolicy};
use crate::error::WarehouseResult;

/// Single indirection point for the active policy.
///
/// Readers take a cheap snapshot with [`PolicyHandle::load`]; a reload
/// builds a complete new policy and swaps it in atomically. A policy value
/// is never mutated in place.
#[derive(Debug)]
pub struct PolicyHandle {
    base: PolicyDocument,
    current: ArcSwap<PromotionPolicy>,
    next_version: AtomicU64,
}

impl PolicyHandle {
    /// Build from the shipped base policy and an optional override.
    pub fn new(overrides: Option<&PolicyDocument>) -> WarehouseResult<Self> {
        Self::with_base(PolicyDocument::shipped()?, overrides)
    }

    /// Build from the shipped base policy and an override file.
    pub fn from_override_path(path: &Path) -> WarehouseResult<Self> {
        let overrides = PolicyDocument::from_path(path)?;
        Self::new(Some(&overrides))
    }

    /// Build from an explicit base document.
    pub fn with_base(
        base: PolicyDocument,
        overrides: Option<&PolicyDocument>,
    ) -> WarehouseResult<Self> {
        let policy = PromotionPolicy::merge(&base, overrides, 1)?;
        info!(
            version = policy.version(),
            promoted = policy.promoted_count(),
            dropped = policy.dropped_count(),
            "Promotion policy loaded"
        );
        Ok(Self {
            base,
            current: ArcSwap::from_pointee(policy),
            next_version: AtomicU64::new(2),
        })
    }

    /// Snapshot of the active policy.
    pub fn load(&self) -> Arc<PromotionPolicy> {
        self.current.load_full()
    }

    /// Replace the override document.
    ///
    /// On error the previous policy stays in force.
    pub fn reload(&self, overrides: Option<&PolicyDocument>) -> WarehouseResult<Arc<PromotionPolicy>> {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let policy = Arc::new(PromotionPolicy::merge(&self.base, overrides, version)?);
        self.current.store(Arc::clone(&policy));
        info!(
            version,
            promoted = policy.promoted_count(),
            dropped = policy.dropped_count(),
            "Promotion policy reloaded"
        );
        Ok(policy)
    }

    /// Replace the override document from a file.
    pub fn reload_from_path(&self, path: &Path) -> WarehouseResult<Arc<PromotionPolicy>> {
        let overrides = PolicyDocument::from_path(path)?;
        self.reload(Some(&overrides))
    }
}

//! Sidereal Warehouse - dimension-deduplicating telemetry storage.
//!
//! This crate stores OTLP logs, traces and metrics in a relational schema
//! that:
//! - Deduplicates resources, instrumentation scopes and metric descriptors
//!   into dimension rows keyed by a stable identity hash
//! - Promotes selected attributes into typed, indexable tables according to
//!   a reloadable policy, keeping the rest in a JSON catch-all
//! - Writes each batch's facts in a single transaction after every
//!   dimension it references has been resolved
//!
//! ## Architecture
//!
//! ```text
//! OTLP request → LogStorage / TraceStorage / MetricStorage
//!                    │ phase 1: ResourceManager, ScopeManager,
//!                    │          MetricDimensionManager, AttributeManager
//!                    │ phase 2: FactTransaction (all-or-nothing)
//!                    ↓
//!             WarehouseStore (PostgreSQL | memory)
//! ```

pub mod attributes;
pub mod config;
pub mod dimensions;
pub mod error;
pub mod identity;
pub mod model;
pub mod policy;
pub mod registry;
pub mod signal;
pub mod signals;
pub mod store;
pub mod value;
pub mod warehouse;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use config::WarehouseConfig;
pub use error::{WarehouseError, WarehouseResult};
pub use policy::{PolicyDocument, PolicyHandle};
pub use signal::{AttributeContext, Signal};
pub use store::{MemoryStore, PostgresStore, WarehouseStore};
pub use warehouse::Warehouse;

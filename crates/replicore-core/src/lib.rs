//! Configuration, catalog ingestion and cycle orchestration.
//!
//! [`Config`] compiles a TOML file into partitions, quotas, a retention
//! policy stack and a placement producer set. [`InventoryLoader`] refreshes
//! an [`Inventory`](replicore_types::Inventory) from a [`CatalogFeed`];
//! [`SnapshotGuard`] refuses cycles on a stale snapshot. [`RetentionCycle`]
//! and [`PlacementCycle`] run one decision pass each, and [`Engine`] wires
//! them together.

pub mod config;
pub mod engine;
pub mod loader;
pub mod placement;
pub mod retention;

pub use config::{
    Config, PartitionConfig, PlacementConfig, PolicyConfig, ProducerConfig, QuotaAmount, QuotaConfig,
    QuotaSource, RetentionConfig, SnapshotConfig, install_quotas,
};
pub use engine::Engine;
pub use loader::{CatalogFeed, InventoryLoader, RefreshReport, ReplicaUpdate, RetryPolicy, SnapshotGuard};
pub use placement::{DropReason, PlacementCycle, PlacementReport, PlacementSink};
pub use retention::{CancelToken, DecisionSink, JsonLinesSink, MemorySink, RetentionCycle, RetentionReport};

//! Wiring of configuration, snapshot and cycles.
//!
//! The engine owns the inventory. Collaborators (catalog feed, request
//! producers, quota source, sinks) are handed in by the caller; nothing is
//! looked up from process-wide state.

use rand::Rng;
use replicore_error::{ReplicoreError, Result};
use replicore_policy::RequestProducer;
use replicore_rules::VariableRegistry;
use replicore_types::Inventory;
use tracing::info;

use crate::config::{Config, QuotaSource, install_quotas};
use crate::loader::{CatalogFeed, InventoryLoader, RefreshReport, SnapshotGuard};
use crate::placement::{PlacementCycle, PlacementReport, PlacementSink};
use crate::retention::{CancelToken, DecisionSink, RetentionCycle, RetentionReport};

pub struct Engine {
    inventory: Inventory,
    loader: InventoryLoader,
    guard: SnapshotGuard,
    quota_source: Box<dyn QuotaSource>,
    retention: Option<RetentionCycle>,
    placement: Option<PlacementCycle>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("inventory", &self.inventory.counts())
            .field("loader", &self.loader)
            .field("guard", &self.guard)
            .field("retention", &self.retention.as_ref().map(|cycle| cycle.stack().name()))
            .field("placement", &self.placement.is_some())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build partitions and compile cycles. Any configuration problem fails
    /// here, before a cycle can start.
    pub fn new(config: Config, registry: &VariableRegistry, producers: Vec<Box<dyn RequestProducer>>) -> Result<Self> {
        config.validate(registry)?;
        let mut inventory = Inventory::new();
        config.install_partitions(&mut inventory, registry)?;
        let retention = config
            .retention
            .as_ref()
            .map(|retention| RetentionCycle::from_config(retention, &inventory, registry))
            .transpose()?;
        let placement = match &config.placement {
            Some(placement) => Some(PlacementCycle::from_config(placement, &inventory, producers)?),
            None => None,
        };
        info!(
            partitions = config.partitions.len(),
            retention = retention.is_some(),
            placement = placement.is_some(),
            "engine configured"
        );
        Ok(Self {
            inventory,
            loader: InventoryLoader::from_config(&config.snapshot),
            guard: SnapshotGuard::new(config.snapshot.max_staleness_secs),
            retention,
            placement,
            quota_source: Box::new(config),
        })
    }

    /// Replace the quota source; the configuration's static quotas are the
    /// default.
    #[must_use]
    pub fn with_quota_source(mut self, source: Box<dyn QuotaSource>) -> Self {
        self.quota_source = source;
        self
    }

    #[must_use]
    pub const fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Mutable access for demand producers writing attributes.
    pub fn inventory_mut(&mut self) -> &mut Inventory {
        &mut self.inventory
    }

    #[must_use]
    pub const fn snapshot(&self) -> &SnapshotGuard {
        &self.guard
    }

    /// Refresh the snapshot from `feed` and reinstall quotas.
    ///
    /// A quota source that fails or yields a rejected quota set fails the
    /// refresh as a whole. Returns `Ok(None)` when the refresh failed but the
    /// previous snapshot is still within the staleness limit.
    pub fn refresh(&mut self, feed: &dyn CatalogFeed, now: i64) -> Result<Option<RefreshReport>> {
        let outcome = self.loader.refresh(&mut self.inventory, feed, now).and_then(|report| {
            let quotas = self.quota_source.quotas()?;
            install_quotas(&mut self.inventory, &quotas)?;
            Ok(report)
        });
        self.guard.observe(outcome, now)
    }

    pub fn run_retention(&self, now: i64, cancel: &CancelToken, sink: &mut dyn DecisionSink) -> Result<RetentionReport> {
        self.guard.check(now)?;
        let cycle = self
            .retention
            .as_ref()
            .ok_or_else(|| ReplicoreError::config("no retention section configured"))?;
        cycle.run(&self.inventory, now, cancel, sink)
    }

    pub fn run_placement<R: Rng + ?Sized>(
        &mut self,
        now: i64,
        rng: &mut R,
        sink: &mut dyn PlacementSink,
    ) -> Result<PlacementReport> {
        self.guard.check(now)?;
        let cycle = self
            .placement
            .as_mut()
            .ok_or_else(|| ReplicoreError::config("no placement section configured"))?;
        cycle.run(&self.inventory, rng, sink)
    }
}

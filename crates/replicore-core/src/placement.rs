//! Placement cycles: merge producer requests and screen destinations.

use std::collections::HashMap;
use std::fmt;

use rand::Rng;
use replicore_error::{ReplicoreError, Result};
use replicore_policy::{PlacementRequest, RequestAggregator, RequestItem, RequestProducer};
use replicore_types::{Inventory, PartitionId, SiteId, SiteStatus};
use tracing::{debug, error, info, info_span};

use crate::config::PlacementConfig;

/// Receives the accepted request list of a placement cycle.
pub trait PlacementSink {
    fn submit(&mut self, requests: &[PlacementRequest]) -> Result<()>;
}

impl PlacementSink for Vec<PlacementRequest> {
    fn submit(&mut self, requests: &[PlacementRequest]) -> Result<()> {
        self.extend_from_slice(requests);
        Ok(())
    }
}

/// Why a request was not forwarded.
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    UnknownSite,
    NotReady(SiteStatus),
    Full { occupancy: f64 },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSite => f.write_str("unknown destination"),
            Self::NotReady(status) => write!(f, "destination is {}", status.as_str()),
            Self::Full { occupancy } => write!(f, "destination occupancy {occupancy:.3}"),
        }
    }
}

#[derive(Debug, Default)]
pub struct PlacementReport {
    pub accepted: Vec<PlacementRequest>,
    pub dropped: Vec<(PlacementRequest, DropReason)>,
}

/// Aggregator plus destination screening.
#[derive(Debug)]
pub struct PlacementCycle {
    aggregator: RequestAggregator,
    partition: Option<PartitionId>,
    occupancy_ceiling: f64,
}

impl PlacementCycle {
    #[must_use]
    pub const fn new(aggregator: RequestAggregator) -> Self {
        Self {
            aggregator,
            partition: None,
            occupancy_ceiling: 1.0,
        }
    }

    /// Build from configuration, picking producers by name from `available`.
    pub fn from_config(
        config: &PlacementConfig,
        inventory: &Inventory,
        available: Vec<Box<dyn RequestProducer>>,
    ) -> Result<Self> {
        let mut cycle = Self::new(config.build_aggregator(available)?).with_ceiling(config.occupancy_ceiling);
        if let Some(name) = &config.partition {
            let partition = inventory
                .find_partition(name)
                .ok_or_else(|| ReplicoreError::config(format!("unknown partition {name}")))?;
            cycle = cycle.gated_by(partition);
        }
        Ok(cycle)
    }

    /// Drop destinations whose occupancy of `partition` is at or above the
    /// ceiling.
    #[must_use]
    pub const fn gated_by(mut self, partition: PartitionId) -> Self {
        self.partition = Some(partition);
        self
    }

    #[must_use]
    pub fn with_ceiling(mut self, ceiling: f64) -> Self {
        self.occupancy_ceiling = ceiling;
        self
    }

    /// Check one request against the destination's state plus the bytes
    /// already accepted for it this cycle.
    fn screen(
        &self,
        inventory: &Inventory,
        request: &PlacementRequest,
        incoming: &HashMap<SiteId, u64>,
    ) -> Result<std::result::Result<SiteId, DropReason>> {
        let Some(site_id) = inventory.find_site(&request.destination) else {
            return Ok(Err(DropReason::UnknownSite));
        };
        let site = inventory.require_site(site_id)?;
        if site.status != SiteStatus::Ready {
            return Ok(Err(DropReason::NotReady(site.status)));
        }
        if let Some(partition) = self.partition {
            // Logical size: transfers already queued count as if complete.
            let pending = incoming.get(&site_id).copied().unwrap_or(0);
            let occupancy = inventory.projected_occupancy(site_id, partition, false, pending)?;
            if occupancy >= self.occupancy_ceiling {
                return Ok(Err(DropReason::Full { occupancy }));
            }
        }
        Ok(Ok(site_id))
    }

    pub fn run<R: Rng + ?Sized>(
        &mut self,
        inventory: &Inventory,
        rng: &mut R,
        sink: &mut dyn PlacementSink,
    ) -> Result<PlacementReport> {
        let span = info_span!("placement_cycle", producers = self.aggregator.len());
        let _guard = span.enter();

        let merged = self.aggregator.run(inventory, rng)?;
        let mut report = PlacementReport::default();
        let mut incoming: HashMap<SiteId, u64> = HashMap::new();
        for request in merged {
            match self.screen(inventory, &request, &incoming)? {
                Ok(site) => {
                    *incoming.entry(site).or_default() += item_bytes(inventory, &request.item);
                    report.accepted.push(request);
                }
                Err(reason) => {
                    debug!(item = %request.item, destination = %request.destination, %reason, "request dropped");
                    report.dropped.push((request, reason));
                }
            }
        }
        if let Err(err) = sink.submit(&report.accepted) {
            error!(error = %err, "placement submit failed");
            return Err(err);
        }
        info!(
            accepted = report.accepted.len(),
            dropped = report.dropped.len(),
            "placement cycle submitted"
        );
        Ok(report)
    }
}

/// Logical bytes a request brings to its destination. Unknown items count
/// as empty.
fn item_bytes(inventory: &Inventory, item: &RequestItem) -> u64 {
    match item {
        RequestItem::Dataset(name) => inventory
            .find_dataset(name)
            .and_then(|id| inventory.dataset(id))
            .map_or(0, |dataset| dataset.size),
        RequestItem::Block { dataset, block } => inventory
            .find_dataset(dataset)
            .and_then(|id| inventory.find_block(id, *block))
            .and_then(|id| inventory.block(id))
            .map_or(0, |entry| entry.size),
    }
}

//! Partition quotas and occupancy at a site.

use replicore_error::{ObjectKind, ReplicoreError, Result};
use tracing::debug;

use crate::ids::{PartitionId, SiteId};
use crate::inventory::Inventory;
use crate::partition::{QuotaSlot, ReplicaShare, SitePartition};

impl Inventory {
    fn site_partition(&self, site: SiteId, partition: PartitionId) -> Result<&SitePartition> {
        let site_entry = self.require_site(site)?;
        site_entry.site_partition(partition).ok_or_else(|| {
            ReplicoreError::not_found(
                ObjectKind::SitePartition,
                format!("{partition}@{}", site_entry.name()),
            )
        })
    }

    /// Quota in bytes of a partition at a site.
    ///
    /// `0` means the site does not serve the partition and a negative value
    /// means unlimited. A superpartition's quota is the sum of its children's
    /// quotas at the same site, recomputed on every call.
    pub fn quota(&self, site: SiteId, partition: PartitionId) -> Result<i64> {
        match self.site_partition(site, partition)?.quota_slot() {
            QuotaSlot::Leaf(quota) => Ok(quota),
            QuotaSlot::Derived => {
                let children = self
                    .require_partition(partition)?
                    .subpartitions()
                    .unwrap_or_default()
                    .to_vec();
                let mut total: i64 = 0;
                for child in children {
                    let child_quota = match self.quota(site, child) {
                        Ok(quota) => quota,
                        Err(ReplicoreError::NotFound { .. }) => 0,
                        Err(other) => return Err(other),
                    };
                    total = total.saturating_add(child_quota);
                }
                Ok(total)
            }
        }
    }

    /// Whether `quota` may be stored for `partition`.
    ///
    /// Superpartition quotas are derived and cannot be set. A partition that
    /// belongs to a superpartition cannot be unlimited.
    pub fn check_quota(&self, partition: PartitionId, quota: i64) -> Result<()> {
        let entry = self.require_partition(partition)?;
        if entry.is_super() {
            return Err(ReplicoreError::integrity(format!(
                "quota of superpartition {} is derived from its children",
                entry.name()
            )));
        }
        if quota < 0 {
            if let Some(parent) = entry.parent() {
                return Err(ReplicoreError::integrity(format!(
                    "subpartition {} of {parent} cannot have an unlimited quota",
                    entry.name()
                )));
            }
        }
        Ok(())
    }

    /// Store the quota of a leaf partition at a site.
    pub fn set_quota(&mut self, site: SiteId, partition: PartitionId, quota: i64) -> Result<()> {
        self.check_quota(partition, quota)?;
        let name = self.require_partition(partition)?.name().to_owned();
        let site_entry = self
            .sites
            .get_mut(site)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Site, site.to_string()))?;
        let site_partition = site_entry.partitions.get_mut(&partition).ok_or_else(|| {
            ReplicoreError::not_found(ObjectKind::SitePartition, format!("{name}@{site}"))
        })?;
        site_partition.quota = QuotaSlot::Leaf(quota);
        debug!(partition = %name, site = %site, quota, "quota set");
        Ok(())
    }

    /// Bytes of the partition's replicas at the site.
    ///
    /// Replicas entirely inside count their whole size; partially contained
    /// replicas count only the member block replicas.
    pub fn occupied_bytes(&self, site: SiteId, partition: PartitionId, physical: bool) -> Result<u64> {
        let site_partition = self.site_partition(site, partition)?;
        let mut total: u64 = 0;
        for (replica, share) in site_partition.replicas() {
            let bytes = match share {
                ReplicaShare::Entire => self.dataset_replica_size(replica, physical)?,
                ReplicaShare::Blocks(members) => {
                    self.block_replica_set_size(members.iter().copied(), physical)
                }
            };
            total = total.saturating_add(bytes);
        }
        Ok(total)
    }

    /// Occupied bytes over quota.
    ///
    /// A zero quota yields `f64::MAX` and an unlimited quota yields `0.0`.
    pub fn occupancy_fraction(&self, site: SiteId, partition: PartitionId, physical: bool) -> Result<f64> {
        self.projected_occupancy(site, partition, physical, 0)
    }

    /// Occupancy once `incoming` more bytes have landed in the partition.
    #[allow(clippy::cast_precision_loss)]
    pub fn projected_occupancy(
        &self,
        site: SiteId,
        partition: PartitionId,
        physical: bool,
        incoming: u64,
    ) -> Result<f64> {
        let quota = self.quota(site, partition)?;
        if quota == 0 {
            return Ok(f64::MAX);
        }
        if quota < 0 {
            return Ok(0.0);
        }
        let occupied = self
            .occupied_bytes(site, partition, physical)?
            .saturating_add(incoming);
        Ok(occupied as f64 / quota as f64)
    }
}

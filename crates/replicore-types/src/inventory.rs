//! The replica inventory: arena storage for every entity plus the reverse
//! indices that tie them together.
//!
//! Invariants maintained by every mutating method:
//!
//! 1. A linked dataset replica is listed in its dataset's replica list and in
//!    its site's replica map, and every block replica it lists is in the
//!    site's block replica index and its block's replica list.
//! 2. Every site has exactly one [`SitePartition`] per partition.
//! 3. Site partition membership reflects the current block replica values.
//! 4. No block replica refers to a deleted group; deleting a group moves its
//!    replicas to the null group.
//! 5. Nothing is removed from an arena while a reverse index still refers to it.

use std::collections::{HashMap, HashSet};

use replicore_error::{ObjectKind, ReplicoreError, Result};
use tracing::{debug, info};

use crate::block_name::BlockName;
use crate::entity::{AttrValue, Block, BlockList, Dataset, Group, Site};
use crate::ids::{
    Arena, BlockId, BlockReplicaId, DatasetId, DatasetReplicaId, GroupId, PartitionId, SiteId,
};
use crate::partition::{Partition, PartitionKind, QuotaSlot, ReplicaShare, SitePartition};
use crate::replica::{BlockReplica, DatasetReplica, DetachedDatasetReplica};

/// In-memory snapshot of the replica graph.
#[derive(Debug, Clone)]
pub struct Inventory {
    pub(crate) datasets: Arena<DatasetId, Dataset>,
    pub(crate) blocks: Arena<BlockId, Block>,
    pub(crate) sites: Arena<SiteId, Site>,
    pub(crate) groups: Arena<GroupId, Group>,
    pub(crate) dataset_replicas: Arena<DatasetReplicaId, DatasetReplica>,
    pub(crate) block_replicas: Arena<BlockReplicaId, BlockReplica>,
    pub(crate) partitions: Arena<PartitionId, Partition>,
    dataset_names: HashMap<String, DatasetId>,
    site_names: HashMap<String, SiteId>,
    group_names: HashMap<String, GroupId>,
    partition_names: HashMap<String, PartitionId>,
    block_names: HashMap<(DatasetId, BlockName), BlockId>,
    demand_epoch: u64,
    clock: Option<i64>,
}

impl Inventory {
    /// Empty inventory holding only the null group.
    #[must_use]
    pub fn new() -> Self {
        let mut groups = Arena::new();
        let null = groups.insert(Group::null());
        debug_assert_eq!(null, GroupId::NULL);
        Self {
            datasets: Arena::new(),
            blocks: Arena::new(),
            sites: Arena::new(),
            groups,
            dataset_replicas: Arena::new(),
            block_replicas: Arena::new(),
            partitions: Arena::new(),
            dataset_names: HashMap::new(),
            site_names: HashMap::new(),
            group_names: HashMap::new(),
            partition_names: HashMap::new(),
            block_names: HashMap::new(),
            demand_epoch: 0,
            clock: None,
        }
    }

    /// Snapshot time in unix seconds, set by whoever last refreshed the
    /// inventory. Time-dependent partition predicates evaluate against it.
    #[must_use]
    pub const fn clock(&self) -> Option<i64> {
        self.clock
    }

    pub fn set_clock(&mut self, now: i64) {
        self.clock = Some(now);
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn dataset(&self, id: DatasetId) -> Option<&Dataset> {
        self.datasets.get(id)
    }

    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    #[must_use]
    pub fn site(&self, id: SiteId) -> Option<&Site> {
        self.sites.get(id)
    }

    #[must_use]
    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(id)
    }

    #[must_use]
    pub fn dataset_replica(&self, id: DatasetReplicaId) -> Option<&DatasetReplica> {
        self.dataset_replicas.get(id)
    }

    #[must_use]
    pub fn block_replica(&self, id: BlockReplicaId) -> Option<&BlockReplica> {
        self.block_replicas.get(id)
    }

    #[must_use]
    pub fn partition(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.get(id)
    }

    pub fn require_dataset(&self, id: DatasetId) -> Result<&Dataset> {
        self.datasets
            .get(id)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Dataset, id.to_string()))
    }

    pub fn require_block(&self, id: BlockId) -> Result<&Block> {
        self.blocks
            .get(id)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Block, id.to_string()))
    }

    pub fn require_site(&self, id: SiteId) -> Result<&Site> {
        self.sites
            .get(id)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Site, id.to_string()))
    }

    pub fn require_group(&self, id: GroupId) -> Result<&Group> {
        self.groups
            .get(id)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Group, id.to_string()))
    }

    pub fn require_dataset_replica(&self, id: DatasetReplicaId) -> Result<&DatasetReplica> {
        self.dataset_replicas
            .get(id)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::DatasetReplica, id.to_string()))
    }

    pub fn require_block_replica(&self, id: BlockReplicaId) -> Result<&BlockReplica> {
        self.block_replicas
            .get(id)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::BlockReplica, id.to_string()))
    }

    pub fn require_partition(&self, id: PartitionId) -> Result<&Partition> {
        self.partitions
            .get(id)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Partition, id.to_string()))
    }

    #[must_use]
    pub fn find_dataset(&self, name: &str) -> Option<DatasetId> {
        self.dataset_names.get(name).copied()
    }

    #[must_use]
    pub fn find_site(&self, name: &str) -> Option<SiteId> {
        self.site_names.get(name).copied()
    }

    #[must_use]
    pub fn find_group(&self, name: &str) -> Option<GroupId> {
        self.group_names.get(name).copied()
    }

    #[must_use]
    pub fn find_partition(&self, name: &str) -> Option<PartitionId> {
        self.partition_names.get(name).copied()
    }

    #[must_use]
    pub fn find_block(&self, dataset: DatasetId, name: BlockName) -> Option<BlockId> {
        self.block_names.get(&(dataset, name)).copied()
    }

    /// The replica of `dataset` held at `site`, if linked.
    #[must_use]
    pub fn find_dataset_replica(&self, dataset: DatasetId, site: SiteId) -> Option<DatasetReplicaId> {
        self.sites.get(site)?.find_dataset_replica(dataset)
    }

    /// The dataset replica that owns a block replica value.
    #[must_use]
    pub fn owning_dataset_replica(&self, replica: &BlockReplica) -> Option<DatasetReplicaId> {
        let dataset = self.blocks.get(replica.block())?.dataset();
        self.find_dataset_replica(dataset, replica.site())
    }

    pub fn datasets(&self) -> impl Iterator<Item = (DatasetId, &Dataset)> + '_ {
        self.datasets.iter()
    }

    pub fn sites(&self) -> impl Iterator<Item = (SiteId, &Site)> + '_ {
        self.sites.iter()
    }

    pub fn groups(&self) -> impl Iterator<Item = (GroupId, &Group)> + '_ {
        self.groups.iter()
    }

    pub fn partitions(&self) -> impl Iterator<Item = (PartitionId, &Partition)> + '_ {
        self.partitions.iter()
    }

    pub fn dataset_replicas(&self) -> impl Iterator<Item = (DatasetReplicaId, &DatasetReplica)> + '_ {
        self.dataset_replicas.iter()
    }

    pub fn block_replicas(&self) -> impl Iterator<Item = (BlockReplicaId, &BlockReplica)> + '_ {
        self.block_replicas.iter()
    }

    /// `(datasets, blocks, sites, dataset replicas, block replicas)` counts.
    #[must_use]
    pub fn counts(&self) -> (usize, usize, usize, usize, usize) {
        (
            self.datasets.len(),
            self.blocks.len(),
            self.sites.len(),
            self.dataset_replicas.len(),
            self.block_replicas.len(),
        )
    }

    /// Human-readable `<dataset>@<site>` label.
    #[must_use]
    pub fn replica_label(&self, id: DatasetReplicaId) -> String {
        self.dataset_replicas.get(id).map_or_else(
            || id.to_string(),
            |replica| {
                let dataset = self
                    .datasets
                    .get(replica.dataset())
                    .map_or("?", Dataset::name);
                let site = self.sites.get(replica.site()).map_or("?", Site::name);
                format!("{dataset}@{site}")
            },
        )
    }

    // -----------------------------------------------------------------------
    // Entity creation
    // -----------------------------------------------------------------------

    /// Register a site. Its reverse indices start empty and it receives one
    /// site partition per known partition.
    pub fn add_site(&mut self, mut site: Site) -> Result<SiteId> {
        if self.site_names.contains_key(site.name()) {
            return Err(ReplicoreError::integrity(format!(
                "site {} already exists",
                site.name()
            )));
        }
        site.dataset_replicas.clear();
        site.block_replicas.clear();
        site.partitions = self
            .partitions
            .iter()
            .map(|(pid, partition)| (pid, SitePartition::new(pid, partition.is_super())))
            .collect();
        let name = site.name().to_owned();
        let id = self.sites.insert(site);
        self.site_names.insert(name.clone(), id);
        info!(site = %name, "site added");
        Ok(id)
    }

    pub fn add_group(&mut self, group: Group) -> Result<GroupId> {
        let Some(name) = group.name().map(str::to_owned) else {
            return Err(ReplicoreError::integrity(
                "the null group exists exactly once",
            ));
        };
        if self.group_names.contains_key(&name) {
            return Err(ReplicoreError::integrity(format!(
                "group {name} already exists"
            )));
        }
        let id = self.groups.insert(group);
        self.group_names.insert(name.clone(), id);
        debug!(group = %name, "group added");
        Ok(id)
    }

    pub fn add_dataset(&mut self, mut dataset: Dataset) -> Result<DatasetId> {
        if self.dataset_names.contains_key(dataset.name()) {
            return Err(ReplicoreError::integrity(format!(
                "dataset {} already exists",
                dataset.name()
            )));
        }
        dataset.blocks = BlockList::Unloaded;
        dataset.replicas.clear();
        let name = dataset.name().to_owned();
        let id = self.datasets.insert(dataset);
        self.dataset_names.insert(name.clone(), id);
        debug!(dataset = %name, "dataset added");
        Ok(id)
    }

    /// Register a block under its dataset. The dataset's block list becomes
    /// at least partially loaded.
    pub fn add_block(&mut self, mut block: Block) -> Result<BlockId> {
        let dataset_id = block.dataset();
        let dataset = self.require_dataset(dataset_id)?;
        let key = (dataset_id, block.name());
        if self.block_names.contains_key(&key) {
            return Err(ReplicoreError::integrity(format!(
                "block {} already exists",
                block.name().full_name(dataset.name())
            )));
        }
        block.replicas.clear();
        let id = self.blocks.insert(block);
        self.block_names.insert(key, id);
        if let Some(dataset) = self.datasets.get_mut(dataset_id) {
            dataset.blocks.push(id);
        }
        Ok(id)
    }

    /// Declare the dataset's block list complete.
    pub fn mark_blocks_loaded(&mut self, dataset: DatasetId) -> Result<()> {
        let entry = self
            .datasets
            .get_mut(dataset)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Dataset, dataset.to_string()))?;
        entry.blocks.mark_loaded();
        Ok(())
    }

    pub fn dataset_mut(&mut self, id: DatasetId) -> Result<&mut Dataset> {
        self.datasets
            .get_mut(id)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Dataset, id.to_string()))
    }

    pub fn block_mut(&mut self, id: BlockId) -> Result<&mut Block> {
        self.blocks
            .get_mut(id)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Block, id.to_string()))
    }

    pub fn site_mut(&mut self, id: SiteId) -> Result<&mut Site> {
        self.sites
            .get_mut(id)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Site, id.to_string()))
    }

    pub fn dataset_replica_mut(&mut self, id: DatasetReplicaId) -> Result<&mut DatasetReplica> {
        self.dataset_replicas
            .get_mut(id)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::DatasetReplica, id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Demand attributes
    // -----------------------------------------------------------------------

    /// Incremented on every demand attribute write.
    #[must_use]
    pub const fn demand_epoch(&self) -> u64 {
        self.demand_epoch
    }

    pub fn set_dataset_attr(
        &mut self,
        dataset: DatasetId,
        key: impl Into<String>,
        value: AttrValue,
    ) -> Result<()> {
        self.dataset_mut(dataset)?.attrs.insert(key.into(), value);
        self.demand_epoch += 1;
        self.reindex_dataset(dataset)
    }

    pub fn remove_dataset_attr(&mut self, dataset: DatasetId, key: &str) -> Result<Option<AttrValue>> {
        let removed = self.dataset_mut(dataset)?.attrs.remove(key);
        if removed.is_some() {
            self.demand_epoch += 1;
            self.reindex_dataset(dataset)?;
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Dataset replica link / unlink / clone
    // -----------------------------------------------------------------------

    /// Attach a detached dataset replica to its dataset and site, linking
    /// every contained block replica into the site index and the partitions.
    ///
    /// Validation happens before any mutation, so a failed link leaves the
    /// inventory untouched.
    pub fn link_dataset_replica(&mut self, detached: DetachedDatasetReplica) -> Result<DatasetReplicaId> {
        let dataset = self.require_dataset(detached.dataset)?;
        let site = self.require_site(detached.site)?;
        if site.find_dataset_replica(detached.dataset).is_some() {
            return Err(ReplicoreError::integrity(format!(
                "{}@{} is already linked",
                dataset.name(),
                site.name()
            )));
        }
        let mut seen = HashSet::new();
        for replica in &detached.block_replicas {
            self.validate_block_replica(replica, detached.dataset, detached.site)?;
            if !seen.insert(replica.block()) {
                return Err(ReplicoreError::integrity(format!(
                    "block {} listed twice in {}@{}",
                    replica.block(),
                    dataset.name(),
                    site.name()
                )));
            }
        }

        let replica_id = self
            .dataset_replicas
            .insert(DatasetReplica::from_detached(&detached));
        if let Some(dataset) = self.datasets.get_mut(detached.dataset) {
            dataset.replicas.push(replica_id);
        }
        if let Some(site) = self.sites.get_mut(detached.site) {
            site.dataset_replicas.insert(detached.dataset, replica_id);
        }
        for block_replica in detached.block_replicas {
            let matched = self.matching_partitions(&block_replica);
            let id = self.block_replicas.insert(block_replica);
            self.attach_block_replica(replica_id, id, &matched);
        }
        info!(replica = %self.replica_label(replica_id), "dataset replica linked");
        Ok(replica_id)
    }

    /// Detach a dataset replica from every index and return a deep copy.
    pub fn unlink_dataset_replica(&mut self, id: DatasetReplicaId) -> Result<DetachedDatasetReplica> {
        let label = self.replica_label(id);
        let replica = self.require_dataset_replica(id)?;
        let (dataset_id, site_id) = (replica.dataset(), replica.site());
        let members = replica.block_replicas.clone();

        let mut block_replicas = Vec::with_capacity(members.len());
        for member in members {
            block_replicas.push(self.remove_block_replica(member)?);
        }

        if let Some(site) = self.sites.get_mut(site_id) {
            site.dataset_replicas.remove(&dataset_id);
            for site_partition in site.partitions.values_mut() {
                site_partition.drop_replica(id);
            }
        }
        if let Some(dataset) = self.datasets.get_mut(dataset_id) {
            dataset.replicas.retain(|candidate| *candidate != id);
        }
        let replica = self
            .dataset_replicas
            .remove(id)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::DatasetReplica, label.clone()))?;
        info!(replica = %label, "dataset replica unlinked");

        Ok(DetachedDatasetReplica {
            dataset: dataset_id,
            site: site_id,
            is_complete: replica.is_complete,
            is_custodial: replica.is_custodial,
            last_block_created: replica.last_block_created,
            attrs: replica.attrs,
            block_replicas,
        })
    }

    /// Detached copy of a linked replica, optionally with its block replicas.
    pub fn clone_dataset_replica(&self, id: DatasetReplicaId, deep: bool) -> Result<DetachedDatasetReplica> {
        let replica = self.require_dataset_replica(id)?;
        let block_replicas = if deep {
            replica
                .block_replicas
                .iter()
                .map(|member| self.require_block_replica(*member).cloned())
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        Ok(DetachedDatasetReplica {
            dataset: replica.dataset(),
            site: replica.site(),
            is_complete: replica.is_complete,
            is_custodial: replica.is_custodial,
            last_block_created: replica.last_block_created,
            attrs: replica.attrs.clone(),
            block_replicas,
        })
    }

    // -----------------------------------------------------------------------
    // Block replicas
    // -----------------------------------------------------------------------

    /// Add a block replica to the dataset replica already linked at its site.
    pub fn add_block_replica(&mut self, replica: BlockReplica) -> Result<BlockReplicaId> {
        let dataset = self.require_block(replica.block())?.dataset();
        self.validate_block_replica(&replica, dataset, replica.site())?;
        let owner = self.find_dataset_replica(dataset, replica.site()).ok_or_else(|| {
            ReplicoreError::not_found(
                ObjectKind::DatasetReplica,
                format!(
                    "{}@{}",
                    self.datasets.get(dataset).map_or("?", Dataset::name),
                    self.sites.get(replica.site()).map_or("?", Site::name)
                ),
            )
        })?;
        let matched = self.matching_partitions(&replica);
        let id = self.block_replicas.insert(replica);
        self.attach_block_replica(owner, id, &matched);
        Ok(id)
    }

    /// Remove one block replica from every index and return its value.
    pub fn remove_block_replica(&mut self, id: BlockReplicaId) -> Result<BlockReplica> {
        let replica = self.require_block_replica(id)?;
        let (block_id, site_id) = (replica.block(), replica.site());
        let owner = self.owning_dataset_replica(replica).ok_or_else(|| {
            ReplicoreError::integrity(format!("block replica {id} has no owning dataset replica"))
        })?;

        if let (Some(site), Some(dataset_replica)) = (
            self.sites.get_mut(site_id),
            self.dataset_replicas.get_mut(owner),
        ) {
            for site_partition in site.partitions.values_mut() {
                site_partition.unindex_block_replica(owner, id, &dataset_replica.block_replicas, true);
            }
            site.block_replicas.remove(&id);
            dataset_replica.block_replicas.retain(|member| *member != id);
        }
        if let Some(block) = self.blocks.get_mut(block_id) {
            block.replicas.retain(|member| *member != id);
        }
        self.block_replicas
            .remove(id)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::BlockReplica, id.to_string()))
    }

    /// Replace the value of a linked block replica.
    ///
    /// The arena slot is swapped in one step; partition membership is
    /// withdrawn for the old value before the swap and recomputed for the new
    /// value after it. Block and site may not change.
    pub fn update_block_replica(&mut self, id: BlockReplicaId, replacement: BlockReplica) -> Result<BlockReplica> {
        let current = self.require_block_replica(id)?;
        if !current.same_identity(&replacement) {
            return Err(ReplicoreError::integrity(format!(
                "block replica {id} cannot change block or site"
            )));
        }
        if current == &replacement {
            return Ok(replacement);
        }
        self.require_group(replacement.group())?;
        let owner = self.owning_dataset_replica(current).ok_or_else(|| {
            ReplicoreError::integrity(format!("block replica {id} has no owning dataset replica"))
        })?;
        let site_id = replacement.site();
        let matched = self.matching_partitions(&replacement);

        let members = self
            .dataset_replicas
            .get(owner)
            .map(|replica| replica.block_replicas.clone())
            .unwrap_or_default();
        if let Some(site) = self.sites.get_mut(site_id) {
            for site_partition in site.partitions.values_mut() {
                site_partition.unindex_block_replica(owner, id, &members, false);
            }
        }
        let previous = self
            .block_replicas
            .replace(id, replacement)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::BlockReplica, id.to_string()))?;
        if let Some(site) = self.sites.get_mut(site_id) {
            for (partition, is_member) in &matched {
                if let Some(site_partition) = site.partitions.get_mut(partition) {
                    site_partition.index_block_replica(owner, id, &members, *is_member);
                }
            }
        }
        debug!(block_replica = %id, "block replica updated");
        Ok(previous)
    }

    fn validate_block_replica(&self, replica: &BlockReplica, dataset: DatasetId, site: SiteId) -> Result<()> {
        let block = self.require_block(replica.block())?;
        if block.dataset() != dataset {
            return Err(ReplicoreError::integrity(format!(
                "block {} does not belong to dataset {dataset}",
                replica.block()
            )));
        }
        if replica.site() != site {
            return Err(ReplicoreError::integrity(format!(
                "block replica site {} differs from dataset replica site {site}",
                replica.site()
            )));
        }
        self.require_group(replica.group())?;
        let duplicate = block.replicas.iter().any(|existing| {
            self.block_replicas
                .get(*existing)
                .is_some_and(|other| other.site() == site)
        });
        if duplicate {
            return Err(ReplicoreError::integrity(format!(
                "block {} already has a replica at site {site}",
                replica.block()
            )));
        }
        Ok(())
    }

    /// Wire a freshly inserted block replica into every reverse index.
    fn attach_block_replica(&mut self, owner: DatasetReplicaId, id: BlockReplicaId, matched: &[(PartitionId, bool)]) {
        let Some(replica) = self.block_replicas.get(id) else {
            return;
        };
        let (block_id, site_id) = (replica.block(), replica.site());
        if let Some(block) = self.blocks.get_mut(block_id) {
            block.replicas.push(id);
        }
        let Some(dataset_replica) = self.dataset_replicas.get_mut(owner) else {
            return;
        };
        dataset_replica.block_replicas.push(id);
        if let Some(site) = self.sites.get_mut(site_id) {
            site.block_replicas.insert(id);
            for (partition, is_member) in matched {
                if let Some(site_partition) = site.partitions.get_mut(partition) {
                    site_partition.index_block_replica(
                        owner,
                        id,
                        &dataset_replica.block_replicas,
                        *is_member,
                    );
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Replica completeness and size
    // -----------------------------------------------------------------------

    fn loaded_blocks(&self, dataset: DatasetId) -> Result<&[BlockId]> {
        let dataset = self.require_dataset(dataset)?;
        dataset
            .blocks()
            .loaded()
            .ok_or_else(|| ReplicoreError::BlocksNotLoaded {
                dataset: dataset.name().to_owned(),
            })
    }

    fn replica_blocks(&self, replica: &DatasetReplica) -> HashSet<BlockId> {
        replica
            .block_replicas
            .iter()
            .filter_map(|member| self.block_replicas.get(*member))
            .map(BlockReplica::block)
            .collect()
    }

    /// Every block of the dataset has a complete replica here.
    ///
    /// Fails with [`ReplicoreError::BlocksNotLoaded`] unless the dataset's
    /// block list is fully loaded.
    pub fn is_full(&self, id: DatasetReplicaId) -> Result<bool> {
        let replica = self.require_dataset_replica(id)?;
        let blocks = self.loaded_blocks(replica.dataset())?;
        if blocks.is_empty() || replica.block_replicas.len() != blocks.len() {
            return Ok(false);
        }
        let present = self.replica_blocks(replica);
        let all_complete = replica
            .block_replicas
            .iter()
            .filter_map(|member| self.block_replicas.get(*member))
            .all(BlockReplica::is_complete);
        Ok(all_complete && blocks.iter().all(|block| present.contains(block)))
    }

    /// Some, but not all, blocks of the dataset are present here.
    pub fn is_partial(&self, id: DatasetReplicaId) -> Result<bool> {
        let replica = self.require_dataset_replica(id)?;
        let blocks = self.loaded_blocks(replica.dataset())?;
        let present = self.replica_blocks(replica);
        Ok(!present.is_empty() && blocks.iter().any(|block| !present.contains(block)))
    }

    /// Bytes of a dataset replica.
    ///
    /// Physical counts what is on disk; logical counts full block sizes, i.e.
    /// the size once every present block replica completes.
    pub fn dataset_replica_size(&self, id: DatasetReplicaId, physical: bool) -> Result<u64> {
        let replica = self.require_dataset_replica(id)?;
        if !physical && self.is_full(id).unwrap_or(false) {
            return Ok(self.require_dataset(replica.dataset())?.size);
        }
        Ok(self.block_replica_set_size(replica.block_replicas.iter().copied(), physical))
    }

    pub(crate) fn block_replica_set_size(&self, members: impl Iterator<Item = BlockReplicaId>, physical: bool) -> u64 {
        members
            .filter_map(|member| self.block_replicas.get(member))
            .map(|replica| {
                if physical {
                    replica.size()
                } else {
                    self.blocks.get(replica.block()).map_or(0, |block| block.size)
                }
            })
            .sum()
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    /// Delete a block and every replica of it.
    pub fn delete_block(&mut self, id: BlockId) -> Result<Block> {
        let replicas = self.require_block(id)?.replicas.to_vec();
        for replica in replicas {
            self.remove_block_replica(replica)?;
        }
        let block = self
            .blocks
            .remove(id)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Block, id.to_string()))?;
        self.block_names.remove(&(block.dataset(), block.name()));
        if let Some(dataset) = self.datasets.get_mut(block.dataset()) {
            dataset.blocks.remove(id);
        }
        Ok(block)
    }

    /// Delete a dataset with all its replicas and blocks.
    pub fn delete_dataset(&mut self, id: DatasetId) -> Result<Dataset> {
        let dataset = self.require_dataset(id)?;
        let replicas = dataset.replicas.clone();
        let blocks = dataset.blocks.known().to_vec();
        for replica in replicas {
            self.unlink_dataset_replica(replica)?;
        }
        for block in blocks {
            self.delete_block(block)?;
        }
        let dataset = self
            .datasets
            .remove(id)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Dataset, id.to_string()))?;
        self.dataset_names.remove(dataset.name());
        info!(dataset = %dataset.name(), "dataset deleted");
        Ok(dataset)
    }

    /// Delete a site with every replica it holds.
    pub fn delete_site(&mut self, id: SiteId) -> Result<Site> {
        let replicas: Vec<DatasetReplicaId> = self.require_site(id)?.dataset_replicas().collect();
        for replica in replicas {
            self.unlink_dataset_replica(replica)?;
        }
        let site = self
            .sites
            .remove(id)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Site, id.to_string()))?;
        self.site_names.remove(site.name());
        info!(site = %site.name(), "site deleted");
        Ok(site)
    }

    /// Delete a group, handing every block replica it owned to the null group.
    ///
    /// Visits every block replica of every dataset replica of every dataset.
    pub fn delete_group(&mut self, id: GroupId) -> Result<Group> {
        if id.is_null() {
            return Err(ReplicoreError::integrity("the null group cannot be deleted"));
        }
        let name = self.require_group(id)?.to_string();

        let mut owned = Vec::new();
        for (_, dataset) in self.datasets.iter() {
            for replica in &dataset.replicas {
                let Some(replica) = self.dataset_replicas.get(*replica) else {
                    continue;
                };
                owned.extend(replica.block_replicas.iter().copied().filter(|member| {
                    self.block_replicas
                        .get(*member)
                        .is_some_and(|value| value.group() == id)
                }));
            }
        }
        let reassigned = owned.len();
        for member in owned {
            let orphaned = self.require_block_replica(member)?.with_group(GroupId::NULL);
            self.update_block_replica(member, orphaned)?;
        }

        let group = self
            .groups
            .remove(id)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Group, name.clone()))?;
        self.group_names.remove(&name);
        info!(group = %name, reassigned, "group deleted");
        Ok(group)
    }

    // -----------------------------------------------------------------------
    // Partitions
    // -----------------------------------------------------------------------

    /// Register a partition and compute its membership at every site.
    ///
    /// A superpartition adopts its children, which must exist and must not
    /// already have a parent or hold an unlimited quota anywhere.
    pub fn add_partition(&mut self, name: impl Into<String>, kind: PartitionKind) -> Result<PartitionId> {
        let name = name.into();
        if self.partition_names.contains_key(&name) {
            return Err(ReplicoreError::integrity(format!(
                "partition {name} already exists"
            )));
        }
        if let PartitionKind::Super(children) = &kind {
            let mut seen = HashSet::new();
            for child in children {
                let partition = self.require_partition(*child)?;
                if !seen.insert(*child) {
                    return Err(ReplicoreError::integrity(format!(
                        "partition {} listed twice under {name}",
                        partition.name()
                    )));
                }
                if let Some(parent) = partition.parent() {
                    return Err(ReplicoreError::integrity(format!(
                        "partition {} already belongs to {parent}",
                        partition.name()
                    )));
                }
                let unlimited = self.sites.iter().any(|(_, site)| {
                    site.partitions.get(child).is_some_and(|sp| {
                        matches!(sp.quota_slot(), QuotaSlot::Leaf(q) if q < 0)
                    })
                });
                if unlimited {
                    return Err(ReplicoreError::integrity(format!(
                        "partition {} has an unlimited quota and cannot become a subpartition",
                        partition.name()
                    )));
                }
            }
        }

        let is_super = matches!(kind, PartitionKind::Super(_));
        let children = match &kind {
            PartitionKind::Super(children) => children.clone(),
            PartitionKind::Leaf(_) => Vec::new(),
        };
        let id = self.partitions.insert(Partition::new(name.clone(), kind));
        self.partition_names.insert(name.clone(), id);
        for child in children {
            if let Some(partition) = self.partitions.get_mut(child) {
                partition.parent = Some(id);
            }
        }
        let site_ids: Vec<SiteId> = self.sites.ids().collect();
        for site_id in site_ids {
            let site_partition = self.build_site_partition(site_id, id, is_super);
            if let Some(site) = self.sites.get_mut(site_id) {
                site.partitions.insert(id, site_partition);
            }
        }
        info!(partition = %name, is_super, "partition added");
        Ok(id)
    }

    /// Remove a partition and its site partition at every site.
    ///
    /// Children of a removed superpartition become top-level partitions.
    pub fn delete_partition(&mut self, id: PartitionId) -> Result<Partition> {
        let partition = self.require_partition(id)?.clone();
        if let Some(parent) = partition.parent() {
            if let Some(PartitionKind::Super(children)) =
                self.partitions.get_mut(parent).map(|parent| &mut parent.kind)
            {
                children.retain(|child| *child != id);
            }
        }
        if let Some(children) = partition.subpartitions() {
            for child in children {
                if let Some(child) = self.partitions.get_mut(*child) {
                    child.parent = None;
                }
            }
        }
        let site_ids: Vec<SiteId> = self.sites.ids().collect();
        for site_id in site_ids {
            if let Some(site) = self.sites.get_mut(site_id) {
                site.partitions.remove(&id);
            }
        }
        self.partitions.remove(id);
        self.partition_names.remove(partition.name());
        if let Some(parent) = partition.parent() {
            let site_ids: Vec<SiteId> = self.sites.ids().collect();
            for site_id in site_ids {
                let rebuilt = self.build_site_partition(site_id, parent, true);
                if let Some(site) = self.sites.get_mut(site_id) {
                    site.partitions.insert(parent, rebuilt);
                }
            }
        }
        info!(partition = %partition.name(), "partition deleted");
        Ok(partition)
    }

    /// Whether a block replica value belongs to a partition.
    ///
    /// Superpartitions recurse into their children.
    #[must_use]
    pub fn partition_contains(&self, partition: PartitionId, replica: &BlockReplica) -> bool {
        match self.partitions.get(partition).map(Partition::kind) {
            Some(PartitionKind::Leaf(Some(predicate))) => predicate.contains(self, replica),
            Some(PartitionKind::Super(children)) => children
                .iter()
                .any(|child| self.partition_contains(*child, replica)),
            Some(PartitionKind::Leaf(None)) | None => false,
        }
    }

    fn matching_partitions(&self, replica: &BlockReplica) -> Vec<(PartitionId, bool)> {
        self.partitions
            .ids()
            .map(|partition| (partition, self.partition_contains(partition, replica)))
            .collect()
    }

    fn build_site_partition(&self, site: SiteId, partition: PartitionId, is_super: bool) -> SitePartition {
        let mut site_partition = SitePartition::new(partition, is_super);
        let Some(site) = self.sites.get(site) else {
            return site_partition;
        };
        for replica_id in site.dataset_replicas() {
            if let Some(share) = self.replica_share(partition, replica_id) {
                site_partition.replicas.insert(replica_id, share);
            }
        }
        site_partition
    }

    fn replica_share(&self, partition: PartitionId, replica_id: DatasetReplicaId) -> Option<ReplicaShare> {
        let replica = self.dataset_replicas.get(replica_id)?;
        let members: HashSet<BlockReplicaId> = replica
            .block_replicas
            .iter()
            .copied()
            .filter(|member| {
                self.block_replicas
                    .get(*member)
                    .is_some_and(|value| self.partition_contains(partition, value))
            })
            .collect();
        if members.is_empty() {
            None
        } else if members.len() == replica.block_replicas.len() {
            Some(ReplicaShare::Entire)
        } else {
            Some(ReplicaShare::Blocks(members))
        }
    }

    /// Recompute partition membership of every replica of one dataset.
    ///
    /// Predicates may read dataset fields and attributes, so any change to
    /// those has to pass through here before occupancy is trusted again.
    pub fn reindex_dataset(&mut self, dataset: DatasetId) -> Result<()> {
        let replicas: Vec<(DatasetReplicaId, SiteId)> = self
            .require_dataset(dataset)?
            .replicas()
            .iter()
            .filter_map(|id| self.dataset_replicas.get(*id).map(|replica| (*id, replica.site())))
            .collect();
        let partitions: Vec<PartitionId> = self.partitions.ids().collect();
        for (replica_id, site_id) in replicas {
            let shares: Vec<(PartitionId, Option<ReplicaShare>)> = partitions
                .iter()
                .map(|partition| (*partition, self.replica_share(*partition, replica_id)))
                .collect();
            let Some(site) = self.sites.get_mut(site_id) else {
                continue;
            };
            for (partition, share) in shares {
                let Some(site_partition) = site.partitions.get_mut(&partition) else {
                    continue;
                };
                match share {
                    Some(share) => {
                        site_partition.replicas.insert(replica_id, share);
                    }
                    None => {
                        site_partition.replicas.remove(&replica_id);
                    }
                }
            }
        }
        Ok(())
    }

    /// Recompute membership of every site partition from scratch.
    ///
    /// Needed after predicates start depending on state that changed outside
    /// the inventory's knowledge, such as the snapshot clock moving past a
    /// time-gated condition.
    pub fn rebuild_partition_membership(&mut self) {
        let partitions: Vec<(PartitionId, bool)> = self
            .partitions
            .iter()
            .map(|(id, partition)| (id, partition.is_super()))
            .collect();
        let site_ids: Vec<SiteId> = self.sites.ids().collect();
        for site_id in site_ids {
            for (partition, is_super) in &partitions {
                let mut rebuilt = self.build_site_partition(site_id, *partition, *is_super);
                if let Some(site) = self.sites.get_mut(site_id) {
                    if let Some(existing) = site.partitions.get(partition) {
                        rebuilt.quota = existing.quota;
                    }
                    site.partitions.insert(*partition, rebuilt);
                }
            }
        }
        debug!(partitions = partitions.len(), "partition membership rebuilt");
    }
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

//! Name-addressed catalog records and the upserts that merge them into an
//! [`Inventory`].
//!
//! Records carry names rather than arena ids, so they can be produced by a
//! catalog feed without access to the inventory. Embedding a record either
//! creates the entity or updates the existing one in place; identity fields
//! (names, owning dataset, site) must agree with what is already stored.

use std::collections::HashSet;

use replicore_error::{ObjectKind, ReplicoreError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::block_name::BlockName;
use crate::entity::{Block, DataType, Dataset, DatasetStatus, Group, OwnershipLevel, Site, SiteStatus, StorageType};
use crate::ids::{BlockId, BlockReplicaId, DatasetId, DatasetReplicaId, GroupId, SiteId};
use crate::inventory::Inventory;
use crate::replica::{BlockReplica, BlockReplicaOverrides, DetachedDatasetReplica};

/// What an embed call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedOutcome {
    Created,
    Updated,
    Unchanged,
}

impl EmbedOutcome {
    const fn from_change(changed: bool) -> Self {
        if changed { Self::Updated } else { Self::Unchanged }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRecord {
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub storage_type: StorageType,
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub status: SiteStatus,
    #[serde(default)]
    pub cpu: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    #[serde(default)]
    pub olevel: OwnershipLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub name: BlockName,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub num_files: u64,
    #[serde(default)]
    pub is_open: bool,
    #[serde(default)]
    pub last_update: i64,
}

/// A dataset and, when `blocks` is present, its authoritative block list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub num_files: u64,
    #[serde(default)]
    pub is_open: bool,
    #[serde(default)]
    pub status: DatasetStatus,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub software_version: Option<String>,
    #[serde(default)]
    pub last_update: i64,
    #[serde(default)]
    pub blocks: Option<Vec<BlockRecord>>,
}

/// One block replica inside a [`DatasetReplicaRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReplicaRecord {
    pub block: BlockName,
    /// Owning group; `None` is the null group.
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_true")]
    pub is_complete: bool,
    #[serde(default)]
    pub is_custodial: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub last_update: i64,
}

/// Full state of one dataset replica. Block replicas not listed are removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetReplicaRecord {
    pub dataset: String,
    pub site: String,
    #[serde(default = "default_true")]
    pub is_complete: bool,
    #[serde(default)]
    pub is_custodial: bool,
    #[serde(default)]
    pub last_block_created: i64,
    #[serde(default)]
    pub block_replicas: Vec<BlockReplicaRecord>,
}

const fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Upserts
// ---------------------------------------------------------------------------

impl Inventory {
    pub fn embed_site(&mut self, record: &SiteRecord) -> Result<(SiteId, EmbedOutcome)> {
        if let Some(id) = self.find_site(&record.name) {
            let site = self.site_mut(id)?;
            let changed = site.host != record.host
                || site.storage_type != record.storage_type
                || site.backend != record.backend
                || site.status != record.status
                || site.cpu.to_bits() != record.cpu.to_bits();
            site.host.clone_from(&record.host);
            site.storage_type = record.storage_type;
            site.backend.clone_from(&record.backend);
            site.status = record.status;
            site.cpu = record.cpu;
            return Ok((id, EmbedOutcome::from_change(changed)));
        }
        let mut site = Site::new(record.name.clone());
        site.host.clone_from(&record.host);
        site.storage_type = record.storage_type;
        site.backend.clone_from(&record.backend);
        site.status = record.status;
        site.cpu = record.cpu;
        Ok((self.add_site(site)?, EmbedOutcome::Created))
    }

    pub fn embed_group(&mut self, record: &GroupRecord) -> Result<(GroupId, EmbedOutcome)> {
        if let Some(id) = self.find_group(&record.name) {
            let group = self
                .groups
                .get_mut(id)
                .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Group, record.name.clone()))?;
            let changed = group.olevel != record.olevel;
            group.olevel = record.olevel;
            return Ok((id, EmbedOutcome::from_change(changed)));
        }
        let id = self.add_group(Group::new(record.name.clone(), record.olevel))?;
        Ok((id, EmbedOutcome::Created))
    }

    /// Upsert a dataset. When the record carries a block list, blocks missing
    /// from it are deleted along with their replicas and the list is marked
    /// loaded. An updated dataset has its replicas' partition membership
    /// recomputed.
    pub fn embed_dataset(&mut self, record: &DatasetRecord) -> Result<(DatasetId, EmbedOutcome)> {
        let (id, mut outcome) = if let Some(id) = self.find_dataset(&record.name) {
            let dataset = self.dataset_mut(id)?;
            let changed = dataset.size != record.size
                || dataset.num_files != record.num_files
                || dataset.is_open != record.is_open
                || dataset.status != record.status
                || dataset.data_type != record.data_type
                || dataset.software_version != record.software_version
                || dataset.last_update != record.last_update;
            apply_dataset_record(dataset, record);
            (id, EmbedOutcome::from_change(changed))
        } else {
            let mut dataset = Dataset::new(record.name.clone());
            apply_dataset_record(&mut dataset, record);
            (self.add_dataset(dataset)?, EmbedOutcome::Created)
        };

        if let Some(blocks) = &record.blocks {
            let listed: HashSet<BlockName> = blocks.iter().map(|block| block.name).collect();
            let stale: Vec<BlockId> = self
                .require_dataset(id)?
                .blocks()
                .known()
                .iter()
                .copied()
                .filter(|block| {
                    self.block(*block)
                        .is_some_and(|entry| !listed.contains(&entry.name()))
                })
                .collect();
            for block in &stale {
                self.delete_block(*block)?;
            }
            let mut blocks_changed = !stale.is_empty();
            for block in blocks {
                let (_, block_outcome) = self.embed_block(id, block)?;
                blocks_changed |= block_outcome != EmbedOutcome::Unchanged;
            }
            let was_loaded = self.require_dataset(id)?.blocks().is_loaded();
            self.mark_blocks_loaded(id)?;
            if outcome == EmbedOutcome::Unchanged && (blocks_changed || !was_loaded) {
                outcome = EmbedOutcome::Updated;
            }
        }
        if outcome == EmbedOutcome::Updated {
            self.reindex_dataset(id)?;
        }
        Ok((id, outcome))
    }

    /// Upsert one block of an existing dataset.
    pub fn embed_block(&mut self, dataset: DatasetId, record: &BlockRecord) -> Result<(BlockId, EmbedOutcome)> {
        self.require_dataset(dataset)?;
        if let Some(id) = self.find_block(dataset, record.name) {
            let block = self.block_mut(id)?;
            let changed = block.size != record.size
                || block.num_files != record.num_files
                || block.is_open != record.is_open
                || block.last_update != record.last_update;
            block.size = record.size;
            block.num_files = record.num_files;
            block.is_open = record.is_open;
            block.last_update = record.last_update;
            return Ok((id, EmbedOutcome::from_change(changed)));
        }
        let mut block = Block::new(record.name, dataset);
        block.size = record.size;
        block.num_files = record.num_files;
        block.is_open = record.is_open;
        block.last_update = record.last_update;
        Ok((self.add_block(block)?, EmbedOutcome::Created))
    }

    /// Upsert a dataset replica and synchronise its block replicas.
    ///
    /// Dataset, site, groups and blocks must already be known. Existing block
    /// replicas are updated through copy-and-swap so partition membership
    /// follows the new values.
    pub fn embed_dataset_replica(
        &mut self,
        record: &DatasetReplicaRecord,
    ) -> Result<(DatasetReplicaId, EmbedOutcome)> {
        let dataset = self
            .find_dataset(&record.dataset)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Dataset, record.dataset.clone()))?;
        let site = self
            .find_site(&record.site)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Site, record.site.clone()))?;
        let mut resolved = Vec::with_capacity(record.block_replicas.len());
        for entry in &record.block_replicas {
            let block = self.find_block(dataset, entry.block).ok_or_else(|| {
                ReplicoreError::not_found(ObjectKind::Block, entry.block.full_name(&record.dataset))
            })?;
            let group = self.resolve_group(entry.group.as_deref())?;
            resolved.push((block, group, entry));
        }

        let Some(id) = self.find_dataset_replica(dataset, site) else {
            let block_replicas = resolved
                .iter()
                .map(|(block, group, entry)| block_replica_from_record(*block, site, *group, entry))
                .collect();
            let detached = DetachedDatasetReplica {
                is_complete: record.is_complete,
                is_custodial: record.is_custodial,
                last_block_created: record.last_block_created,
                ..DetachedDatasetReplica::new(dataset, site)
            }
            .with_block_replicas(block_replicas);
            return Ok((self.link_dataset_replica(detached)?, EmbedOutcome::Created));
        };

        let replica = self.dataset_replica_mut(id)?;
        let mut changed = replica.is_complete != record.is_complete
            || replica.is_custodial != record.is_custodial
            || replica.last_block_created != record.last_block_created;
        replica.is_complete = record.is_complete;
        replica.is_custodial = record.is_custodial;
        replica.last_block_created = record.last_block_created;

        let listed: HashSet<BlockId> = resolved.iter().map(|(block, _, _)| *block).collect();
        let stale: Vec<BlockReplicaId> = self
            .require_dataset_replica(id)?
            .block_replicas()
            .iter()
            .copied()
            .filter(|member| {
                self.block_replica(*member)
                    .is_some_and(|value| !listed.contains(&value.block()))
            })
            .collect();
        for member in stale {
            self.remove_block_replica(member)?;
            changed = true;
        }

        for (block, group, entry) in resolved {
            let existing = self.require_dataset_replica(id)?.block_replicas().iter().copied().find(|member| {
                self.block_replica(*member)
                    .is_some_and(|value| value.block() == block)
            });
            match existing {
                Some(member) => {
                    let current = self.require_block_replica(member)?;
                    let replacement = current.clone_with(BlockReplicaOverrides {
                        group: Some(group),
                        is_complete: Some(entry.is_complete),
                        is_custodial: Some(entry.is_custodial),
                        size: Some(entry.size),
                        last_update: Some(entry.last_update),
                    });
                    if &replacement != current {
                        self.update_block_replica(member, replacement)?;
                        changed = true;
                    }
                }
                None => {
                    self.add_block_replica(block_replica_from_record(block, site, group, entry))?;
                    changed = true;
                }
            }
        }
        if changed {
            debug!(replica = %self.replica_label(id), "dataset replica updated");
        }
        Ok((id, EmbedOutcome::from_change(changed)))
    }

    /// Upsert a single block replica into the dataset replica at its site,
    /// creating an empty dataset replica first if necessary.
    pub fn embed_block_replica(
        &mut self,
        dataset: &str,
        site: &str,
        record: &BlockReplicaRecord,
    ) -> Result<(BlockReplicaId, EmbedOutcome)> {
        let dataset_id = self
            .find_dataset(dataset)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Dataset, dataset))?;
        let site_id = self
            .find_site(site)
            .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Site, site))?;
        let block = self.find_block(dataset_id, record.block).ok_or_else(|| {
            ReplicoreError::not_found(ObjectKind::Block, record.block.full_name(dataset))
        })?;
        let group = self.resolve_group(record.group.as_deref())?;
        let value = block_replica_from_record(block, site_id, group, record);

        if self.find_dataset_replica(dataset_id, site_id).is_none() {
            self.link_dataset_replica(DetachedDatasetReplica::new(dataset_id, site_id))?;
        }
        let existing = self
            .require_block(block)?
            .replicas()
            .iter()
            .copied()
            .find(|member| {
                self.block_replica(*member)
                    .is_some_and(|current| current.site() == site_id)
            });
        match existing {
            Some(member) => {
                if self.require_block_replica(member)? == &value {
                    return Ok((member, EmbedOutcome::Unchanged));
                }
                self.update_block_replica(member, value)?;
                Ok((member, EmbedOutcome::Updated))
            }
            None => Ok((self.add_block_replica(value)?, EmbedOutcome::Created)),
        }
    }

    /// Remove the named dataset replica if it is linked.
    pub fn delete_dataset_replica(&mut self, dataset: &str, site: &str) -> Result<Option<DetachedDatasetReplica>> {
        let (Some(dataset_id), Some(site_id)) = (self.find_dataset(dataset), self.find_site(site)) else {
            return Ok(None);
        };
        match self.find_dataset_replica(dataset_id, site_id) {
            Some(id) => self.unlink_dataset_replica(id).map(Some),
            None => Ok(None),
        }
    }

    /// Remove the named block replica if it exists. The owning dataset
    /// replica stays linked even when it becomes empty.
    pub fn delete_block_replica(&mut self, dataset: &str, site: &str, block: BlockName) -> Result<Option<BlockReplica>> {
        let (Some(dataset_id), Some(site_id)) = (self.find_dataset(dataset), self.find_site(site)) else {
            return Ok(None);
        };
        let Some(block_id) = self.find_block(dataset_id, block) else {
            return Ok(None);
        };
        let existing = self
            .require_block(block_id)?
            .replicas()
            .iter()
            .copied()
            .find(|member| {
                self.block_replica(*member)
                    .is_some_and(|value| value.site() == site_id)
            });
        match existing {
            Some(member) => self.remove_block_replica(member).map(Some),
            None => Ok(None),
        }
    }

    fn resolve_group(&self, name: Option<&str>) -> Result<GroupId> {
        name.map_or(Ok(GroupId::NULL), |name| {
            self.find_group(name)
                .ok_or_else(|| ReplicoreError::not_found(ObjectKind::Group, name))
        })
    }
}

fn apply_dataset_record(dataset: &mut Dataset, record: &DatasetRecord) {
    dataset.size = record.size;
    dataset.num_files = record.num_files;
    dataset.is_open = record.is_open;
    dataset.status = record.status;
    dataset.data_type = record.data_type;
    dataset.software_version.clone_from(&record.software_version);
    dataset.last_update = record.last_update;
}

fn block_replica_from_record(block: BlockId, site: SiteId, group: GroupId, record: &BlockReplicaRecord) -> BlockReplica {
    BlockReplica::new(block, site, group, record.size).clone_with(BlockReplicaOverrides {
        is_complete: Some(record.is_complete),
        is_custodial: Some(record.is_custodial),
        last_update: Some(record.last_update),
        ..BlockReplicaOverrides::default()
    })
}

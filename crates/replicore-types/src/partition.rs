//! Partitions and per-site partition state.
//!
//! Partitions form a forest. A leaf partition owns a membership predicate and,
//! at every site, a stored quota. A superpartition owns only its list of
//! children; its quota at a site is always the live sum of the children's
//! quotas and is never stored.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::ids::{BlockReplicaId, DatasetReplicaId, PartitionId};
use crate::inventory::Inventory;
use crate::replica::BlockReplica;

/// Membership test for leaf partitions.
///
/// Implemented by compiled rule conditions; evaluated against block replicas.
pub trait ReplicaPredicate: fmt::Debug + Send + Sync {
    fn contains(&self, inventory: &Inventory, replica: &BlockReplica) -> bool;
}

/// Leaf or superpartition.
#[derive(Debug, Clone)]
pub enum PartitionKind {
    /// Membership decided by a predicate. `None` matches nothing.
    Leaf(Option<Arc<dyn ReplicaPredicate>>),
    /// Membership is the union of the children.
    Super(Vec<PartitionId>),
}

/// A named, predicate-defined subset of replica space.
#[derive(Debug, Clone)]
pub struct Partition {
    name: String,
    pub(crate) parent: Option<PartitionId>,
    pub(crate) kind: PartitionKind,
}

impl Partition {
    pub(crate) fn new(name: String, kind: PartitionKind) -> Self {
        Self {
            name,
            parent: None,
            kind,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn parent(&self) -> Option<PartitionId> {
        self.parent
    }

    #[must_use]
    pub const fn kind(&self) -> &PartitionKind {
        &self.kind
    }

    #[must_use]
    pub fn subpartitions(&self) -> Option<&[PartitionId]> {
        match &self.kind {
            PartitionKind::Super(children) => Some(children),
            PartitionKind::Leaf(_) => None,
        }
    }

    #[must_use]
    pub const fn is_super(&self) -> bool {
        matches!(self.kind, PartitionKind::Super(_))
    }
}

// ---------------------------------------------------------------------------
// SitePartition
// ---------------------------------------------------------------------------

/// Where a site partition's quota comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaSlot {
    /// Stored bytes. `0` means not served, negative means unlimited.
    Leaf(i64),
    /// Sum of the children's quotas at the same site.
    Derived,
}

/// How much of a dataset replica lies in a site partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaShare {
    /// Every block replica of the dataset replica.
    Entire,
    /// An explicit, non-empty, proper subset.
    Blocks(HashSet<BlockReplicaId>),
}

/// Quota and membership state of one partition at one site.
#[derive(Debug, Clone)]
pub struct SitePartition {
    partition: PartitionId,
    pub(crate) quota: QuotaSlot,
    pub(crate) replicas: HashMap<DatasetReplicaId, ReplicaShare>,
}

impl SitePartition {
    pub(crate) fn new(partition: PartitionId, is_super: bool) -> Self {
        Self {
            partition,
            quota: if is_super {
                QuotaSlot::Derived
            } else {
                QuotaSlot::Leaf(0)
            },
            replicas: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn partition(&self) -> PartitionId {
        self.partition
    }

    #[must_use]
    pub const fn quota_slot(&self) -> QuotaSlot {
        self.quota
    }

    #[must_use]
    pub fn share(&self, replica: DatasetReplicaId) -> Option<&ReplicaShare> {
        self.replicas.get(&replica)
    }

    pub fn replicas(&self) -> impl Iterator<Item = (DatasetReplicaId, &ReplicaShare)> + '_ {
        self.replicas.iter().map(|(id, share)| (*id, share))
    }

    #[must_use]
    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    /// Record that `id`, now listed in `all`, matched or not.
    ///
    /// `all` is the owning dataset replica's complete block replica list,
    /// already including `id`.
    pub(crate) fn index_block_replica(
        &mut self,
        replica: DatasetReplicaId,
        id: BlockReplicaId,
        all: &[BlockReplicaId],
        matched: bool,
    ) {
        let share = self.replicas.remove(&replica);
        let next = match (share, matched) {
            (None, true) => Some(normalize(HashSet::from([id]), all.len())),
            (None, false) => None,
            (Some(ReplicaShare::Entire), true) => Some(ReplicaShare::Entire),
            (Some(ReplicaShare::Entire), false) => {
                let others: HashSet<BlockReplicaId> =
                    all.iter().copied().filter(|other| *other != id).collect();
                non_empty(others, all.len())
            }
            (Some(ReplicaShare::Blocks(mut members)), true) => {
                members.insert(id);
                Some(normalize(members, all.len()))
            }
            (Some(ReplicaShare::Blocks(members)), false) => non_empty(members, all.len()),
        };
        if let Some(next) = next {
            self.replicas.insert(replica, next);
        }
    }

    /// Withdraw `id` from this partition.
    ///
    /// `all` is the dataset replica's block replica list *before* any
    /// removal. With `leaving` the replica is being removed from the dataset
    /// replica altogether; otherwise it stays listed (update in progress).
    pub(crate) fn unindex_block_replica(
        &mut self,
        replica: DatasetReplicaId,
        id: BlockReplicaId,
        all: &[BlockReplicaId],
        leaving: bool,
    ) {
        let Some(share) = self.replicas.remove(&replica) else {
            return;
        };
        let remaining = if leaving {
            all.len().saturating_sub(1)
        } else {
            all.len()
        };
        let next = match share {
            ReplicaShare::Entire if leaving => {
                if remaining == 0 {
                    None
                } else {
                    Some(ReplicaShare::Entire)
                }
            }
            ReplicaShare::Entire => {
                let others: HashSet<BlockReplicaId> =
                    all.iter().copied().filter(|other| *other != id).collect();
                non_empty(others, remaining)
            }
            ReplicaShare::Blocks(mut members) => {
                members.remove(&id);
                non_empty(members, remaining)
            }
        };
        if let Some(next) = next {
            self.replicas.insert(replica, next);
        }
    }

    pub(crate) fn drop_replica(&mut self, replica: DatasetReplicaId) {
        self.replicas.remove(&replica);
    }
}

fn normalize(members: HashSet<BlockReplicaId>, total: usize) -> ReplicaShare {
    if members.len() == total {
        ReplicaShare::Entire
    } else {
        ReplicaShare::Blocks(members)
    }
}

fn non_empty(members: HashSet<BlockReplicaId>, total: usize) -> Option<ReplicaShare> {
    if members.is_empty() {
        None
    } else {
        Some(normalize(members, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ArenaId;

    fn br(i: usize) -> BlockReplicaId {
        BlockReplicaId::from_index(i)
    }

    fn dr() -> DatasetReplicaId {
        DatasetReplicaId::from_index(0)
    }

    fn site_partition() -> SitePartition {
        SitePartition::new(PartitionId::from_index(0), false)
    }

    #[test]
    fn test_single_matching_block_is_entire() {
        let mut sp = site_partition();
        sp.index_block_replica(dr(), br(0), &[br(0)], true);
        assert_eq!(sp.share(dr()), Some(&ReplicaShare::Entire));
    }

    #[test]
    fn test_non_matching_addition_splits_entire() {
        let mut sp = site_partition();
        sp.index_block_replica(dr(), br(0), &[br(0)], true);
        sp.index_block_replica(dr(), br(1), &[br(0), br(1)], false);
        assert_eq!(
            sp.share(dr()),
            Some(&ReplicaShare::Blocks(HashSet::from([br(0)])))
        );

        // the missing block joins: back to the sentinel
        sp.unindex_block_replica(dr(), br(1), &[br(0), br(1)], false);
        sp.index_block_replica(dr(), br(1), &[br(0), br(1)], true);
        assert_eq!(sp.share(dr()), Some(&ReplicaShare::Entire));
    }

    #[test]
    fn test_leaving_blocks() {
        let mut sp = site_partition();
        sp.index_block_replica(dr(), br(0), &[br(0)], false);
        sp.index_block_replica(dr(), br(1), &[br(0), br(1)], true);
        assert_eq!(
            sp.share(dr()),
            Some(&ReplicaShare::Blocks(HashSet::from([br(1)])))
        );

        // the non-member leaves: remaining replica set is entirely inside
        sp.unindex_block_replica(dr(), br(0), &[br(0), br(1)], true);
        assert_eq!(sp.share(dr()), Some(&ReplicaShare::Entire));

        sp.unindex_block_replica(dr(), br(1), &[br(1)], true);
        assert_eq!(sp.share(dr()), None);
        assert_eq!(sp.num_replicas(), 0);
    }

    #[test]
    fn test_update_out_of_partition() {
        let mut sp = site_partition();
        sp.index_block_replica(dr(), br(0), &[br(0)], true);
        sp.index_block_replica(dr(), br(1), &[br(0), br(1)], true);
        assert_eq!(sp.share(dr()), Some(&ReplicaShare::Entire));

        sp.unindex_block_replica(dr(), br(0), &[br(0), br(1)], false);
        sp.index_block_replica(dr(), br(0), &[br(0), br(1)], false);
        assert_eq!(
            sp.share(dr()),
            Some(&ReplicaShare::Blocks(HashSet::from([br(1)])))
        );
    }

    #[test]
    fn test_quota_slot_by_kind() {
        assert_eq!(site_partition().quota_slot(), QuotaSlot::Leaf(0));
        assert_eq!(
            SitePartition::new(PartitionId::from_index(1), true).quota_slot(),
            QuotaSlot::Derived
        );
    }
}

//! Dataset and block replicas.
//!
//! A [`BlockReplica`] is an immutable value. The inventory stores it in an
//! arena slot that both the owning dataset replica and the site index refer
//! to by [`BlockReplicaId`]; changing a replica means building a new value with
//! [`BlockReplica::clone_with`] and swapping the slot through
//! [`crate::Inventory::update_block_replica`].

use crate::entity::AttrBag;
use crate::ids::{BlockId, BlockReplicaId, DatasetId, GroupId, SiteId};

// ---------------------------------------------------------------------------
// BlockReplica
// ---------------------------------------------------------------------------

/// Presence of one block at one site under one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockReplica {
    block: BlockId,
    site: SiteId,
    group: GroupId,
    is_complete: bool,
    is_custodial: bool,
    size: u64,
    last_update: i64,
}

/// Field overrides for [`BlockReplica::clone_with`]. `None` keeps the
/// current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockReplicaOverrides {
    pub group: Option<GroupId>,
    pub is_complete: Option<bool>,
    pub is_custodial: Option<bool>,
    pub size: Option<u64>,
    pub last_update: Option<i64>,
}

impl BlockReplica {
    /// A complete, non-custodial replica of `size` physical bytes.
    #[must_use]
    pub const fn new(block: BlockId, site: SiteId, group: GroupId, size: u64) -> Self {
        Self {
            block,
            site,
            group,
            is_complete: true,
            is_custodial: false,
            size,
            last_update: 0,
        }
    }

    /// Copy of this value with the given fields replaced. Block and site are
    /// identity and cannot be overridden.
    #[must_use]
    pub fn clone_with(&self, overrides: BlockReplicaOverrides) -> Self {
        Self {
            block: self.block,
            site: self.site,
            group: overrides.group.unwrap_or(self.group),
            is_complete: overrides.is_complete.unwrap_or(self.is_complete),
            is_custodial: overrides.is_custodial.unwrap_or(self.is_custodial),
            size: overrides.size.unwrap_or(self.size),
            last_update: overrides.last_update.unwrap_or(self.last_update),
        }
    }

    #[must_use]
    pub fn with_group(&self, group: GroupId) -> Self {
        self.clone_with(BlockReplicaOverrides {
            group: Some(group),
            ..BlockReplicaOverrides::default()
        })
    }

    #[must_use]
    pub const fn block(&self) -> BlockId {
        self.block
    }

    #[must_use]
    pub const fn site(&self) -> SiteId {
        self.site
    }

    #[must_use]
    pub const fn group(&self) -> GroupId {
        self.group
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.is_complete
    }

    #[must_use]
    pub const fn is_custodial(&self) -> bool {
        self.is_custodial
    }

    /// Physical bytes at the site; may be below the block size while staging.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn last_update(&self) -> i64 {
        self.last_update
    }

    /// Same block at the same site.
    #[must_use]
    pub fn same_identity(&self, other: &Self) -> bool {
        self.block == other.block && self.site == other.site
    }
}

// ---------------------------------------------------------------------------
// DatasetReplica
// ---------------------------------------------------------------------------

/// A dataset replica linked into the inventory.
#[derive(Debug, Clone)]
pub struct DatasetReplica {
    dataset: DatasetId,
    site: SiteId,
    pub is_complete: bool,
    pub is_custodial: bool,
    pub last_block_created: i64,
    pub(crate) attrs: AttrBag,
    pub(crate) block_replicas: Vec<BlockReplicaId>,
}

impl DatasetReplica {
    #[must_use]
    pub const fn dataset(&self) -> DatasetId {
        self.dataset
    }

    #[must_use]
    pub const fn site(&self) -> SiteId {
        self.site
    }

    #[must_use]
    pub fn block_replicas(&self) -> &[BlockReplicaId] {
        &self.block_replicas
    }

    #[must_use]
    pub const fn attrs(&self) -> &AttrBag {
        &self.attrs
    }

    pub(crate) fn from_detached(detached: &DetachedDatasetReplica) -> Self {
        Self {
            dataset: detached.dataset,
            site: detached.site,
            is_complete: detached.is_complete,
            is_custodial: detached.is_custodial,
            last_block_created: detached.last_block_created,
            attrs: detached.attrs.clone(),
            block_replicas: Vec::new(),
        }
    }
}

/// A dataset replica value with no back-references, used to stage
/// would-be changes before they are linked.
#[derive(Debug, Clone, PartialEq)]
pub struct DetachedDatasetReplica {
    pub dataset: DatasetId,
    pub site: SiteId,
    pub is_complete: bool,
    pub is_custodial: bool,
    pub last_block_created: i64,
    pub attrs: AttrBag,
    /// Deep-copied block replicas; empty for a shallow copy.
    pub block_replicas: Vec<BlockReplica>,
}

impl DetachedDatasetReplica {
    /// A fresh, empty, complete-subscription replica.
    #[must_use]
    pub fn new(dataset: DatasetId, site: SiteId) -> Self {
        Self {
            dataset,
            site,
            is_complete: true,
            is_custodial: false,
            last_block_created: 0,
            attrs: AttrBag::new(),
            block_replicas: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_block_replicas(mut self, block_replicas: Vec<BlockReplica>) -> Self {
        self.block_replicas = block_replicas;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ArenaId;

    fn replica() -> BlockReplica {
        BlockReplica::new(
            BlockId::from_index(1),
            SiteId::from_index(2),
            GroupId::from_index(3),
            100,
        )
    }

    #[test]
    fn test_clone_with_keeps_identity() {
        let original = replica();
        let changed = original.clone_with(BlockReplicaOverrides {
            size: Some(40),
            is_complete: Some(false),
            ..BlockReplicaOverrides::default()
        });
        assert!(changed.same_identity(&original));
        assert_eq!(changed.size(), 40);
        assert!(!changed.is_complete());
        assert_eq!(changed.group(), original.group());
        // the source value is untouched
        assert_eq!(original.size(), 100);
        assert!(original.is_complete());
    }

    #[test]
    fn test_with_group() {
        let original = replica();
        let orphaned = original.with_group(GroupId::NULL);
        assert!(orphaned.group().is_null());
        assert_ne!(orphaned, original);
        assert_eq!(orphaned.with_group(original.group()), original);
    }
}

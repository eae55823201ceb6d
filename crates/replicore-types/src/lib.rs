//! Replica inventory data model.
//!
//! Datasets, blocks, sites, groups and their replicas live in arenas inside an
//! [`Inventory`]; everything else refers to them by typed id. Partitions carve
//! replica space into named subsets with per-site quotas.

pub mod block_name;
pub mod embed;
pub mod entity;
pub mod ids;
pub mod inventory;
pub mod partition;
pub mod quota;
pub mod replica;

pub use block_name::BlockName;
pub use embed::{
    BlockRecord, BlockReplicaRecord, DatasetRecord, DatasetReplicaRecord, EmbedOutcome,
    GroupRecord, SiteRecord,
};
pub use entity::{
    AttrBag, AttrValue, Block, BlockList, DataType, Dataset, DatasetStatus, Group, OwnershipLevel,
    Site, SiteStatus, StorageType,
};
pub use ids::{
    Arena, ArenaId, BlockId, BlockReplicaId, DatasetId, DatasetReplicaId, GroupId, PartitionId,
    SiteId,
};
pub use inventory::Inventory;
pub use partition::{
    Partition, PartitionKind, QuotaSlot, ReplicaPredicate, ReplicaShare, SitePartition,
};
pub use replica::{BlockReplica, BlockReplicaOverrides, DatasetReplica, DetachedDatasetReplica};

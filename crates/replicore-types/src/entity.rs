//! Catalog entities: datasets, blocks, sites and groups.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::block_name::BlockName;
use crate::ids::{BlockId, BlockReplicaId, DatasetId, DatasetReplicaId, PartitionId};
use crate::partition::SitePartition;

// ---------------------------------------------------------------------------
// Demand attributes
// ---------------------------------------------------------------------------

/// A value written onto an entity by a demand producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Flag(bool),
    Number(f64),
    Text(String),
    /// Mapping-valued attribute, e.g. `locked_blocks`: site name to block names.
    Map(BTreeMap<String, Vec<String>>),
}

impl AttrValue {
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Flag(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Vec<String>>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }
}

/// Free-form attribute bag.
pub type AttrBag = BTreeMap<String, AttrValue>;

// ---------------------------------------------------------------------------
// Dataset
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetStatus {
    Production,
    Valid,
    Invalid,
    Deprecated,
    Deleted,
    #[default]
    Unknown,
}

impl DatasetStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Deprecated => "deprecated",
            Self::Deleted => "deleted",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Align,
    Calib,
    Cosmic,
    Data,
    Lumi,
    Mc,
    Raw,
    Test,
    #[default]
    Unknown,
}

impl DataType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Align => "align",
            Self::Calib => "calib",
            Self::Cosmic => "cosmic",
            Self::Data => "data",
            Self::Lumi => "lumi",
            Self::Mc => "mc",
            Self::Raw => "raw",
            Self::Test => "test",
            Self::Unknown => "unknown",
        }
    }
}

/// Load state of a dataset's block list.
///
/// `Unloaded` is not "zero blocks". Only `Loaded` carries the authoritative
/// list; `Partial` holds the blocks seen so far.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BlockList {
    #[default]
    Unloaded,
    Partial(Vec<BlockId>),
    Loaded(Vec<BlockId>),
}

impl BlockList {
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    /// The authoritative block list, if loaded.
    #[must_use]
    pub fn loaded(&self) -> Option<&[BlockId]> {
        match self {
            Self::Loaded(blocks) => Some(blocks),
            _ => None,
        }
    }

    /// Blocks known so far regardless of load state.
    #[must_use]
    pub fn known(&self) -> &[BlockId] {
        match self {
            Self::Unloaded => &[],
            Self::Partial(blocks) | Self::Loaded(blocks) => blocks,
        }
    }

    pub(crate) fn push(&mut self, block: BlockId) {
        match self {
            Self::Unloaded => *self = Self::Partial(vec![block]),
            Self::Partial(blocks) | Self::Loaded(blocks) => {
                if !blocks.contains(&block) {
                    blocks.push(block);
                }
            }
        }
    }

    pub(crate) fn remove(&mut self, block: BlockId) {
        if let Self::Partial(blocks) | Self::Loaded(blocks) = self {
            blocks.retain(|candidate| *candidate != block);
        }
    }

    pub(crate) fn mark_loaded(&mut self) {
        let blocks = std::mem::take(self).known().to_vec();
        *self = Self::Loaded(blocks);
    }
}

/// A named collection of blocks.
#[derive(Debug, Clone)]
pub struct Dataset {
    name: String,
    pub size: u64,
    pub num_files: u64,
    pub is_open: bool,
    pub status: DatasetStatus,
    pub data_type: DataType,
    pub software_version: Option<String>,
    pub last_update: i64,
    pub(crate) attrs: AttrBag,
    pub(crate) blocks: BlockList,
    pub(crate) replicas: Vec<DatasetReplicaId>,
}

impl Dataset {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            num_files: 0,
            is_open: false,
            status: DatasetStatus::Unknown,
            data_type: DataType::Unknown,
            software_version: None,
            last_update: 0,
            attrs: AttrBag::new(),
            blocks: BlockList::Unloaded,
            replicas: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn blocks(&self) -> &BlockList {
        &self.blocks
    }

    #[must_use]
    pub fn replicas(&self) -> &[DatasetReplicaId] {
        &self.replicas
    }

    #[must_use]
    pub const fn attrs(&self) -> &AttrBag {
        &self.attrs
    }

    #[must_use]
    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// Smallest addressable unit of data. Identity is independent of any site.
#[derive(Debug, Clone)]
pub struct Block {
    name: BlockName,
    dataset: DatasetId,
    pub size: u64,
    pub num_files: u64,
    pub is_open: bool,
    pub last_update: i64,
    pub(crate) replicas: SmallVec<[BlockReplicaId; 4]>,
}

impl Block {
    #[must_use]
    pub fn new(name: BlockName, dataset: DatasetId) -> Self {
        Self {
            name,
            dataset,
            size: 0,
            num_files: 0,
            is_open: false,
            last_update: 0,
            replicas: SmallVec::new(),
        }
    }

    #[must_use]
    pub const fn name(&self) -> BlockName {
        self.name
    }

    #[must_use]
    pub const fn dataset(&self) -> DatasetId {
        self.dataset
    }

    #[must_use]
    pub fn replicas(&self) -> &[BlockReplicaId] {
        &self.replicas
    }
}

// ---------------------------------------------------------------------------
// Site
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Disk,
    Tape,
    Buffer,
    #[default]
    Unknown,
}

impl StorageType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disk => "disk",
            Self::Tape => "tape",
            Self::Buffer => "buffer",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Ready,
    Waiting,
    Morgue,
    #[default]
    Unknown,
}

impl SiteStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Waiting => "waiting",
            Self::Morgue => "morgue",
            Self::Unknown => "unknown",
        }
    }
}

/// A storage endpoint.
#[derive(Debug, Clone)]
pub struct Site {
    name: String,
    pub host: String,
    pub storage_type: StorageType,
    pub backend: String,
    pub status: SiteStatus,
    pub cpu: f64,
    pub(crate) dataset_replicas: HashMap<DatasetId, DatasetReplicaId>,
    pub(crate) block_replicas: HashSet<BlockReplicaId>,
    pub(crate) partitions: HashMap<PartitionId, SitePartition>,
}

impl Site {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: String::new(),
            storage_type: StorageType::Unknown,
            backend: String::new(),
            status: SiteStatus::Unknown,
            cpu: 0.0,
            dataset_replicas: HashMap::new(),
            block_replicas: HashSet::new(),
            partitions: HashMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dataset replica held at this site for `dataset`, if any.
    #[must_use]
    pub fn find_dataset_replica(&self, dataset: DatasetId) -> Option<DatasetReplicaId> {
        self.dataset_replicas.get(&dataset).copied()
    }

    pub fn dataset_replicas(&self) -> impl Iterator<Item = DatasetReplicaId> + '_ {
        self.dataset_replicas.values().copied()
    }

    #[must_use]
    pub fn has_block_replica(&self, id: BlockReplicaId) -> bool {
        self.block_replicas.contains(&id)
    }

    #[must_use]
    pub fn num_block_replicas(&self) -> usize {
        self.block_replicas.len()
    }

    #[must_use]
    pub fn site_partition(&self, partition: PartitionId) -> Option<&SitePartition> {
        self.partitions.get(&partition)
    }
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// Granularity at which a group owns replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnershipLevel {
    #[default]
    Block,
    Dataset,
}

/// Ownership/accounting label for replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    name: Option<String>,
    pub olevel: OwnershipLevel,
}

impl Group {
    #[must_use]
    pub fn new(name: impl Into<String>, olevel: OwnershipLevel) -> Self {
        Self {
            name: Some(name.into()),
            olevel,
        }
    }

    /// The null group: no name, dataset-level ownership.
    #[must_use]
    pub const fn null() -> Self {
        Self {
            name: None,
            olevel: OwnershipLevel::Dataset,
        }
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.name.is_none()
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name().unwrap_or("None"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ArenaId;

    #[test]
    fn test_block_list_tri_state() {
        let mut list = BlockList::Unloaded;
        assert!(!list.is_loaded());
        assert!(list.loaded().is_none());
        assert!(list.known().is_empty());

        list.push(BlockId::from_index(0));
        assert!(matches!(list, BlockList::Partial(_)));
        assert!(list.loaded().is_none());

        list.mark_loaded();
        assert_eq!(list.loaded(), Some(&[BlockId::from_index(0)][..]));

        let mut empty = BlockList::Unloaded;
        empty.mark_loaded();
        assert_eq!(empty.loaded(), Some(&[][..]));
    }

    #[test]
    fn test_attr_value_untagged_serde() {
        let mut bag = AttrBag::new();
        bag.insert("global_usage_rank".to_owned(), AttrValue::Number(3.0));
        let mut locked = BTreeMap::new();
        locked.insert("T2_CH_CERN".to_owned(), vec!["b1".to_owned()]);
        bag.insert("locked_blocks".to_owned(), AttrValue::Map(locked));

        let json = serde_json::to_string(&bag).unwrap();
        let back: AttrBag = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bag);
        assert_eq!(back["global_usage_rank"].as_number(), Some(3.0));
        assert!(back["locked_blocks"].as_map().is_some());
    }

    #[test]
    fn test_null_group_display() {
        assert_eq!(Group::null().to_string(), "None");
        assert!(Group::null().is_null());
        assert_eq!(
            Group::new("AnalysisOps", OwnershipLevel::Block).to_string(),
            "AnalysisOps"
        );
    }
}

//! Attribute resolution: named variables that read a typed value off any of
//! the objects a rule can be evaluated against.
//!
//! Each variable is bound at registration time to one source kind
//! ([`Attr`]). Resolution normalises the subject to that kind first: a
//! dataset variable evaluated on a block replica reads the block's dataset, a
//! dataset replica variable evaluated on a block replica reads the owning
//! dataset replica, and a block replica variable evaluated on a dataset
//! replica yields one value per block replica.

use std::collections::HashMap;
use std::fmt;

use replicore_error::{ReplicoreError, Result};
use replicore_types::{
    AttrValue, BlockReplica, Dataset, DatasetReplica, DatasetReplicaId, Inventory, PartitionId,
    Site, SiteId, StorageType,
};

use crate::value::{Value, ValueKind};

/// Demand attribute holding the global popularity rank of a dataset.
pub const USAGE_RANK_ATTR: &str = "global_usage_rank";
/// Demand attribute holding the pending-request weight of a dataset.
pub const REQUEST_WEIGHT_ATTR: &str = "request_weight";
/// Demand attribute mapping site names to locked block names.
pub const LOCKED_BLOCKS_ATTR: &str = "locked_blocks";

// ---------------------------------------------------------------------------
// Evaluation inputs
// ---------------------------------------------------------------------------

/// The object a rule is evaluated against.
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    /// A block replica value, linked or not yet inserted.
    BlockReplica(&'a BlockReplica),
    DatasetReplica(DatasetReplicaId),
    Dataset(replicore_types::DatasetId),
    Site(SiteId),
    SitePartition(SiteId, PartitionId),
}

/// Snapshot and clock a rule is evaluated under.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub inventory: &'a Inventory,
    /// Unix seconds.
    pub now: i64,
}

impl<'a> EvalContext<'a> {
    #[must_use]
    pub const fn new(inventory: &'a Inventory, now: i64) -> Self {
        Self { inventory, now }
    }
}

/// Outcome of resolving a variable against a subject.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Scalar(Value),
    /// One value per block replica of a dataset replica.
    PerBlock(Vec<Value>),
    /// The subject has no such attribute (for example a site asked for a
    /// dataset name, or a demand attribute that was never written).
    Missing,
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

pub type DatasetFn = fn(&Inventory, &Dataset) -> Result<Option<Value>>;
pub type DatasetReplicaFn = fn(&Inventory, DatasetReplicaId, &DatasetReplica) -> Result<Option<Value>>;
pub type BlockReplicaFn = fn(&Inventory, &BlockReplica) -> Result<Option<Value>>;
pub type SiteFn = fn(&Site) -> Option<Value>;
pub type SitePartitionFn = fn(&Inventory, SiteId, PartitionId) -> Result<Option<Value>>;

/// Source object kind a variable reads from.
#[derive(Clone, Copy)]
pub enum Attr {
    Dataset(DatasetFn),
    DatasetReplica(DatasetReplicaFn),
    BlockReplica(BlockReplicaFn),
    /// Properties of the site holding a replica, or of a site subject.
    ReplicaSite(SiteFn),
    /// Quota-relative site properties; need a partition, taken from the
    /// subject or from the predicate's binding.
    Site(SitePartitionFn),
}

impl Attr {
    const fn source(&self) -> &'static str {
        match self {
            Self::Dataset(_) => "dataset",
            Self::DatasetReplica(_) => "dataset replica",
            Self::BlockReplica(_) => "block replica",
            Self::ReplicaSite(_) => "replica site",
            Self::Site(_) => "site partition",
        }
    }
}

impl fmt::Debug for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source())
    }
}

/// A named, typed attribute accessor.
#[derive(Debug, Clone)]
pub struct Variable {
    name: &'static str,
    kind: ValueKind,
    attr: Attr,
    required_attrs: &'static [&'static str],
}

impl Variable {
    #[must_use]
    pub const fn new(name: &'static str, kind: ValueKind, attr: Attr) -> Self {
        Self {
            name,
            kind,
            attr,
            required_attrs: &[],
        }
    }

    /// Declare the demand attributes this variable reads.
    #[must_use]
    pub const fn requiring(mut self, attrs: &'static [&'static str]) -> Self {
        self.required_attrs = attrs;
        self
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        self.kind
    }

    #[must_use]
    pub const fn attr(&self) -> Attr {
        self.attr
    }

    #[must_use]
    pub const fn required_attrs(&self) -> &'static [&'static str] {
        self.required_attrs
    }

    /// Values come from individual block replicas.
    #[must_use]
    pub const fn is_block_level(&self) -> bool {
        matches!(self.attr, Attr::BlockReplica(_))
    }

    /// Whether resolution depends on the partition binding.
    #[must_use]
    pub const fn is_partition_relative(&self) -> bool {
        matches!(self.attr, Attr::Site(_))
    }

    /// Read this variable off `subject`.
    ///
    /// `partition` is the binding used by quota-relative site variables when
    /// the subject does not name a partition itself.
    pub fn resolve(
        &self,
        ctx: &EvalContext<'_>,
        subject: Subject<'_>,
        partition: Option<PartitionId>,
    ) -> Result<Resolved> {
        let inventory = ctx.inventory;
        let scalar = |value: Option<Value>| value.map_or(Resolved::Missing, Resolved::Scalar);
        match (self.attr, subject) {
            (Attr::Dataset(read), subject) => {
                let dataset = match subject {
                    Subject::BlockReplica(replica) => inventory.require_block(replica.block())?.dataset(),
                    Subject::DatasetReplica(id) => inventory.require_dataset_replica(id)?.dataset(),
                    Subject::Dataset(id) => id,
                    Subject::Site(_) | Subject::SitePartition(..) => return Ok(Resolved::Missing),
                };
                read(inventory, inventory.require_dataset(dataset)?).map(scalar)
            }
            (Attr::DatasetReplica(read), subject) => {
                let id = match subject {
                    Subject::BlockReplica(replica) => {
                        match inventory.owning_dataset_replica(replica) {
                            Some(id) => id,
                            None => return Ok(Resolved::Missing),
                        }
                    }
                    Subject::DatasetReplica(id) => id,
                    _ => return Ok(Resolved::Missing),
                };
                read(inventory, id, inventory.require_dataset_replica(id)?).map(scalar)
            }
            (Attr::BlockReplica(read), Subject::BlockReplica(replica)) => read(inventory, replica).map(scalar),
            (Attr::BlockReplica(read), Subject::DatasetReplica(id)) => {
                let replica = inventory.require_dataset_replica(id)?;
                let mut values = Vec::with_capacity(replica.block_replicas().len());
                for member in replica.block_replicas() {
                    match read(inventory, inventory.require_block_replica(*member)?)? {
                        Some(value) => values.push(value),
                        None => return Ok(Resolved::Missing),
                    }
                }
                Ok(Resolved::PerBlock(values))
            }
            (Attr::BlockReplica(_), _) => Ok(Resolved::Missing),
            (Attr::ReplicaSite(read), subject) => {
                let site = match subject {
                    Subject::BlockReplica(replica) => replica.site(),
                    Subject::DatasetReplica(id) => inventory.require_dataset_replica(id)?.site(),
                    Subject::Site(site) | Subject::SitePartition(site, _) => site,
                    Subject::Dataset(_) => return Ok(Resolved::Missing),
                };
                Ok(scalar(read(inventory.require_site(site)?)))
            }
            (Attr::Site(read), subject) => {
                let (site, own_partition) = match subject {
                    Subject::BlockReplica(replica) => (replica.site(), None),
                    Subject::DatasetReplica(id) => (inventory.require_dataset_replica(id)?.site(), None),
                    Subject::Site(site) => (site, None),
                    Subject::SitePartition(site, partition) => (site, Some(partition)),
                    Subject::Dataset(_) => return Ok(Resolved::Missing),
                };
                let Some(partition) = own_partition.or(partition) else {
                    return Err(ReplicoreError::config(format!(
                        "variable {} needs a partition binding",
                        self.name
                    )));
                };
                read(inventory, site, partition).map(scalar)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Variables addressable by name from rule text.
#[derive(Debug, Clone, Default)]
pub struct VariableRegistry {
    variables: HashMap<&'static str, Variable>,
}

impl VariableRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register or replace a variable.
    pub fn register(&mut self, variable: Variable) {
        self.variables.insert(variable.name, variable);
    }

    pub fn get(&self, name: &str) -> Result<&Variable> {
        self.variables
            .get(name)
            .ok_or_else(|| ReplicoreError::UnknownVariable {
                name: name.to_owned(),
            })
    }

    /// Sorted variable names.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.variables.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Every built-in variable.
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn standard() -> Self {
        use ValueKind::{Bool, Number, Text, Time};

        let mut registry = Self::empty();
        let vars = [
            // dataset
            Variable::new("dataset.name", Text, Attr::Dataset(|_, d| Ok(Some(text(d.name()))))),
            Variable::new("dataset.status", Text, Attr::Dataset(|_, d| Ok(Some(text(d.status.as_str()))))),
            Variable::new("dataset.data_type", Text, Attr::Dataset(|_, d| Ok(Some(text(d.data_type.as_str()))))),
            Variable::new(
                "dataset.software_version",
                Text,
                Attr::Dataset(|_, d| Ok(d.software_version.as_deref().map(text))),
            ),
            Variable::new("dataset.size", Number, Attr::Dataset(|_, d| Ok(Some(number(d.size))))),
            Variable::new("dataset.num_files", Number, Attr::Dataset(|_, d| Ok(Some(number(d.num_files))))),
            Variable::new(
                "dataset.num_blocks",
                Number,
                Attr::Dataset(|_, d| Ok(Some(count(d.blocks().known().len())))),
            ),
            Variable::new("dataset.is_open", Bool, Attr::Dataset(|_, d| Ok(Some(Value::Bool(d.is_open))))),
            Variable::new("dataset.last_update", Time, Attr::Dataset(|_, d| Ok(Some(Value::Time(d.last_update))))),
            Variable::new("dataset.num_copies", Number, Attr::Dataset(|_, d| Ok(Some(count(d.replicas().len()))))),
            Variable::new("dataset.on_tape", Bool, Attr::Dataset(dataset_on_tape)),
            Variable::new(
                "dataset.usage_rank",
                Number,
                Attr::Dataset(|_, d| Ok(d.attr(USAGE_RANK_ATTR).and_then(AttrValue::as_number).map(Value::Number))),
            )
            .requiring(&[USAGE_RANK_ATTR]),
            Variable::new(
                "dataset.request_weight",
                Number,
                Attr::Dataset(|_, d| {
                    Ok(Some(Value::Number(
                        d.attr(REQUEST_WEIGHT_ATTR).and_then(AttrValue::as_number).unwrap_or(0.0),
                    )))
                }),
            )
            .requiring(&[REQUEST_WEIGHT_ATTR]),
            // dataset replica
            Variable::new(
                "replica.is_complete",
                Bool,
                Attr::DatasetReplica(|_, _, r| Ok(Some(Value::Bool(r.is_complete)))),
            ),
            Variable::new(
                "replica.is_custodial",
                Bool,
                Attr::DatasetReplica(|_, _, r| Ok(Some(Value::Bool(r.is_custodial)))),
            ),
            Variable::new(
                "replica.last_block_created",
                Time,
                Attr::DatasetReplica(|_, _, r| Ok(Some(Value::Time(r.last_block_created)))),
            ),
            Variable::new(
                "replica.is_full",
                Bool,
                Attr::DatasetReplica(|inv, id, _| inv.is_full(id).map(|full| Some(Value::Bool(full)))),
            ),
            Variable::new(
                "replica.is_partial",
                Bool,
                Attr::DatasetReplica(|inv, id, _| inv.is_partial(id).map(|partial| Some(Value::Bool(partial)))),
            ),
            Variable::new(
                "replica.num_blocks",
                Number,
                Attr::DatasetReplica(|_, _, r| Ok(Some(count(r.block_replicas().len())))),
            ),
            Variable::new(
                "replica.size",
                Number,
                Attr::DatasetReplica(|inv, id, _| inv.dataset_replica_size(id, true).map(|size| Some(number(size)))),
            ),
            Variable::new("replica.is_locked", Bool, Attr::DatasetReplica(replica_is_locked))
                .requiring(&[LOCKED_BLOCKS_ATTR]),
            Variable::new("replica.site.name", Text, Attr::ReplicaSite(|s| Some(text(s.name())))),
            Variable::new("replica.site.status", Text, Attr::ReplicaSite(|s| Some(text(s.status.as_str())))),
            Variable::new(
                "replica.site.storage_type",
                Text,
                Attr::ReplicaSite(|s| Some(text(s.storage_type.as_str()))),
            ),
            // block replica
            Variable::new("blockreplica.owner", Text, Attr::BlockReplica(block_replica_owner)),
            Variable::new(
                "blockreplica.is_complete",
                Bool,
                Attr::BlockReplica(|_, b| Ok(Some(Value::Bool(b.is_complete())))),
            ),
            Variable::new(
                "blockreplica.is_custodial",
                Bool,
                Attr::BlockReplica(|_, b| Ok(Some(Value::Bool(b.is_custodial())))),
            ),
            Variable::new(
                "blockreplica.last_update",
                Time,
                Attr::BlockReplica(|_, b| Ok(Some(Value::Time(b.last_update())))),
            ),
            Variable::new("blockreplica.size", Number, Attr::BlockReplica(|_, b| Ok(Some(number(b.size()))))),
            Variable::new("blockreplica.is_locked", Bool, Attr::BlockReplica(block_replica_is_locked))
                .requiring(&[LOCKED_BLOCKS_ATTR]),
            // site
            Variable::new("site.name", Text, Attr::ReplicaSite(|s| Some(text(s.name())))),
            Variable::new("site.status", Text, Attr::ReplicaSite(|s| Some(text(s.status.as_str())))),
            Variable::new("site.storage_type", Text, Attr::ReplicaSite(|s| Some(text(s.storage_type.as_str())))),
            Variable::new("site.cpu", Number, Attr::ReplicaSite(|s| Some(Value::Number(s.cpu)))),
            Variable::new(
                "site.quota",
                Number,
                Attr::Site(|inv, site, partition| {
                    inv.quota(site, partition).map(|quota| Some(signed(quota)))
                }),
            ),
            Variable::new(
                "site.occupancy",
                Number,
                Attr::Site(|inv, site, partition| {
                    inv.occupancy_fraction(site, partition, true)
                        .map(|fraction| Some(Value::Number(fraction)))
                }),
            ),
        ];
        for variable in vars {
            registry.register(variable);
        }
        registry
    }
}

fn text(s: &str) -> Value {
    Value::Text(s.to_owned())
}

#[allow(clippy::cast_precision_loss)]
fn number(n: u64) -> Value {
    Value::Number(n as f64)
}

#[allow(clippy::cast_precision_loss)]
fn signed(n: i64) -> Value {
    Value::Number(n as f64)
}

#[allow(clippy::cast_precision_loss)]
fn count(n: usize) -> Value {
    Value::Number(n as f64)
}

fn dataset_on_tape(inventory: &Inventory, dataset: &Dataset) -> Result<Option<Value>> {
    let on_tape = dataset.replicas().iter().any(|id| {
        inventory
            .dataset_replica(*id)
            .and_then(|replica| inventory.site(replica.site()))
            .is_some_and(|site| site.storage_type == StorageType::Tape)
    });
    Ok(Some(Value::Bool(on_tape)))
}

/// Blocks locked at `site`, from the dataset's `locked_blocks` demand map.
/// The key `*` locks at every site.
fn locked_at<'a>(dataset: &'a Dataset, site: &str) -> impl Iterator<Item = &'a String> + 'a {
    let map = dataset.attr(LOCKED_BLOCKS_ATTR).and_then(AttrValue::as_map);
    let site = site.to_owned();
    map.into_iter().flat_map(move |map| {
        map.iter()
            .filter(|(key, _)| key.as_str() == site || key.as_str() == "*")
            .flat_map(|(_, blocks)| blocks.iter())
            .collect::<Vec<_>>()
    })
}

fn replica_is_locked(inventory: &Inventory, _id: DatasetReplicaId, replica: &DatasetReplica) -> Result<Option<Value>> {
    let dataset = inventory.require_dataset(replica.dataset())?;
    let site = inventory.require_site(replica.site())?;
    Ok(Some(Value::Bool(locked_at(dataset, site.name()).next().is_some())))
}

fn block_replica_is_locked(inventory: &Inventory, replica: &BlockReplica) -> Result<Option<Value>> {
    let block = inventory.require_block(replica.block())?;
    let dataset = inventory.require_dataset(block.dataset())?;
    let site = inventory.require_site(replica.site())?;
    let name = block.name().to_hyphenated();
    let locked = locked_at(dataset, site.name()).any(|locked| *locked == name || locked == "*");
    Ok(Some(Value::Bool(locked)))
}

fn block_replica_owner(inventory: &Inventory, replica: &BlockReplica) -> Result<Option<Value>> {
    let group = inventory.require_group(replica.group())?;
    Ok(Some(text(&group.to_string())))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use replicore_types::{
        Block, BlockName, DetachedDatasetReplica, Group, GroupId, OwnershipLevel,
    };

    use super::*;

    fn inventory() -> (Inventory, DatasetReplicaId) {
        let mut inventory = Inventory::new();
        let site = inventory.add_site(Site::new("T1_XX_Disk")).unwrap();
        let group = inventory
            .add_group(Group::new("DataOps", OwnershipLevel::Block))
            .unwrap();
        let mut dataset = Dataset::new("/A/B/RAW");
        dataset.size = 300;
        let dataset = inventory.add_dataset(dataset).unwrap();
        let blocks: Vec<_> = (0..2u8)
            .map(|i| {
                inventory
                    .add_block(Block::new(BlockName::from_bytes([i; 16]), dataset))
                    .unwrap()
            })
            .collect();
        let replica = inventory
            .link_dataset_replica(DetachedDatasetReplica::new(dataset, site).with_block_replicas(vec![
                BlockReplica::new(blocks[0], site, group, 10),
                BlockReplica::new(blocks[1], site, GroupId::NULL, 20),
            ]))
            .unwrap();
        (inventory, replica)
    }

    #[test]
    fn test_dataset_variable_normalises_subject() {
        let (inventory, replica) = inventory();
        let ctx = EvalContext::new(&inventory, 0);
        let registry = VariableRegistry::standard();
        let name = registry.get("dataset.name").unwrap();

        let expected = Resolved::Scalar(Value::Text("/A/B/RAW".to_owned()));
        assert_eq!(name.resolve(&ctx, Subject::DatasetReplica(replica), None).unwrap(), expected);
        let member = inventory.dataset_replica(replica).unwrap().block_replicas()[0];
        let value = inventory.block_replica(member).unwrap();
        assert_eq!(name.resolve(&ctx, Subject::BlockReplica(value), None).unwrap(), expected);
        let site = value.site();
        assert_eq!(name.resolve(&ctx, Subject::Site(site), None).unwrap(), Resolved::Missing);
    }

    #[test]
    fn test_block_variable_on_dataset_replica_is_sequence() {
        let (inventory, replica) = inventory();
        let ctx = EvalContext::new(&inventory, 0);
        let registry = VariableRegistry::standard();
        let owner = registry.get("blockreplica.owner").unwrap();
        assert!(owner.is_block_level());
        assert_eq!(
            owner.resolve(&ctx, Subject::DatasetReplica(replica), None).unwrap(),
            Resolved::PerBlock(vec![
                Value::Text("DataOps".to_owned()),
                Value::Text("None".to_owned()),
            ])
        );
    }

    #[test]
    fn test_unloaded_blocks_surface_as_object_error() {
        let (inventory, replica) = inventory();
        let ctx = EvalContext::new(&inventory, 0);
        let registry = VariableRegistry::standard();
        let err = registry
            .get("replica.is_full")
            .unwrap()
            .resolve(&ctx, Subject::DatasetReplica(replica), None)
            .unwrap_err();
        assert!(err.is_object_error());
    }

    #[test]
    fn test_site_variable_needs_partition() {
        let (mut inventory, replica) = inventory();
        let partition = inventory
            .add_partition("All", replicore_types::PartitionKind::Leaf(None))
            .unwrap();
        let site = inventory.dataset_replica(replica).unwrap().site();
        inventory.set_quota(site, partition, 1000).unwrap();
        let ctx = EvalContext::new(&inventory, 0);
        let registry = VariableRegistry::standard();
        let quota = registry.get("site.quota").unwrap();
        assert!(quota.is_partition_relative());
        assert!(quota.resolve(&ctx, Subject::Site(site), None).is_err());
        assert_eq!(
            quota.resolve(&ctx, Subject::Site(site), Some(partition)).unwrap(),
            Resolved::Scalar(Value::Number(1000.0))
        );
        assert_eq!(
            quota.resolve(&ctx, Subject::SitePartition(site, partition), None).unwrap(),
            Resolved::Scalar(Value::Number(1000.0))
        );
    }

    #[test]
    fn test_locked_blocks_demand() {
        let (mut inventory, replica) = inventory();
        let dataset = inventory.dataset_replica(replica).unwrap().dataset();
        let registry = VariableRegistry::standard();
        let locked = registry.get("replica.is_locked").unwrap();
        assert_eq!(locked.required_attrs(), &[LOCKED_BLOCKS_ATTR]);
        {
            let ctx = EvalContext::new(&inventory, 0);
            assert_eq!(
                locked.resolve(&ctx, Subject::DatasetReplica(replica), None).unwrap(),
                Resolved::Scalar(Value::Bool(false))
            );
        }
        let mut map = BTreeMap::new();
        map.insert("T1_XX_Disk".to_owned(), vec![BlockName::from_bytes([0; 16]).to_hyphenated()]);
        inventory
            .set_dataset_attr(dataset, LOCKED_BLOCKS_ATTR, AttrValue::Map(map))
            .unwrap();
        let ctx = EvalContext::new(&inventory, 0);
        assert_eq!(
            locked.resolve(&ctx, Subject::DatasetReplica(replica), None).unwrap(),
            Resolved::Scalar(Value::Bool(true))
        );
        let per_block = registry
            .get("blockreplica.is_locked")
            .unwrap()
            .resolve(&ctx, Subject::DatasetReplica(replica), None)
            .unwrap();
        assert_eq!(
            per_block,
            Resolved::PerBlock(vec![Value::Bool(true), Value::Bool(false)])
        );
    }

    #[test]
    fn test_unknown_variable() {
        let registry = VariableRegistry::standard();
        assert!(matches!(
            registry.get("dataset.colour"),
            Err(ReplicoreError::UnknownVariable { .. })
        ));
        assert!(registry.names().contains(&"site.occupancy"));
    }
}

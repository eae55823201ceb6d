//! TOML configuration.
//!
//! Everything a cycle needs is compiled while loading: partition rules,
//! policy conditions, candidate order lines and producer priorities. A
//! configuration that loads is one that can run.
//!
//! ```toml
//! [[partitions]]
//! name = "AnalysisOps"
//! condition = "blockreplica.owner == AnalysisOps"
//!
//! [[quotas]]
//! site = "*"
//! partition = "AnalysisOps"
//! quota = "300 TB"
//!
//! [retention]
//! name = "analysis"
//! partition = "AnalysisOps"
//! order = ["increasing replica.last_block_created"]
//!
//! [[retention.policies]]
//! name = "protect_incomplete"
//! condition = "not replica.is_complete"
//! decision = "protect"
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use replicore_error::{ReplicoreError, Result};
use replicore_policy::{
    CandidateOrder, Decision, Policy, PolicyStack, RequestAggregator, RequestProducer, selection_weights,
};
use replicore_rules::value::parse_number;
use replicore_rules::{Condition, VariableRegistry};
use replicore_types::{Inventory, PartitionId, PartitionKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Raw configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
    #[serde(default)]
    pub quotas: Vec<QuotaConfig>,
    #[serde(default)]
    pub retention: Option<RetentionConfig>,
    #[serde(default)]
    pub placement: Option<PlacementConfig>,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

/// A partition is either rule-defined or the union of named children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionConfig {
    pub name: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub subpartitions: Vec<String>,
}

/// Quota in bytes, or text such as `"300 TB"` or `"unlimited"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuotaAmount {
    Bytes(i64),
    Text(String),
}

impl QuotaAmount {
    /// Bytes, with negative meaning unlimited.
    pub fn bytes(&self) -> Result<i64> {
        match self {
            Self::Bytes(bytes) => Ok(*bytes),
            Self::Text(text) if text.eq_ignore_ascii_case("unlimited") => Ok(-1),
            Self::Text(text) => Ok(parse_number(text)?.round() as i64),
        }
    }
}

/// Static quota for one partition at one site, or at every site with `"*"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    pub site: String,
    pub partition: String,
    pub quota: QuotaAmount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    pub name: String,
    pub condition: String,
    pub decision: Decision,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    #[serde(default = "default_stack_name")]
    pub name: String,
    /// Only replicas in this partition are evaluated; all replicas if unset.
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub default_decision: Decision,
    /// `<increasing|decreasing> <variable>` lines ranking DELETE candidates.
    #[serde(default)]
    pub order: Vec<String>,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProducerConfig {
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlacementConfig {
    /// Partition whose occupancy gates destinations.
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default = "default_ceiling")]
    pub occupancy_ceiling: f64,
    #[serde(default)]
    pub producers: Vec<ProducerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_staleness")]
    pub max_staleness_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_staleness_secs: default_staleness(),
            retries: default_retries(),
            retry_backoff_ms: default_backoff_ms(),
        }
    }
}

impl SnapshotConfig {
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn default_stack_name() -> String {
    "retention".to_owned()
}

const fn default_priority() -> u32 {
    1
}

const fn default_ceiling() -> f64 {
    1.0
}

const fn default_workers() -> usize {
    4
}

const fn default_staleness() -> u64 {
    86_400
}

const fn default_retries() -> u32 {
    3
}

const fn default_backoff_ms() -> u64 {
    500
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl Config {
    /// Parse and validate against the standard variable registry.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Self::from_toml_str_with(text, &VariableRegistry::standard())
    }

    pub fn from_toml_str_with(text: &str, registry: &VariableRegistry) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|err| ReplicoreError::config(format!("invalid configuration: {err}")))?;
        config.validate(registry)?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| ReplicoreError::config(format!("cannot read {}: {err}", path.display())))?;
        let config = Self::from_toml_str(&text)?;
        info!(path = %path.display(), partitions = config.partitions.len(), "configuration loaded");
        Ok(config)
    }

    /// Check everything that can be checked without an inventory.
    pub fn validate(&self, registry: &VariableRegistry) -> Result<()> {
        self.partition_order()?;
        for partition in &self.partitions {
            if let Some(rule) = &partition.condition {
                if Condition::compile(rule, registry)?.needs_partition() {
                    return Err(ReplicoreError::config(format!(
                        "partition {} condition cannot read site quota or occupancy",
                        partition.name
                    )));
                }
            }
        }
        let known: HashSet<&str> = self.partitions.iter().map(|p| p.name.as_str()).collect();
        let require_partition = |name: &str| {
            if known.contains(name) {
                Ok(())
            } else {
                Err(ReplicoreError::config(format!("unknown partition {name}")))
            }
        };
        let children: HashSet<&str> = self
            .partitions
            .iter()
            .flat_map(|partition| partition.subpartitions.iter().map(String::as_str))
            .collect();
        for quota in &self.quotas {
            require_partition(&quota.partition)?;
            let bytes = quota.quota.bytes()?;
            let is_super = self
                .partitions
                .iter()
                .any(|partition| partition.name == quota.partition && !partition.subpartitions.is_empty());
            if is_super {
                return Err(ReplicoreError::config(format!(
                    "partition {} is a superpartition; its quota is the sum of its subpartitions",
                    quota.partition
                )));
            }
            if bytes < 0 && children.contains(quota.partition.as_str()) {
                return Err(ReplicoreError::config(format!(
                    "subpartition {} cannot have an unlimited quota",
                    quota.partition
                )));
            }
        }
        if let Some(retention) = &self.retention {
            if let Some(partition) = &retention.partition {
                require_partition(partition)?;
            }
            retention.compile(registry)?;
        }
        if let Some(placement) = &self.placement {
            if let Some(partition) = &placement.partition {
                require_partition(partition)?;
            }
            placement.validate()?;
        }
        if self.snapshot.workers == 0 {
            return Err(ReplicoreError::config("snapshot.workers must be at least 1"));
        }
        Ok(())
    }

    /// Partition configs ordered so that every child precedes its parent.
    fn partition_order(&self) -> Result<Vec<&PartitionConfig>> {
        let by_name: HashMap<&str, &PartitionConfig> =
            self.partitions.iter().map(|p| (p.name.as_str(), p)).collect();
        if by_name.len() != self.partitions.len() {
            return Err(ReplicoreError::config("partition names must be unique"));
        }
        let mut parents: HashMap<&str, &str> = HashMap::new();
        for partition in &self.partitions {
            match (&partition.condition, partition.subpartitions.is_empty()) {
                (Some(_), true) | (None, false) => {}
                (Some(_), false) => {
                    return Err(ReplicoreError::config(format!(
                        "partition {} has both a condition and subpartitions",
                        partition.name
                    )));
                }
                (None, true) => {
                    return Err(ReplicoreError::config(format!(
                        "partition {} needs a condition or subpartitions",
                        partition.name
                    )));
                }
            }
            for child in &partition.subpartitions {
                if !by_name.contains_key(child.as_str()) {
                    return Err(ReplicoreError::config(format!(
                        "partition {} lists unknown subpartition {child}",
                        partition.name
                    )));
                }
                if let Some(previous) = parents.insert(child.as_str(), partition.name.as_str()) {
                    return Err(ReplicoreError::config(format!(
                        "partition {child} is listed under both {previous} and {}",
                        partition.name
                    )));
                }
            }
        }

        // Depth-first post-order; a node met again while on the stack is a cycle.
        let mut ordered = Vec::with_capacity(self.partitions.len());
        let mut done: HashSet<&str> = HashSet::new();
        let mut visiting: HashSet<&str> = HashSet::new();
        fn visit<'a>(
            name: &'a str,
            by_name: &HashMap<&'a str, &'a PartitionConfig>,
            visiting: &mut HashSet<&'a str>,
            done: &mut HashSet<&'a str>,
            ordered: &mut Vec<&'a PartitionConfig>,
        ) -> Result<()> {
            if done.contains(name) {
                return Ok(());
            }
            if !visiting.insert(name) {
                return Err(ReplicoreError::config(format!("partition {name} contains itself")));
            }
            let Some(&partition) = by_name.get(name) else {
                return Err(ReplicoreError::config(format!("unknown partition {name}")));
            };
            for child in &partition.subpartitions {
                visit(child, by_name, visiting, done, ordered)?;
            }
            visiting.remove(name);
            done.insert(name);
            ordered.push(partition);
            Ok(())
        }
        for partition in &self.partitions {
            visit(&partition.name, &by_name, &mut visiting, &mut done, &mut ordered)?;
        }
        Ok(ordered)
    }

    /// Create the configured partitions in `inventory`, children first, and
    /// install static quotas. Returns ids in creation order.
    pub fn install_partitions(&self, inventory: &mut Inventory, registry: &VariableRegistry) -> Result<Vec<PartitionId>> {
        let mut created = Vec::with_capacity(self.partitions.len());
        for partition in self.partition_order()? {
            let kind = match &partition.condition {
                Some(rule) => PartitionKind::Leaf(Some(Arc::new(Condition::compile(rule, registry)?))),
                None => {
                    let children = partition
                        .subpartitions
                        .iter()
                        .map(|child| {
                            inventory
                                .find_partition(child)
                                .ok_or_else(|| ReplicoreError::config(format!("unknown partition {child}")))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    PartitionKind::Super(children)
                }
            };
            created.push(inventory.add_partition(partition.name.clone(), kind)?);
        }
        self.apply_quotas(inventory)?;
        Ok(created)
    }

    /// Install the static quotas into existing site partitions.
    pub fn apply_quotas(&self, inventory: &mut Inventory) -> Result<()> {
        install_quotas(inventory, &self.quotas)
    }
}

/// Supplies the quota installed into each site partition.
pub trait QuotaSource {
    fn quotas(&self) -> Result<Vec<QuotaConfig>>;
}

impl QuotaSource for Config {
    fn quotas(&self) -> Result<Vec<QuotaConfig>> {
        Ok(self.quotas.clone())
    }
}

/// Write `quotas` into the inventory.
///
/// Wildcard entries apply first so a per-site entry overrides them. Entries
/// naming a site the inventory does not know yet are skipped. Every entry is
/// checked before any is written, so a rejected set leaves quotas untouched.
pub fn install_quotas(inventory: &mut Inventory, quotas: &[QuotaConfig]) -> Result<()> {
    let (wildcards, specific): (Vec<&QuotaConfig>, Vec<&QuotaConfig>) =
        quotas.iter().partition(|quota| quota.site == "*");
    let mut resolved = Vec::with_capacity(quotas.len());
    for quota in wildcards.into_iter().chain(specific) {
        let partition = inventory
            .find_partition(&quota.partition)
            .ok_or_else(|| ReplicoreError::config(format!("unknown partition {}", quota.partition)))?;
        let bytes = quota.quota.bytes()?;
        inventory
            .check_quota(partition, bytes)
            .map_err(|err| ReplicoreError::config(format!("quota for {} at {}: {err}", quota.partition, quota.site)))?;
        resolved.push((quota, partition, bytes));
    }
    for (quota, partition, bytes) in resolved {
        let sites: Vec<_> = if quota.site == "*" {
            inventory.sites().map(|(id, _)| id).collect()
        } else {
            match inventory.find_site(&quota.site) {
                Some(site) => vec![site],
                None => {
                    debug!(site = %quota.site, "quota for unknown site ignored");
                    Vec::new()
                }
            }
        };
        for site in sites {
            inventory.set_quota(site, partition, bytes)?;
        }
    }
    Ok(())
}

impl RetentionConfig {
    /// Compile the policy stack and candidate order.
    pub fn compile(&self, registry: &VariableRegistry) -> Result<(PolicyStack, CandidateOrder)> {
        let mut names = HashSet::new();
        let mut stack = PolicyStack::new(self.name.clone()).with_default(self.default_decision);
        for policy in &self.policies {
            if !names.insert(policy.name.as_str()) {
                return Err(ReplicoreError::config(format!("policy {} defined twice", policy.name)));
            }
            let condition = Condition::compile(&policy.condition, registry)?;
            if self.partition.is_none() && condition.needs_partition() {
                return Err(ReplicoreError::config(format!(
                    "policy {} reads site quota or occupancy but retention names no partition",
                    policy.name
                )));
            }
            stack.push(Policy::new(policy.name.clone(), condition, policy.decision, policy.reason.clone()));
        }
        let order = CandidateOrder::compile(&self.order, registry)?;
        if self.partition.is_none() && order.needs_partition() {
            return Err(ReplicoreError::config(
                "retention order reads site quota or occupancy but retention names no partition",
            ));
        }
        Ok((stack, order))
    }
}

impl PlacementConfig {
    fn validate(&self) -> Result<()> {
        if !self.occupancy_ceiling.is_finite() || self.occupancy_ceiling <= 0.0 {
            return Err(ReplicoreError::config(format!(
                "occupancy_ceiling must be positive, got {}",
                self.occupancy_ceiling
            )));
        }
        let priorities: Vec<u32> = self.producers.iter().map(|p| p.priority).collect();
        selection_weights(&priorities)?;
        let mut names = HashSet::new();
        for producer in &self.producers {
            if !names.insert(producer.name.as_str()) {
                return Err(ReplicoreError::config(format!("producer {} configured twice", producer.name)));
            }
        }
        Ok(())
    }

    /// Register the configured producers, picking them by name from
    /// `available`. Unconfigured producers are dropped.
    pub fn build_aggregator(&self, available: Vec<Box<dyn RequestProducer>>) -> Result<RequestAggregator> {
        let mut by_name: HashMap<String, Box<dyn RequestProducer>> = available
            .into_iter()
            .map(|producer| (producer.name().to_owned(), producer))
            .collect();
        let mut aggregator = RequestAggregator::new();
        for configured in &self.producers {
            let producer = by_name
                .remove(&configured.name)
                .ok_or_else(|| ReplicoreError::config(format!("no request producer named {}", configured.name)))?;
            aggregator.register(producer, configured.priority)?;
        }
        for unused in by_name.keys() {
            debug!(producer = %unused, "request producer not configured");
        }
        Ok(aggregator)
    }
}

#[cfg(test)]
mod tests {
    use replicore_types::Site;

    use super::*;

    const FULL: &str = r#"
[[partitions]]
name = "AnalysisOps"
condition = "blockreplica.owner == AnalysisOps"

[[partitions]]
name = "DataOps"
condition = "blockreplica.owner == DataOps"

[[partitions]]
name = "Physics"
subpartitions = ["AnalysisOps", "DataOps"]

[[quotas]]
site = "*"
partition = "AnalysisOps"
quota = "300 TB"

[[quotas]]
site = "T2_US_MIT"
partition = "AnalysisOps"
quota = 5000

[[quotas]]
site = "*"
partition = "DataOps"
quota = 100

[retention]
name = "analysis"
partition = "AnalysisOps"
order = ["increasing replica.last_block_created", "decreasing dataset.size"]

[[retention.policies]]
name = "protect_incomplete"
condition = "not replica.is_complete"
decision = "protect"
reason = "transfer in progress"

[[retention.policies]]
name = "delete_old"
condition = "replica.last_block_created older_than 365 days ago"
decision = "delete"

[placement]
partition = "AnalysisOps"
occupancy_ceiling = 0.9

[[placement.producers]]
name = "popularity"
priority = 1

[[placement.producers]]
name = "requests"
priority = 2

[snapshot]
workers = 8
"#;

    #[test]
    fn test_full_config_loads() {
        let config = Config::from_toml_str(FULL).unwrap();
        assert_eq!(config.partitions.len(), 3);
        assert_eq!(config.snapshot.workers, 8);
        assert_eq!(config.snapshot.max_staleness_secs, 86_400);
        assert_eq!(config.snapshot.retries, 3);
        let retention = config.retention.as_ref().unwrap();
        assert_eq!(retention.default_decision, Decision::Neutral);
        let (stack, order) = retention.compile(&VariableRegistry::standard()).unwrap();
        assert_eq!(stack.policies().len(), 2);
        assert_eq!(order.keys().len(), 2);
        assert_eq!(config.placement.as_ref().unwrap().occupancy_ceiling, 0.9);
    }

    #[test]
    fn test_install_partitions_children_first() {
        let config = Config::from_toml_str(FULL).unwrap();
        let mut inventory = Inventory::new();
        let mit = inventory.add_site(Site::new("T2_US_MIT")).unwrap();
        let desy = inventory.add_site(Site::new("T2_DE_DESY")).unwrap();
        let created = config
            .install_partitions(&mut inventory, &VariableRegistry::standard())
            .unwrap();
        assert_eq!(created.len(), 3);
        let physics = inventory.find_partition("Physics").unwrap();
        let analysis = inventory.find_partition("AnalysisOps").unwrap();
        assert_eq!(inventory.require_partition(analysis).unwrap().parent(), Some(physics));
        assert_eq!(inventory.quota(mit, analysis).unwrap(), 5000);
        assert_eq!(inventory.quota(desy, analysis).unwrap(), 300_000_000_000_000);
        assert_eq!(inventory.quota(mit, physics).unwrap(), 5100);
    }

    #[test]
    fn test_rejects_bad_configs() {
        let cases = [
            ("[[partitions]]\nname = \"A\"\n", "needs a condition"),
            (
                "[[partitions]]\nname = \"A\"\ncondition = \"dataset.nope == 1\"\n",
                "unknown variable",
            ),
            (
                "[[partitions]]\nname = \"A\"\nsubpartitions = [\"B\"]\n[[partitions]]\nname = \"B\"\nsubpartitions = [\"A\"]\n",
                "contains itself",
            ),
            (
                "[[partitions]]\nname = \"A\"\nsubpartitions = [\"Z\"]\n",
                "unknown subpartition",
            ),
            (
                "[retention]\norder = [\"increasing dataset.name\"]\n",
                "expected numeric or time",
            ),
            (
                "[placement]\n[[placement.producers]]\nname = \"a\"\npriority = 0\n[[placement.producers]]\nname = \"b\"\npriority = 1\n",
                "mix zero and non-zero",
            ),
            ("[snapshot]\nworkers = 0\n", "at least 1"),
            ("[snapshot]\nthreads = 2\n", "invalid configuration"),
            (
                "[[quotas]]\nsite = \"*\"\npartition = \"Nowhere\"\nquota = 1\n",
                "unknown partition",
            ),
            (
                "[[partitions]]\nname = \"Full\"\ncondition = \"site.occupancy < 0.9\"\n",
                "cannot read site quota or occupancy",
            ),
            (
                "[[retention.policies]]\nname = \"p\"\ncondition = \"site.quota > 0\"\ndecision = \"delete\"\n",
                "retention names no partition",
            ),
            (
                "[retention]\norder = [\"decreasing site.occupancy\"]\n",
                "retention names no partition",
            ),
        ];
        for (text, needle) in cases {
            let err = Config::from_toml_str(text).unwrap_err();
            assert!(err.to_string().contains(needle), "{text:?}: {err}");
        }
    }

    const NESTED: &str = r#"
[[partitions]]
name = "A"
condition = "blockreplica.owner == A"

[[partitions]]
name = "B"
condition = "blockreplica.owner == B"

[[partitions]]
name = "Both"
subpartitions = ["A", "B"]

[[partitions]]
name = "Loose"
condition = "blockreplica.owner == Loose"
"#;

    #[test]
    fn test_quota_structure_checked() {
        let with_quota = |partition: &str, quota: &str| {
            format!("{NESTED}\n[[quotas]]\nsite = \"*\"\npartition = \"{partition}\"\nquota = {quota}\n")
        };
        let err = Config::from_toml_str(&with_quota("Both", "100")).unwrap_err();
        assert!(err.to_string().contains("is a superpartition"), "{err}");
        let err = Config::from_toml_str(&with_quota("A", "\"unlimited\"")).unwrap_err();
        assert!(err.to_string().contains("cannot have an unlimited quota"), "{err}");
        let err = Config::from_toml_str(&with_quota("B", "-5")).unwrap_err();
        assert!(err.to_string().contains("cannot have an unlimited quota"), "{err}");
        assert!(Config::from_toml_str(&with_quota("Loose", "\"unlimited\"")).is_ok());
        assert!(Config::from_toml_str(&with_quota("A", "\"2 TB\"")).is_ok());
    }

    #[test]
    fn test_rejected_quota_set_leaves_quotas_untouched() {
        let config = Config::from_toml_str(NESTED).unwrap();
        let mut inventory = Inventory::new();
        let site = inventory.add_site(Site::new("T2_US_MIT")).unwrap();
        config
            .install_partitions(&mut inventory, &VariableRegistry::standard())
            .unwrap();
        let a = inventory.find_partition("A").unwrap();
        inventory.set_quota(site, a, 10).unwrap();

        let quota = |partition: &str, bytes: i64| QuotaConfig {
            site: "*".to_owned(),
            partition: partition.to_owned(),
            quota: QuotaAmount::Bytes(bytes),
        };
        let err = install_quotas(&mut inventory, &[quota("A", 99), quota("Both", 500)]).unwrap_err();
        assert!(matches!(err, ReplicoreError::Config(_)), "{err}");
        assert_eq!(inventory.quota(site, a).unwrap(), 10);
        assert!(install_quotas(&mut inventory, &[quota("A", 99), quota("B", -1)]).is_err());
        assert_eq!(inventory.quota(site, a).unwrap(), 10);
        install_quotas(&mut inventory, &[quota("A", 99)]).unwrap();
        assert_eq!(inventory.quota(site, a).unwrap(), 99);
    }

    #[test]
    fn test_bound_occupancy_rules_load() {
        let text = format!(
            "{NESTED}\n[retention]\npartition = \"A\"\norder = [\"decreasing site.occupancy\"]\n\n\
             [[retention.policies]]\nname = \"trim\"\ncondition = \"site.occupancy > 0.9\"\ndecision = \"delete\"\n"
        );
        let config = Config::from_toml_str(&text).unwrap();
        let (stack, order) = config
            .retention
            .unwrap()
            .compile(&VariableRegistry::standard())
            .unwrap();
        assert_eq!(stack.policies().len(), 1);
        assert!(order.needs_partition());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replicore.toml");
        std::fs::write(&path, FULL).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.quotas.len(), 3);
        assert!(Config::load(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_quota_amounts() {
        assert_eq!(QuotaAmount::Bytes(12).bytes().unwrap(), 12);
        assert_eq!(QuotaAmount::Text("unlimited".into()).bytes().unwrap(), -1);
        assert_eq!(QuotaAmount::Text("1.5 GB".into()).bytes().unwrap(), 1_500_000_000);
        assert!(QuotaAmount::Text("lots".into()).bytes().is_err());
    }
}

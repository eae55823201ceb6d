//! Policy stacks and retention decisions.
//!
//! Precedence across a stack is a contract of stack position:
//!
//! 1. The first matching PROTECT wins and stops evaluation.
//! 2. Otherwise the first matching KEEP in stack order wins, whether a DELETE
//!    matched before or after it.
//! 3. Otherwise the first matching DELETE in stack order wins.
//! 4. Otherwise the stack's default decision applies (normally NEUTRAL).

use std::fmt;
use std::str::FromStr;

use replicore_error::{ReplicoreError, Result};
use replicore_rules::{Condition, EvalContext, Subject};
use replicore_types::{DatasetReplicaId, Inventory, PartitionId};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Outcome of a policy or a whole stack for one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Protect,
    Keep,
    Delete,
    #[default]
    Neutral,
}

impl Decision {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Protect => "protect",
            Self::Keep => "keep",
            Self::Delete => "delete",
            Self::Neutral => "neutral",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

impl FromStr for Decision {
    type Err = ReplicoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "protect" => Ok(Self::Protect),
            "keep" => Ok(Self::Keep),
            "delete" => Ok(Self::Delete),
            "neutral" => Ok(Self::Neutral),
            other => Err(ReplicoreError::config(format!("unknown decision {other:?}"))),
        }
    }
}

/// A named rule with the decision it yields on match.
#[derive(Debug, Clone)]
pub struct Policy {
    name: String,
    condition: Condition,
    decision: Decision,
    reason: String,
}

impl Policy {
    #[must_use]
    pub fn new(name: impl Into<String>, condition: Condition, decision: Decision, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            condition,
            decision,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn condition(&self) -> &Condition {
        &self.condition
    }

    #[must_use]
    pub const fn decision(&self) -> Decision {
        self.decision
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Decision for one dataset replica, handed to the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub replica: DatasetReplicaId,
    /// `<dataset>@<site>`.
    pub label: String,
    pub decision: Decision,
    /// Name of the deciding policy; `None` when the default applied.
    pub policy: Option<String>,
    pub reason: String,
}

/// An ordered, named list of policies.
#[derive(Debug, Clone)]
pub struct PolicyStack {
    name: String,
    policies: Vec<Policy>,
    default_decision: Decision,
}

impl PolicyStack {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policies: Vec::new(),
            default_decision: Decision::Neutral,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policies.push(policy);
        self
    }

    #[must_use]
    pub const fn with_default(mut self, decision: Decision) -> Self {
        self.default_decision = decision;
        self
    }

    pub fn push(&mut self, policy: Policy) {
        self.policies.push(policy);
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    #[must_use]
    pub const fn default_decision(&self) -> Decision {
        self.default_decision
    }

    /// Bind every policy's quota-relative variables to the target partition.
    pub fn rebind_partition(&mut self, partition: PartitionId) {
        for policy in &mut self.policies {
            policy.condition.rebind_partition(partition);
        }
    }

    /// Evaluate the stack against a dataset replica.
    pub fn evaluate(&self, ctx: &EvalContext<'_>, replica: DatasetReplicaId) -> Result<DecisionRecord> {
        self.resolve(ctx.inventory, replica, |_, policy| {
            policy.condition.matches(ctx, Subject::DatasetReplica(replica))
        })
    }

    /// Apply the precedence rules given a per-policy match oracle.
    pub(crate) fn resolve(
        &self,
        inventory: &Inventory,
        replica: DatasetReplicaId,
        mut matched: impl FnMut(usize, &Policy) -> Result<bool>,
    ) -> Result<DecisionRecord> {
        let mut keep = None;
        let mut delete = None;
        for (index, policy) in self.policies.iter().enumerate() {
            // A matching NEUTRAL cannot change the outcome.
            if policy.decision == Decision::Neutral {
                continue;
            }
            if !matched(index, policy)? {
                continue;
            }
            trace!(policy = %policy.name, decision = %policy.decision, "policy matched");
            match policy.decision {
                Decision::Protect => return Ok(self.record(inventory, replica, Some(policy))),
                Decision::Keep => {
                    keep.get_or_insert(policy);
                }
                Decision::Delete => {
                    delete.get_or_insert(policy);
                }
                Decision::Neutral => {}
            }
        }
        Ok(self.record(inventory, replica, keep.or(delete)))
    }

    fn record(&self, inventory: &Inventory, replica: DatasetReplicaId, policy: Option<&Policy>) -> DecisionRecord {
        let label = inventory.replica_label(replica);
        match policy {
            Some(policy) => DecisionRecord {
                replica,
                label,
                decision: policy.decision,
                policy: Some(policy.name.clone()),
                reason: policy.reason.clone(),
            },
            None => DecisionRecord {
                replica,
                label,
                decision: self.default_decision,
                policy: None,
                reason: String::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use replicore_rules::VariableRegistry;
    use replicore_types::{
        Block, BlockName, BlockReplica, Dataset, DetachedDatasetReplica, GroupId, Site,
    };

    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn replica(custodial: bool, complete: bool) -> (Inventory, DatasetReplicaId) {
        let mut inventory = Inventory::new();
        let site = inventory.add_site(Site::new("T1_US_FNAL_Disk")).unwrap();
        let dataset = inventory.add_dataset(Dataset::new("/Old/Data/RAW")).unwrap();
        let block = inventory
            .add_block(Block::new(BlockName::from_bytes([7; 16]), dataset))
            .unwrap();
        inventory.mark_blocks_loaded(dataset).unwrap();
        let mut detached = DetachedDatasetReplica::new(dataset, site)
            .with_block_replicas(vec![BlockReplica::new(block, site, GroupId::NULL, 1)]);
        detached.is_custodial = custodial;
        detached.is_complete = complete;
        detached.last_block_created = NOW - 400 * 86_400;
        let id = inventory.link_dataset_replica(detached).unwrap();
        (inventory, id)
    }

    fn policy(name: &str, rule: &str, decision: Decision) -> Policy {
        let condition = Condition::compile(rule, &VariableRegistry::standard()).unwrap();
        Policy::new(name, condition, decision, format!("{name} matched"))
    }

    fn protect_incomplete() -> Policy {
        policy("protect_incomplete", "not replica.is_complete", Decision::Protect)
    }

    fn keep_custodial() -> Policy {
        policy("keep_custodial", "replica.is_custodial", Decision::Keep)
    }

    fn delete_old() -> Policy {
        policy(
            "delete_old",
            "replica.last_block_created older_than 365 days ago",
            Decision::Delete,
        )
    }

    fn decide(stack: &PolicyStack, inventory: &Inventory, id: DatasetReplicaId) -> DecisionRecord {
        stack.evaluate(&EvalContext::new(inventory, NOW), id).unwrap()
    }

    #[test]
    fn test_only_delete_matches() {
        let (inventory, id) = replica(false, true);
        let stack = PolicyStack::new("retention")
            .with_policy(protect_incomplete())
            .with_policy(keep_custodial())
            .with_policy(delete_old());
        let record = decide(&stack, &inventory, id);
        assert_eq!(record.decision, Decision::Delete);
        assert_eq!(record.policy.as_deref(), Some("delete_old"));
        assert_eq!(record.reason, "delete_old matched");
        assert_eq!(record.label, "/Old/Data/RAW@T1_US_FNAL_Disk");
    }

    #[test]
    fn test_keep_beats_delete_in_either_order() {
        let (inventory, id) = replica(true, true);
        let forward = PolicyStack::new("a")
            .with_policy(protect_incomplete())
            .with_policy(keep_custodial())
            .with_policy(delete_old());
        let reversed = PolicyStack::new("b")
            .with_policy(protect_incomplete())
            .with_policy(delete_old())
            .with_policy(keep_custodial());
        for stack in [&forward, &reversed] {
            let record = decide(stack, &inventory, id);
            assert_eq!(record.decision, Decision::Keep);
            assert_eq!(record.policy.as_deref(), Some("keep_custodial"));
        }
    }

    #[test]
    fn test_protect_short_circuits() {
        let (inventory, id) = replica(true, false);
        let stack = PolicyStack::new("retention")
            .with_policy(delete_old())
            .with_policy(keep_custodial())
            .with_policy(protect_incomplete());
        let record = decide(&stack, &inventory, id);
        assert_eq!(record.decision, Decision::Protect);
        assert_eq!(record.policy.as_deref(), Some("protect_incomplete"));
    }

    #[test]
    fn test_first_delete_and_default() {
        let (inventory, id) = replica(false, true);
        let stack = PolicyStack::new("retention")
            .with_policy(policy("first", "dataset.name == /Old/*", Decision::Delete))
            .with_policy(policy("second", "replica.num_blocks == 1", Decision::Delete));
        assert_eq!(decide(&stack, &inventory, id).policy.as_deref(), Some("first"));

        let nothing = PolicyStack::new("empty").with_policy(keep_custodial());
        let record = decide(&nothing, &inventory, id);
        assert_eq!(record.decision, Decision::Neutral);
        assert_eq!(record.policy, None);
        assert!(record.reason.is_empty());

        let keep_by_default = PolicyStack::new("empty").with_default(Decision::Keep);
        assert_eq!(decide(&keep_by_default, &inventory, id).decision, Decision::Keep);
    }

    #[test]
    fn test_decision_parsing() {
        assert_eq!("PROTECT".parse::<Decision>().unwrap(), Decision::Protect);
        assert_eq!(Decision::Delete.to_string(), "DELETE");
        assert!("evict".parse::<Decision>().is_err());
        let json = serde_json::to_string(&Decision::Keep).unwrap();
        assert_eq!(json, "\"keep\"");
    }
}

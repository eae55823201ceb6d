//! Per-cycle memoisation of policy outcomes.

use hashbrown::HashMap;
use replicore_error::Result;
use replicore_rules::{EvalContext, Subject};
use replicore_types::{DatasetReplicaId, Inventory};

use crate::decision::{DecisionRecord, PolicyStack};

/// Evaluates a [`PolicyStack`] for one decision cycle.
///
/// Policies whose condition reads no demand attribute are evaluated at most
/// once per replica for the cycle. Demand-dependent policies are cached
/// against the inventory's demand epoch and re-evaluated once it moves.
#[derive(Debug)]
pub struct DecisionCycle<'s> {
    stack: &'s PolicyStack,
    now: i64,
    fixed: HashMap<(usize, DatasetReplicaId), bool>,
    demand: HashMap<(usize, DatasetReplicaId), (u64, bool)>,
    evaluations: u64,
}

impl<'s> DecisionCycle<'s> {
    #[must_use]
    pub fn new(stack: &'s PolicyStack, now: i64) -> Self {
        Self {
            stack,
            now,
            fixed: HashMap::new(),
            demand: HashMap::new(),
            evaluations: 0,
        }
    }

    #[must_use]
    pub const fn stack(&self) -> &'s PolicyStack {
        self.stack
    }

    #[must_use]
    pub const fn now(&self) -> i64 {
        self.now
    }

    /// Number of condition evaluations performed, cache hits excluded.
    #[must_use]
    pub const fn evaluations(&self) -> u64 {
        self.evaluations
    }

    /// Decide one replica, reusing cached policy outcomes where valid.
    pub fn decide(&mut self, inventory: &Inventory, replica: DatasetReplicaId) -> Result<DecisionRecord> {
        let ctx = EvalContext::new(inventory, self.now);
        let epoch = inventory.demand_epoch();
        let Self {
            stack,
            fixed,
            demand,
            evaluations,
            ..
        } = self;
        stack.resolve(inventory, replica, |index, policy| {
            let condition = policy.condition();
            let key = (index, replica);
            if condition.is_static() {
                if let Some(hit) = fixed.get(&key) {
                    return Ok(*hit);
                }
                *evaluations += 1;
                let matched = condition.matches(&ctx, Subject::DatasetReplica(replica))?;
                fixed.insert(key, matched);
                Ok(matched)
            } else {
                if let Some(&(_, hit)) = demand.get(&key).filter(|(seen, _)| *seen == epoch) {
                    return Ok(hit);
                }
                *evaluations += 1;
                let matched = condition.matches(&ctx, Subject::DatasetReplica(replica))?;
                demand.insert(key, (epoch, matched));
                Ok(matched)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use replicore_rules::{Condition, REQUEST_WEIGHT_ATTR, VariableRegistry};
    use replicore_types::{AttrValue, Dataset, DetachedDatasetReplica, Site};

    use super::*;
    use crate::decision::{Decision, Policy};

    fn world() -> (Inventory, DatasetReplicaId) {
        let mut inventory = Inventory::new();
        let site = inventory.add_site(Site::new("T2_DE_DESY")).unwrap();
        let dataset = inventory.add_dataset(Dataset::new("/Hot/Data/AOD")).unwrap();
        inventory.mark_blocks_loaded(dataset).unwrap();
        let mut detached = DetachedDatasetReplica::new(dataset, site);
        detached.is_custodial = true;
        let id = inventory.link_dataset_replica(detached).unwrap();
        (inventory, id)
    }

    fn stack() -> PolicyStack {
        let registry = VariableRegistry::standard();
        PolicyStack::new("retention")
            .with_policy(Policy::new(
                "keep_requested",
                Condition::compile("dataset.request_weight > 10", &registry).unwrap(),
                Decision::Keep,
                "pending requests",
            ))
            .with_policy(Policy::new(
                "delete_custodial_copies",
                Condition::compile("replica.is_custodial", &registry).unwrap(),
                Decision::Delete,
                "custodial copy elsewhere",
            ))
    }

    #[test]
    fn test_static_outcomes_evaluated_once() {
        let (inventory, id) = world();
        let stack = stack();
        let mut cycle = DecisionCycle::new(&stack, 0);
        let first = cycle.decide(&inventory, id).unwrap();
        assert_eq!(first.decision, Decision::Delete);
        assert_eq!(cycle.evaluations(), 2);
        let again = cycle.decide(&inventory, id).unwrap();
        assert_eq!(again, first);
        assert_eq!(cycle.evaluations(), 2);
    }

    #[test]
    fn test_demand_change_reevaluates_dynamic_policies() {
        let (mut inventory, id) = world();
        let dataset = inventory.require_dataset_replica(id).unwrap().dataset();
        let stack = stack();
        let mut cycle = DecisionCycle::new(&stack, 0);
        assert_eq!(cycle.decide(&inventory, id).unwrap().decision, Decision::Delete);

        inventory
            .set_dataset_attr(dataset, REQUEST_WEIGHT_ATTR, AttrValue::Number(25.0))
            .unwrap();
        let record = cycle.decide(&inventory, id).unwrap();
        assert_eq!(record.decision, Decision::Keep);
        assert_eq!(record.policy.as_deref(), Some("keep_requested"));
        // Only the demand-dependent policy ran again.
        assert_eq!(cycle.evaluations(), 3);
    }

    #[test]
    fn test_unlinked_replica_is_object_error() {
        let (mut inventory, id) = world();
        let detached = inventory.unlink_dataset_replica(id).unwrap();
        let relinked = inventory.link_dataset_replica(detached).unwrap();
        assert_ne!(relinked, id);
        let stack = stack();
        let mut cycle = DecisionCycle::new(&stack, 0);
        let err = cycle.decide(&inventory, id).unwrap_err();
        assert!(err.is_object_error(), "{err}");
        assert_eq!(cycle.decide(&inventory, relinked).unwrap().replica, relinked);
    }
}

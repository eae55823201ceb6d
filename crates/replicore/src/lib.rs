//! Replica placement and retention.
//!
//! This crate re-exports the workspace under one name. The building blocks:
//!
//! - [`types`]: the replica inventory, partitions and quotas.
//! - [`rules`]: the condition language over inventory variables.
//! - [`policy`]: policy stacks, candidate ordering and request merging.
//! - [`core`](mod@core): configuration, catalog refresh and the cycle engine.
//!
//! ```ignore
//! use replicore::{CancelToken, Config, Engine, MemorySink, VariableRegistry};
//!
//! let config = Config::load("replicore.toml".as_ref())?;
//! let mut engine = Engine::new(config, &VariableRegistry::standard(), producers)?;
//! engine.refresh(&feed, now)?;
//! let report = engine.run_retention(now, &CancelToken::new(), &mut MemorySink::default())?;
//! ```

pub use replicore_core as core;
pub use replicore_error as error;
pub use replicore_policy as policy;
pub use replicore_rules as rules;
pub use replicore_types as types;

pub use replicore_core::{
    CancelToken, CatalogFeed, Config, DecisionSink, Engine, JsonLinesSink, MemorySink, PlacementSink,
    QuotaSource, RefreshReport, ReplicaUpdate, RetentionReport,
};
pub use replicore_error::{ReplicoreError, Result};
pub use replicore_policy::{
    Decision, DecisionRecord, PlacementRequest, Policy, PolicyStack, RequestItem, RequestProducer,
};
pub use replicore_rules::{Condition, EvalContext, Subject, VariableRegistry};
pub use replicore_types::{BlockName, Inventory};

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::policy::{RequestStream, merge_weighted};

    fn stream(name: &str, priority: u32, items: &[&str]) -> RequestStream {
        RequestStream {
            name: name.to_owned(),
            priority,
            requests: items
                .iter()
                .map(|item| PlacementRequest::new(RequestItem::Dataset((*item).to_owned()), "T2_US_MIT"))
                .collect(),
        }
    }

    #[test]
    fn test_reexports_compose() {
        let registry = VariableRegistry::standard();
        let stack = PolicyStack::new("facade").with_policy(Policy::new(
            "delete_all",
            Condition::compile("dataset.name == /*", &registry).unwrap(),
            Decision::Delete,
            "everything",
        ));
        assert_eq!(stack.policies().len(), 1);
        assert_eq!(stack.default_decision(), Decision::Neutral);

        let config = Config::from_toml_str("").unwrap();
        assert!(config.retention.is_none());
    }

    #[test]
    fn test_merge_is_deterministic_for_a_seed() {
        let run = |seed| {
            let merged = merge_weighted(
                vec![stream("a", 1, &["/A", "/B", "/C"]), stream("b", 3, &["/X", "/Y"])],
                &mut StdRng::seed_from_u64(seed),
            )
            .unwrap();
            merged.into_iter().map(|r| r.item.to_string()).collect::<Vec<_>>()
        };
        assert_eq!(run(11), run(11));
        assert_eq!(run(11).len(), 5);
    }
}

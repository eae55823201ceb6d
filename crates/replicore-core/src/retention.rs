//! Retention cycles.
//!
//! A cycle decides every dataset replica in scope against one consistent
//! inventory snapshot and hands the full decision set to a sink in a single
//! commit. A cancelled cycle commits nothing.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use replicore_error::{ReplicoreError, Result};
use replicore_policy::{CandidateOrder, Decision, DecisionCycle, DecisionRecord, PolicyStack};
use replicore_rules::{EvalContext, VariableRegistry};
use replicore_types::{DatasetReplicaId, Inventory, PartitionId};
use tracing::{debug, error, info, info_span, warn};

use crate::config::RetentionConfig;

/// Cooperative, cycle-granular cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(ReplicoreError::Cancelled);
        }
        Ok(())
    }
}

/// Receives the decision set of a completed cycle.
pub trait DecisionSink {
    fn commit(&mut self, stack: &str, records: &[DecisionRecord]) -> Result<()>;
}

/// Keeps committed decision sets in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub commits: Vec<Vec<DecisionRecord>>,
}

impl DecisionSink for MemorySink {
    fn commit(&mut self, _stack: &str, records: &[DecisionRecord]) -> Result<()> {
        self.commits.push(records.to_vec());
        Ok(())
    }
}

/// Writes one JSON object per decision.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub const fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> DecisionSink for JsonLinesSink<W> {
    fn commit(&mut self, stack: &str, records: &[DecisionRecord]) -> Result<()> {
        let io = |err: std::io::Error| ReplicoreError::feed(format!("decision sink for {stack}: {err}"));
        for record in records {
            let line = serde_json::to_string(record)
                .map_err(|err| ReplicoreError::feed(format!("cannot encode decision: {err}")))?;
            writeln!(self.out, "{line}").map_err(io)?;
        }
        self.out.flush().map_err(io)
    }
}

/// Outcome of one retention cycle.
#[derive(Debug, Default)]
pub struct RetentionReport {
    /// Every decision; DELETE records come last, in candidate order.
    pub records: Vec<DecisionRecord>,
    /// Replicas that could not be decided, with the reason.
    pub failures: Vec<(String, ReplicoreError)>,
    pub evaluations: u64,
}

impl RetentionReport {
    #[must_use]
    pub fn count(&self, decision: Decision) -> usize {
        self.records.iter().filter(|r| r.decision == decision).count()
    }

    pub fn deletion_candidates(&self) -> impl Iterator<Item = &DecisionRecord> + '_ {
        self.records.iter().filter(|r| r.decision == Decision::Delete)
    }
}

/// A compiled retention setup.
#[derive(Debug, Clone)]
pub struct RetentionCycle {
    stack: PolicyStack,
    order: CandidateOrder,
    partition: Option<PartitionId>,
}

impl RetentionCycle {
    #[must_use]
    pub const fn new(stack: PolicyStack, order: CandidateOrder) -> Self {
        Self {
            stack,
            order,
            partition: None,
        }
    }

    /// Compile from configuration, resolving the target partition in
    /// `inventory`.
    pub fn from_config(config: &RetentionConfig, inventory: &Inventory, registry: &VariableRegistry) -> Result<Self> {
        let (stack, order) = config.compile(registry)?;
        let mut cycle = Self::new(stack, order);
        if let Some(name) = &config.partition {
            let partition = inventory
                .find_partition(name)
                .ok_or_else(|| ReplicoreError::config(format!("unknown partition {name}")))?;
            cycle.restrict_to(partition);
        }
        Ok(cycle)
    }

    /// Evaluate only replicas in `partition`, and bind quota-relative
    /// variables to it.
    pub fn restrict_to(&mut self, partition: PartitionId) {
        self.partition = Some(partition);
        self.stack.rebind_partition(partition);
        self.order.rebind_partition(partition);
    }

    #[must_use]
    pub const fn stack(&self) -> &PolicyStack {
        &self.stack
    }

    /// Replicas in scope, in id order.
    fn scope(&self, inventory: &Inventory) -> Vec<DatasetReplicaId> {
        let mut replicas: Vec<DatasetReplicaId> = match self.partition {
            Some(partition) => inventory
                .sites()
                .filter_map(|(_, site)| site.site_partition(partition))
                .flat_map(|site_partition| site_partition.replicas().map(|(id, _)| id))
                .collect(),
            None => inventory.dataset_replicas().map(|(id, _)| id).collect(),
        };
        replicas.sort_unstable();
        replicas
    }

    /// Decide, order and commit. Nothing reaches `sink` unless the cycle
    /// finished.
    pub fn run(
        &self,
        inventory: &Inventory,
        now: i64,
        cancel: &CancelToken,
        sink: &mut dyn DecisionSink,
    ) -> Result<RetentionReport> {
        let span = info_span!("retention_cycle", stack = %self.stack.name(), now);
        let _guard = span.enter();

        let replicas = self.scope(inventory);
        info!(replicas = replicas.len(), "retention cycle started");

        let mut cycle = DecisionCycle::new(&self.stack, now);
        let mut kept = Vec::with_capacity(replicas.len());
        let mut deletes = Vec::new();
        let mut failures = Vec::new();
        for replica in replicas {
            if let Err(err) = cancel.checkpoint() {
                warn!("retention cycle cancelled, nothing committed");
                return Err(err);
            }
            match cycle.decide(inventory, replica) {
                Ok(record) if record.decision == Decision::Delete => deletes.push(record),
                Ok(record) => kept.push(record),
                Err(err) => {
                    let label = inventory.replica_label(replica);
                    debug!(replica = %label, error = %err, "replica not decided");
                    failures.push((label, err));
                }
            }
        }

        self.order.sort(&EvalContext::new(inventory, now), &mut deletes);
        let mut records = kept;
        records.append(&mut deletes);

        cancel.checkpoint()?;
        if let Err(err) = sink.commit(self.stack.name(), &records) {
            error!(error = %err, "decision commit failed");
            return Err(err);
        }

        let mut tally: HashMap<Decision, usize> = HashMap::new();
        for record in &records {
            *tally.entry(record.decision).or_default() += 1;
        }
        info!(
            protect = tally.get(&Decision::Protect).copied().unwrap_or(0),
            keep = tally.get(&Decision::Keep).copied().unwrap_or(0),
            delete = tally.get(&Decision::Delete).copied().unwrap_or(0),
            neutral = tally.get(&Decision::Neutral).copied().unwrap_or(0),
            failures = failures.len(),
            "retention cycle committed"
        );
        Ok(RetentionReport {
            records,
            failures,
            evaluations: cycle.evaluations(),
        })
    }
}

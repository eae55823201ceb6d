//! Ordering of deletion candidates.
//!
//! An order line reads `<direction> <variable>`, for example
//! `increasing replica.last_block_created`. Several lines form a
//! lexicographic key; replicas missing a key value sort after all others
//! for that key.

use std::cmp::Ordering;
use std::fmt;

use replicore_error::{ReplicoreError, Result};
use replicore_rules::{EvalContext, Resolved, Subject, Variable, VariableRegistry};
use replicore_types::{DatasetReplicaId, PartitionId};
use tracing::debug;

use crate::decision::DecisionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Increasing,
    Decreasing,
}

/// One component of a candidate order.
#[derive(Debug, Clone)]
pub struct SortKey {
    direction: Direction,
    variable: Variable,
    partition: Option<PartitionId>,
}

impl SortKey {
    /// Compile an order line. Only single-valued numeric and time variables
    /// can order replicas.
    pub fn compile(line: &str, registry: &VariableRegistry) -> Result<Self> {
        let mut words = line.split_whitespace();
        let (Some(direction), Some(name), None) = (words.next(), words.next(), words.next()) else {
            return Err(ReplicoreError::config(format!(
                "sort key {line:?} must read \"<increasing|decreasing> <variable>\""
            )));
        };
        let direction = match direction.to_ascii_lowercase().as_str() {
            "increasing" | "asc" => Direction::Increasing,
            "decreasing" | "desc" => Direction::Decreasing,
            other => {
                return Err(ReplicoreError::config(format!("unknown sort direction {other:?}")));
            }
        };
        let variable = registry.get(name)?.clone();
        if !variable.kind().is_orderable() {
            return Err(ReplicoreError::TypeMismatch {
                variable: name.to_owned(),
                expected: "numeric or time".to_owned(),
                found: variable.kind().to_string(),
            });
        }
        if variable.is_block_level() {
            return Err(ReplicoreError::config(format!(
                "block-level variable {name} has no single value per replica"
            )));
        }
        Ok(Self {
            direction,
            variable,
            partition: None,
        })
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub const fn variable(&self) -> &Variable {
        &self.variable
    }

    fn value(&self, ctx: &EvalContext<'_>, replica: DatasetReplicaId) -> Option<f64> {
        match self.variable.resolve(ctx, Subject::DatasetReplica(replica), self.partition) {
            Ok(Resolved::Scalar(value)) => value.as_f64(),
            Ok(_) => None,
            Err(err) => {
                debug!(variable = self.variable.name(), error = %err, "sort key unresolved");
                None
            }
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            Direction::Increasing => "increasing",
            Direction::Decreasing => "decreasing",
        };
        write!(f, "{direction} {}", self.variable.name())
    }
}

/// A lexicographic list of sort keys.
#[derive(Debug, Clone, Default)]
pub struct CandidateOrder {
    keys: Vec<SortKey>,
}

impl CandidateOrder {
    pub fn compile<S: AsRef<str>>(lines: &[S], registry: &VariableRegistry) -> Result<Self> {
        let keys = lines
            .iter()
            .map(|line| SortKey::compile(line.as_ref(), registry))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { keys })
    }

    #[must_use]
    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Some quota-relative key has no partition to read from.
    #[must_use]
    pub fn needs_partition(&self) -> bool {
        self.keys
            .iter()
            .any(|key| key.variable.is_partition_relative() && key.partition.is_none())
    }

    pub fn rebind_partition(&mut self, partition: PartitionId) {
        for key in &mut self.keys {
            if key.variable.is_partition_relative() {
                key.partition = Some(partition);
            }
        }
    }

    /// Stable sort of `records` by the keys. Equal keys keep input order.
    pub fn sort(&self, ctx: &EvalContext<'_>, records: &mut Vec<DecisionRecord>) {
        if self.keys.is_empty() {
            return;
        }
        let mut keyed: Vec<(Vec<Option<f64>>, DecisionRecord)> = records
            .drain(..)
            .map(|record| {
                let values = self.keys.iter().map(|key| key.value(ctx, record.replica)).collect();
                (values, record)
            })
            .collect();
        keyed.sort_by(|(a, _), (b, _)| self.compare(a, b));
        records.extend(keyed.into_iter().map(|(_, record)| record));
    }

    fn compare(&self, a: &[Option<f64>], b: &[Option<f64>]) -> Ordering {
        for ((key, a), b) in self.keys.iter().zip(a).zip(b) {
            let ordering = match (a, b) {
                (Some(a), Some(b)) => match key.direction {
                    Direction::Increasing => a.total_cmp(b),
                    Direction::Decreasing => b.total_cmp(a),
                },
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

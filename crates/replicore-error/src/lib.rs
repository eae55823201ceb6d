//! Error taxonomy for the replica inventory and decision engine.
//!
//! Every fallible operation in the workspace returns [`Result`]. Variants are
//! grouped into the categories returned by [`ReplicoreError::category`]:
//!
//! - **Integrity**: an invariant of the entity graph would be violated. Fatal
//!   to the triggering operation.
//! - **Object**: a referenced entity does not exist or is not loaded. Raised
//!   to the immediate caller, which decides whether to skip or abort.
//! - **Configuration**: malformed rule text, unknown variables, unorderable
//!   sort keys. Detected before any decision cycle runs.
//! - **Feed**: catalog collaborator failures and snapshot staleness.
//! - **Cycle**: a decision cycle was abandoned before commit.

use std::fmt;

use thiserror::Error;

/// Kind of entity named in an object error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Dataset,
    Block,
    Site,
    Group,
    DatasetReplica,
    BlockReplica,
    Partition,
    SitePartition,
}

impl ObjectKind {
    /// Stable label used in messages and log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dataset => "dataset",
            Self::Block => "block",
            Self::Site => "site",
            Self::Group => "group",
            Self::DatasetReplica => "dataset replica",
            Self::BlockReplica => "block replica",
            Self::Partition => "partition",
            Self::SitePartition => "site partition",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a [`ReplicoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Integrity,
    Object,
    Configuration,
    Feed,
    Cycle,
}

/// Primary error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicoreError {
    /// An entity-graph invariant would be violated.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// A referenced entity does not exist.
    #[error("no such {kind}: {name}")]
    NotFound { kind: ObjectKind, name: String },

    /// Block-level data was requested from a dataset whose blocks are not loaded.
    #[error("blocks of dataset {dataset} are not loaded")]
    BlocksNotLoaded { dataset: String },

    /// Generic configuration problem.
    #[error("configuration error: {0}")]
    Config(String),

    /// Rule text could not be parsed.
    #[error("syntax error in rule \"{rule}\" at offset {offset}: {message}")]
    RuleSyntax {
        rule: String,
        offset: usize,
        message: String,
    },

    /// A rule references a variable that is not registered.
    #[error("unknown variable: {name}")]
    UnknownVariable { name: String },

    /// A variable is used where its value kind is not acceptable.
    #[error("variable {variable} has kind {found}, expected {expected}")]
    TypeMismatch {
        variable: String,
        expected: String,
        found: String,
    },

    /// A catalog feed collaborator failed.
    #[error("catalog feed error: {0}")]
    Feed(String),

    /// The last good snapshot is older than the staleness threshold.
    #[error("inventory snapshot is {age_secs}s old (max {max_staleness_secs}s)")]
    StaleSnapshot {
        age_secs: u64,
        max_staleness_secs: u64,
    },

    /// The decision cycle was abandoned before commit.
    #[error("decision cycle cancelled")]
    Cancelled,
}

impl ReplicoreError {
    /// Build an integrity error.
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Build a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Build a not-found object error.
    pub fn not_found(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Build a feed error.
    pub fn feed(msg: impl Into<String>) -> Self {
        Self::Feed(msg.into())
    }

    /// Which part of the taxonomy this error belongs to.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Integrity(_) => ErrorCategory::Integrity,
            Self::NotFound { .. } | Self::BlocksNotLoaded { .. } => ErrorCategory::Object,
            Self::Config(_)
            | Self::RuleSyntax { .. }
            | Self::UnknownVariable { .. }
            | Self::TypeMismatch { .. } => ErrorCategory::Configuration,
            Self::Feed(_) | Self::StaleSnapshot { .. } => ErrorCategory::Feed,
            Self::Cancelled => ErrorCategory::Cycle,
        }
    }

    /// Object errors may be skipped per item inside a decision cycle.
    #[must_use]
    pub const fn is_object_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Object)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ReplicoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            ReplicoreError::integrity("x").category(),
            ErrorCategory::Integrity
        );
        assert_eq!(
            ReplicoreError::not_found(ObjectKind::Site, "T2_CH_CERN").category(),
            ErrorCategory::Object
        );
        assert_eq!(
            ReplicoreError::BlocksNotLoaded {
                dataset: "/A/B/C".to_owned()
            }
            .category(),
            ErrorCategory::Object
        );
        assert_eq!(
            ReplicoreError::UnknownVariable {
                name: "x.y".to_owned()
            }
            .category(),
            ErrorCategory::Configuration
        );
        assert_eq!(ReplicoreError::Cancelled.category(), ErrorCategory::Cycle);
        assert_eq!(
            ReplicoreError::StaleSnapshot {
                age_secs: 10,
                max_staleness_secs: 5
            }
            .category(),
            ErrorCategory::Feed
        );
    }

    #[test]
    fn test_display_messages() {
        let err = ReplicoreError::not_found(ObjectKind::DatasetReplica, "/A/B/C@T2_X");
        assert_eq!(err.to_string(), "no such dataset replica: /A/B/C@T2_X");

        let err = ReplicoreError::RuleSyntax {
            rule: "dataset.name ==".to_owned(),
            offset: 15,
            message: "missing right-hand side".to_owned(),
        };
        assert!(err.to_string().contains("offset 15"));
        assert!(!err.is_object_error());
    }
}

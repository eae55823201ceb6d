//! Rule language for selecting replicas.
//!
//! Rule text such as `dataset.name == /A/B/* and replica.last_block_created
//! older_than 90 days ago` is tokenized ([`lexer`]), resolved against a
//! [`VariableRegistry`] and compiled into a [`Condition`] that evaluates
//! against block replicas, dataset replicas, datasets, sites or site
//! partitions.

pub mod condition;
pub mod lexer;
pub mod value;
pub mod variables;

pub use condition::{CompareOp, Condition, Predicate};
pub use lexer::{Span, Token, TokenKind, tokenize};
pub use value::{TimeLiteral, Value, ValueKind};
pub use variables::{
    Attr, EvalContext, LOCKED_BLOCKS_ATTR, REQUEST_WEIGHT_ATTR, Resolved, Subject,
    USAGE_RANK_ATTR, Variable, VariableRegistry,
};

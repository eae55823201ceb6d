//! Retention decisions and placement request merging.
//!
//! A [`PolicyStack`] turns compiled conditions into one [`Decision`] per
//! dataset replica; [`DecisionCycle`] memoises policy outcomes for the
//! duration of a cycle; [`CandidateOrder`] ranks deletion candidates; and
//! [`RequestAggregator`] interleaves the output of placement producers.

pub mod aggregator;
pub mod cycle;
pub mod decision;
pub mod ordering;

pub use aggregator::{
    PlacementRequest, RequestAggregator, RequestItem, RequestProducer, RequestStream, merge_weighted,
    selection_weights,
};
pub use cycle::DecisionCycle;
pub use decision::{Decision, DecisionRecord, Policy, PolicyStack};
pub use ordering::{CandidateOrder, Direction, SortKey};

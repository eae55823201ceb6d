//! Demand-weighted merging of placement requests.
//!
//! Each registered producer proposes an ordered list of copy targets. The
//! merged stream repeatedly draws one producer with probability proportional
//! to `1 / priority` and takes the head of its list, so lower priority
//! numbers are served more often without starving the rest.

use std::collections::VecDeque;
use std::fmt;

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use replicore_error::{ReplicoreError, Result};
use replicore_types::{BlockName, Inventory};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// What a placement request asks to copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestItem {
    Dataset(String),
    Block { dataset: String, block: BlockName },
}

impl fmt::Display for RequestItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dataset(name) => f.write_str(name),
            Self::Block { dataset, block } => f.write_str(&block.full_name(dataset)),
        }
    }
}

/// A proposed copy of an item to a destination site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub item: RequestItem,
    pub destination: String,
    /// Name of the producer, stamped during merging.
    #[serde(default)]
    pub producer: String,
}

impl PlacementRequest {
    #[must_use]
    pub fn new(item: RequestItem, destination: impl Into<String>) -> Self {
        Self {
            item,
            destination: destination.into(),
            producer: String::new(),
        }
    }
}

/// A source of placement requests.
pub trait RequestProducer: Send {
    fn name(&self) -> &str;

    /// Proposed requests, most important first.
    fn requests(&mut self, inventory: &Inventory) -> Result<Vec<PlacementRequest>>;
}

/// Pending requests of one producer.
#[derive(Debug, Clone)]
pub struct RequestStream {
    pub name: String,
    pub priority: u32,
    pub requests: VecDeque<PlacementRequest>,
}

/// Relative selection weights for a set of priorities.
///
/// All-zero priorities weigh equally; a mix of zero and non-zero priorities
/// has no meaning and is rejected.
pub fn selection_weights(priorities: &[u32]) -> Result<Vec<f64>> {
    let zeros = priorities.iter().filter(|p| **p == 0).count();
    if zeros == priorities.len() {
        return Ok(vec![1.0; priorities.len()]);
    }
    if zeros > 0 {
        return Err(ReplicoreError::config(
            "request producers mix zero and non-zero priorities",
        ));
    }
    Ok(priorities.iter().map(|p| 1.0 / f64::from(*p)).collect())
}

/// Interleave `streams` by weighted random draws until all are exhausted.
pub fn merge_weighted<R: Rng + ?Sized>(mut streams: Vec<RequestStream>, rng: &mut R) -> Result<Vec<PlacementRequest>> {
    let priorities: Vec<u32> = streams.iter().map(|stream| stream.priority).collect();
    selection_weights(&priorities)?;
    streams.retain(|stream| !stream.requests.is_empty());
    let total = streams.iter().map(|stream| stream.requests.len()).sum();
    let mut merged = Vec::with_capacity(total);

    while !streams.is_empty() {
        let priorities: Vec<u32> = streams.iter().map(|stream| stream.priority).collect();
        let weights = selection_weights(&priorities)?;
        let index = WeightedIndex::new(&weights)
            .map_err(|err| ReplicoreError::config(format!("invalid producer weights: {err}")))?;
        let chosen = index.sample(rng);
        let stream = &mut streams[chosen];
        if let Some(mut request) = stream.requests.pop_front() {
            request.producer.clone_from(&stream.name);
            merged.push(request);
        }
        if stream.requests.is_empty() {
            debug!(producer = %stream.name, "producer exhausted");
            streams.swap_remove(chosen);
        }
    }
    Ok(merged)
}

struct Registered {
    producer: Box<dyn RequestProducer>,
    priority: u32,
}

/// Owns the registered producers and merges their output.
#[derive(Default)]
pub struct RequestAggregator {
    producers: Vec<Registered>,
}

impl fmt::Debug for RequestAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.producers.iter().map(|r| (r.producer.name(), r.priority)))
            .finish()
    }
}

impl RequestAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a producer. Fails if its priority would mix zero and non-zero
    /// priorities among the registered producers.
    pub fn register(&mut self, producer: Box<dyn RequestProducer>, priority: u32) -> Result<()> {
        let mut priorities: Vec<u32> = self.producers.iter().map(|r| r.priority).collect();
        priorities.push(priority);
        selection_weights(&priorities)?;
        info!(producer = producer.name(), priority, "request producer registered");
        self.producers.push(Registered { producer, priority });
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.producers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Collect every producer's requests and merge them.
    ///
    /// A failing producer contributes nothing this round; the others are
    /// still merged.
    pub fn run<R: Rng + ?Sized>(&mut self, inventory: &Inventory, rng: &mut R) -> Result<Vec<PlacementRequest>> {
        let mut streams = Vec::with_capacity(self.producers.len());
        for registered in &mut self.producers {
            let name = registered.producer.name().to_owned();
            match registered.producer.requests(inventory) {
                Ok(requests) => {
                    debug!(producer = %name, requests = requests.len(), "requests collected");
                    streams.push(RequestStream {
                        name,
                        priority: registered.priority,
                        requests: requests.into(),
                    });
                }
                Err(err) => warn!(producer = %name, error = %err, "request producer failed"),
            }
        }
        merge_weighted(streams, rng)
    }
}

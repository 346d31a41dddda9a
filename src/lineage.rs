//! Lineage Graph - producer/consumer index over recorded runs
//!
//! Edges always point from a consumer to a strictly earlier producer, so the
//! graph is acyclic by construction and run ids double as a topological
//! order. Traversals exploit this:
//!
//! - walking towards producers with a max-heap frontier yields ancestors in
//!   descending id order (consumer before producer) without buffering;
//! - walking towards consumers with a min-heap frontier yields descendants
//!   in ascending id order (producer before consumer) without buffering.
//!
//! Asking for the opposite order materializes the closure on first use.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

use dashmap::DashMap;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::run::RunId;
use crate::{Error, Result};

/// A consumer run read an artifact created by a producer run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineageEdge {
    /// Run that produced the artifact
    pub producer: RunId,
    /// Run that consumed it
    pub consumer: RunId,
    /// Artifact path relative to the storage root
    pub artifact: String,
}

impl LineageEdge {
    /// New edge.
    #[must_use]
    pub fn new(producer: RunId, consumer: RunId, artifact: impl Into<String>) -> Self {
        Self {
            producer,
            consumer,
            artifact: artifact.into(),
        }
    }
}

/// Order in which a traversal yields runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// Producers before consumers (ascending ids).
    Topological,
    /// Consumers before producers (descending ids).
    #[default]
    ReverseTopological,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Producers,
    Consumers,
}

/// In-memory adjacency index, built from the registry on open, kept current
/// on every commit and refreshed before traversal queries.
#[derive(Debug, Default)]
pub struct LineageGraph {
    producers: DashMap<RunId, BTreeSet<RunId>>,
    consumers: DashMap<RunId, BTreeSet<RunId>>,
    edges: DashMap<(RunId, RunId), BTreeSet<String>>,
}

impl LineageGraph {
    /// Empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index built from previously recorded edges.
    ///
    /// # Errors
    /// `LineageOrder` if any edge points forward in time.
    pub fn from_edges<I>(edges: I) -> Result<Self>
    where
        I: IntoIterator<Item = LineageEdge>,
    {
        let graph = Self::new();
        for edge in edges {
            graph.record_edge(&edge)?;
        }
        Ok(graph)
    }

    /// Record that `edge.consumer` read an artifact of `edge.producer`.
    ///
    /// Recording the same edge twice is a no-op.
    ///
    /// # Errors
    /// `LineageOrder` unless `producer < consumer`.
    pub fn record_edge(&self, edge: &LineageEdge) -> Result<()> {
        if edge.producer >= edge.consumer {
            return Err(Error::LineageOrder {
                producer: edge.producer,
                consumer: edge.consumer,
            });
        }
        trace!(producer = %edge.producer, consumer = %edge.consumer, artifact = %edge.artifact, "lineage edge");
        self.producers
            .entry(edge.consumer)
            .or_default()
            .insert(edge.producer);
        self.consumers
            .entry(edge.producer)
            .or_default()
            .insert(edge.consumer);
        self.edges
            .entry((edge.producer, edge.consumer))
            .or_default()
            .insert(edge.artifact.clone());
        Ok(())
    }

    /// Number of distinct (producer, consumer, artifact) edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.iter().map(|e| e.value().len()).sum()
    }

    /// Direct producers of `run_id`, ascending.
    #[must_use]
    pub fn parents(&self, run_id: RunId) -> Vec<RunId> {
        self.neighbours(run_id, Direction::Producers)
    }

    /// Direct consumers of `run_id`, ascending.
    #[must_use]
    pub fn children(&self, run_id: RunId) -> Vec<RunId> {
        self.neighbours(run_id, Direction::Consumers)
    }

    /// Artifact paths that flowed from `producer` to `consumer`.
    #[must_use]
    pub fn artifacts_between(&self, producer: RunId, consumer: RunId) -> Vec<String> {
        self.edges
            .get(&(producer, consumer))
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn neighbours(&self, run_id: RunId, direction: Direction) -> Vec<RunId> {
        let map = match direction {
            Direction::Producers => &self.producers,
            Direction::Consumers => &self.consumers,
        };
        map.get(&run_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Transitive producers of `run_id` (excluding itself).
    ///
    /// The returned value is a restartable description; every call to
    /// [`Lineage::iter`] walks the graph afresh.
    #[must_use]
    pub const fn ancestors(&self, run_id: RunId, order: Order) -> Lineage<'_> {
        Lineage {
            graph: self,
            start: run_id,
            direction: Direction::Producers,
            order,
        }
    }

    /// Transitive consumers of `run_id` (excluding itself).
    #[must_use]
    pub const fn descendants(&self, run_id: RunId, order: Order) -> Lineage<'_> {
        Lineage {
            graph: self,
            start: run_id,
            direction: Direction::Consumers,
            order,
        }
    }
}

/// Restartable ancestry or descendancy of one run.
#[derive(Debug, Clone, Copy)]
pub struct Lineage<'a> {
    graph: &'a LineageGraph,
    start: RunId,
    direction: Direction,
    order: Order,
}

impl<'a> Lineage<'a> {
    /// Start a fresh walk.
    #[must_use]
    pub fn iter(&self) -> Traversal<'a> {
        let streaming = matches!(
            (self.direction, self.order),
            (Direction::Producers, Order::ReverseTopological)
                | (Direction::Consumers, Order::Topological)
        );
        let walk = Walk::new(self.graph, self.start, self.direction);
        let state = if streaming {
            State::Streaming(walk)
        } else {
            State::Deferred(Some(walk))
        };
        Traversal { state }
    }
}

impl<'a> IntoIterator for &Lineage<'a> {
    type Item = RunId;
    type IntoIter = Traversal<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a> IntoIterator for Lineage<'a> {
    type Item = RunId;
    type IntoIter = Traversal<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Frontier ordered by id in the walk's natural direction.
#[derive(Debug, Clone)]
enum Frontier {
    Max(BinaryHeap<RunId>),
    Min(BinaryHeap<Reverse<RunId>>),
}

impl Frontier {
    fn push(&mut self, run_id: RunId) {
        match self {
            Self::Max(heap) => heap.push(run_id),
            Self::Min(heap) => heap.push(Reverse(run_id)),
        }
    }

    fn pop(&mut self) -> Option<RunId> {
        match self {
            Self::Max(heap) => heap.pop(),
            Self::Min(heap) => heap.pop().map(|Reverse(id)| id),
        }
    }
}

#[derive(Debug, Clone)]
struct Walk<'a> {
    graph: &'a LineageGraph,
    direction: Direction,
    frontier: Frontier,
    seen: FxHashSet<RunId>,
}

impl<'a> Walk<'a> {
    fn new(graph: &'a LineageGraph, start: RunId, direction: Direction) -> Self {
        let mut walk = Self {
            graph,
            direction,
            frontier: match direction {
                Direction::Producers => Frontier::Max(BinaryHeap::new()),
                Direction::Consumers => Frontier::Min(BinaryHeap::new()),
            },
            seen: FxHashSet::default(),
        };
        walk.seen.insert(start);
        walk.expand(start);
        walk
    }

    fn expand(&mut self, run_id: RunId) {
        for next in self.graph.neighbours(run_id, self.direction) {
            if self.seen.insert(next) {
                self.frontier.push(next);
            }
        }
    }
}

impl Iterator for Walk<'_> {
    type Item = RunId;

    fn next(&mut self) -> Option<RunId> {
        let run_id = self.frontier.pop()?;
        self.expand(run_id);
        Some(run_id)
    }
}

/// Lazy walk over a [`Lineage`].
#[derive(Debug, Clone)]
pub struct Traversal<'a> {
    state: State<'a>,
}

#[derive(Debug, Clone)]
enum State<'a> {
    /// Yields as the frontier is explored.
    Streaming(Walk<'a>),
    /// Collects the closure on first `next`, then yields it reversed.
    Deferred(Option<Walk<'a>>),
    Buffered(std::vec::IntoIter<RunId>),
}

impl Iterator for Traversal<'_> {
    type Item = RunId;

    fn next(&mut self) -> Option<RunId> {
        loop {
            match &mut self.state {
                State::Streaming(walk) => return walk.next(),
                State::Buffered(buf) => return buf.next(),
                State::Deferred(walk) => {
                    let mut ids: Vec<RunId> = walk.take().map(Iterator::collect).unwrap_or_default();
                    ids.reverse();
                    self.state = State::Buffered(ids.into_iter());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> RunId {
        RunId::new(n)
    }

    fn edge(producer: u64, consumer: u64) -> LineageEdge {
        LineageEdge::new(id(producer), id(consumer), format!("runs/{producer}/artifacts/out"))
    }

    /// 1 -> 2 -> 4, 1 -> 3 -> 4, 4 -> 5
    fn diamond() -> LineageGraph {
        LineageGraph::from_edges([edge(1, 2), edge(1, 3), edge(2, 4), edge(3, 4), edge(4, 5)])
            .unwrap()
    }

    #[test]
    fn test_record_edge_rejects_forward_edges() {
        let graph = LineageGraph::new();
        assert!(matches!(
            graph.record_edge(&edge(3, 3)),
            Err(Error::LineageOrder { .. })
        ));
        assert!(matches!(
            graph.record_edge(&edge(4, 2)),
            Err(Error::LineageOrder { .. })
        ));
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_record_edge_is_idempotent() {
        let graph = LineageGraph::new();
        graph.record_edge(&edge(1, 2)).unwrap();
        graph.record_edge(&edge(1, 2)).unwrap();
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.parents(id(2)), vec![id(1)]);
        assert_eq!(graph.children(id(1)), vec![id(2)]);
    }

    #[test]
    fn test_ancestors_reverse_topological() {
        let graph = diamond();
        let ids: Vec<RunId> = graph.ancestors(id(5), Order::ReverseTopological).iter().collect();
        assert_eq!(ids, vec![id(4), id(3), id(2), id(1)]);
    }

    #[test]
    fn test_ancestors_topological() {
        let graph = diamond();
        let ids: Vec<RunId> = graph.ancestors(id(5), Order::Topological).iter().collect();
        assert_eq!(ids, vec![id(1), id(2), id(3), id(4)]);
    }

    #[test]
    fn test_descendants_both_orders() {
        let graph = diamond();
        let topo: Vec<RunId> = graph.descendants(id(1), Order::Topological).iter().collect();
        assert_eq!(topo, vec![id(2), id(3), id(4), id(5)]);
        let rev: Vec<RunId> = graph
            .descendants(id(1), Order::ReverseTopological)
            .iter()
            .collect();
        assert_eq!(rev, vec![id(5), id(4), id(3), id(2)]);
    }

    #[test]
    fn test_lineage_is_restartable() {
        let graph = diamond();
        let lineage = graph.ancestors(id(4), Order::default());
        let first: Vec<RunId> = lineage.iter().collect();
        let second: Vec<RunId> = lineage.into_iter().collect();
        assert_eq!(first, second);
        assert_eq!(first, vec![id(3), id(2), id(1)]);
    }

    #[test]
    fn test_missing_edges_yield_empty() {
        let graph = diamond();
        assert_eq!(graph.ancestors(id(1), Order::default()).iter().count(), 0);
        assert_eq!(graph.descendants(id(5), Order::default()).iter().count(), 0);
        assert_eq!(graph.ancestors(id(99), Order::default()).iter().count(), 0);
    }

    #[test]
    fn test_deep_chain_terminates() {
        let graph = LineageGraph::from_edges((1..100).map(|n| edge(n, n + 1))).unwrap();
        assert_eq!(graph.ancestors(id(100), Order::default()).iter().count(), 99);
        assert_eq!(graph.descendants(id(1), Order::default()).iter().count(), 99);
    }

    #[test]
    fn test_artifacts_between() {
        let graph = diamond();
        assert_eq!(graph.artifacts_between(id(1), id(2)), vec!["runs/1/artifacts/out".to_string()]);
        assert!(graph.artifacts_between(id(1), id(5)).is_empty());
    }
}

//! The per-stream filter graph: nodes, edges, and frame delivery.
//!
//! A [`FilterGraph`] owns every node of one stream's distribution graph.
//! Node behavior is a closed tagged variant ([`NodeKind`]) dispatched once
//! per `deliver` call, so the per-frame hot path has no virtual calls and
//! match exhaustiveness is checked at compile time. Only terminals hold a
//! trait object, because that is the seam to external collaborators.
//!
//! `deliver` runs synchronously on the caller's thread: a linear chain is
//! walked iteratively, and a fan-out recurses once per extra edge with an
//! O(1) frame clone. There is no per-edge queueing; detaching an edge is
//! the only backpressure mechanism.

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::motion::{MotionDetector, MotionEvent};
use crate::sink::FrameSink;
use crate::transform::{FrameInterval, Scaler};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use tracing::warn;

/// Unique identifier for a node within one [`FilterGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    /// Get the underlying index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Behavior of a node, dispatched per delivered frame.
pub enum NodeKind {
    /// Forwards every frame unchanged.
    Pass {
        /// Downstream node, if any.
        next: Option<NodeId>,
    },
    /// Rescales raw frames to fixed dimensions.
    Scale {
        /// The scaler state.
        scaler: Scaler,
        /// Downstream node, if any.
        next: Option<NodeId>,
    },
    /// Drops frames arriving faster than a fixed interval.
    Interval {
        /// The interval filter state.
        filter: FrameInterval,
        /// Downstream node, if any.
        next: Option<NodeId>,
    },
    /// Movement detection; forwards frames only during movement windows.
    Motion {
        /// The detector state.
        detector: MotionDetector,
        /// Downstream node, if any.
        next: Option<NodeId>,
    },
    /// Forwards frames only while open.
    Gate {
        /// Current state.
        open: bool,
        /// Frames forwarded while open.
        passed: u64,
        /// Frames dropped while closed.
        dropped: u64,
        /// Downstream node, if any.
        next: Option<NodeId>,
    },
    /// Duplicates every frame to all currently attached edges.
    FanOut {
        /// Named edges; names are unique within the node.
        edges: BTreeMap<String, NodeId>,
    },
    /// Delivers frames to an external sink.
    Terminal {
        /// The sink behind this terminal.
        sink: Box<dyn FrameSink>,
    },
}

/// A named node in a filter graph.
pub struct FilterNode {
    name: String,
    kind: NodeKind,
}

impl FilterNode {
    /// Get the node's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Observed state of a gate node.
#[derive(Debug, Clone, Copy)]
pub struct GateStats {
    /// Whether the gate is currently open.
    pub is_open: bool,
    /// Frames forwarded while open.
    pub passed: u64,
    /// Frames dropped while closed.
    pub dropped: u64,
}

/// One stream's distribution graph.
///
/// Nodes live in a slot arena; removing a node recycles its slot, so a
/// pipeline that attaches and releases terminals for years does not grow
/// the arena without bound.
#[derive(Default)]
pub struct FilterGraph {
    nodes: Vec<Option<FilterNode>>,
    free: Vec<usize>,
}

impl FilterGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, node: FilterNode) -> NodeId {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                NodeId(idx)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    fn node(&self, id: NodeId) -> Option<&FilterNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut FilterNode> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Add a passthrough node.
    pub fn add_pass(&mut self, name: impl Into<String>, next: Option<NodeId>) -> NodeId {
        self.insert(FilterNode {
            name: name.into(),
            kind: NodeKind::Pass { next },
        })
    }

    /// Add a scaling node.
    pub fn add_scale(
        &mut self,
        name: impl Into<String>,
        scaler: Scaler,
        next: Option<NodeId>,
    ) -> NodeId {
        self.insert(FilterNode {
            name: name.into(),
            kind: NodeKind::Scale { scaler, next },
        })
    }

    /// Add a rate-limiting node.
    pub fn add_interval(
        &mut self,
        name: impl Into<String>,
        filter: FrameInterval,
        next: Option<NodeId>,
    ) -> NodeId {
        self.insert(FilterNode {
            name: name.into(),
            kind: NodeKind::Interval { filter, next },
        })
    }

    /// Add a movement-detection node.
    pub fn add_motion(
        &mut self,
        name: impl Into<String>,
        detector: MotionDetector,
        next: Option<NodeId>,
    ) -> NodeId {
        self.insert(FilterNode {
            name: name.into(),
            kind: NodeKind::Motion { detector, next },
        })
    }

    /// Add a gate node with the given initial state.
    pub fn add_gate(&mut self, name: impl Into<String>, open: bool, next: Option<NodeId>) -> NodeId {
        self.insert(FilterNode {
            name: name.into(),
            kind: NodeKind::Gate {
                open,
                passed: 0,
                dropped: 0,
                next,
            },
        })
    }

    /// Add a fan-out node with no edges.
    pub fn add_fanout(&mut self, name: impl Into<String>) -> NodeId {
        self.insert(FilterNode {
            name: name.into(),
            kind: NodeKind::FanOut {
                edges: BTreeMap::new(),
            },
        })
    }

    /// Add a terminal node delivering to an external sink.
    pub fn add_terminal(&mut self, name: impl Into<String>, sink: Box<dyn FrameSink>) -> NodeId {
        self.insert(FilterNode {
            name: name.into(),
            kind: NodeKind::Terminal { sink },
        })
    }

    /// Remove a node, recycling its slot.
    ///
    /// The caller is responsible for detaching the node first; delivery to
    /// a removed id is dropped with a warning.
    pub fn remove(&mut self, id: NodeId) {
        if let Some(slot) = self.nodes.get_mut(id.0) {
            if slot.take().is_some() {
                self.free.push(id.0);
            }
        }
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Check if the graph has no live nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attach a named edge from a fan-out node to a target node.
    ///
    /// Fails with [`Error::DuplicateEdge`] if the name is already taken:
    /// a double attach is a bookkeeping bug in the owning pipeline, not
    /// something to paper over.
    pub fn attach_edge(&mut self, fanout: NodeId, edge: &str, target: NodeId) -> Result<()> {
        let node = self
            .node_mut(fanout)
            .ok_or_else(|| Error::NotAFanOut(format!("#{}", fanout.0)))?;
        let name = node.name.clone();
        match &mut node.kind {
            NodeKind::FanOut { edges } => {
                if edges.contains_key(edge) {
                    warn!(node = %name, edge, "duplicate edge attach");
                    return Err(Error::DuplicateEdge { node: name, edge: edge.into() });
                }
                edges.insert(edge.to_string(), target);
                Ok(())
            }
            _ => Err(Error::NotAFanOut(name)),
        }
    }

    /// Detach a named edge from a fan-out node.
    ///
    /// Returns false (and logs) if the edge is not present, mirroring the
    /// "might already be gone" caller pattern during teardown races.
    pub fn detach_edge(&mut self, fanout: NodeId, edge: &str) -> bool {
        let Some(node) = self.node_mut(fanout) else {
            warn!(edge, "detach on a removed node");
            return false;
        };
        match &mut node.kind {
            NodeKind::FanOut { edges } => {
                if edges.remove(edge).is_some() {
                    true
                } else {
                    warn!(node = %node.name, edge, "detach of unknown edge");
                    false
                }
            }
            _ => {
                warn!(node = %node.name, edge, "detach on a non-fan-out node");
                false
            }
        }
    }

    /// Get a node's name.
    pub fn node_name(&self, id: NodeId) -> Option<&str> {
        self.node(id).map(FilterNode::name)
    }

    /// Check whether a fan-out currently carries a named edge.
    pub fn has_edge(&self, fanout: NodeId, edge: &str) -> bool {
        matches!(
            self.node(fanout).map(|n| &n.kind),
            Some(NodeKind::FanOut { edges }) if edges.contains_key(edge)
        )
    }

    /// Number of edges currently attached to a fan-out.
    pub fn edge_count(&self, fanout: NodeId) -> usize {
        match self.node(fanout).map(|n| &n.kind) {
            Some(NodeKind::FanOut { edges }) => edges.len(),
            _ => 0,
        }
    }

    /// Set a gate's state. Idempotent.
    pub fn set_gate(&mut self, gate: NodeId, open: bool) -> Result<()> {
        let node = self
            .node_mut(gate)
            .ok_or_else(|| Error::NotAGate(format!("#{}", gate.0)))?;
        match &mut node.kind {
            NodeKind::Gate { open: state, .. } => {
                *state = open;
                Ok(())
            }
            _ => Err(Error::NotAGate(node.name.clone())),
        }
    }

    /// Get a gate's state and counters.
    pub fn gate_stats(&self, gate: NodeId) -> Option<GateStats> {
        match self.node(gate).map(|n| &n.kind) {
            Some(NodeKind::Gate { open, passed, dropped, .. }) => Some(GateStats {
                is_open: *open,
                passed: *passed,
                dropped: *dropped,
            }),
            _ => None,
        }
    }

    /// Deliver one frame into the graph at the given node.
    ///
    /// Movement events emitted along the way are appended to `events`;
    /// the caller applies them after delivery, under the same lock, so
    /// gate control stays serialized with topology changes. Per-sink
    /// errors are logged and never abort delivery to sibling edges.
    pub fn deliver(&mut self, id: NodeId, frame: Frame, events: &mut Vec<MotionEvent>) {
        enum Step {
            Next(NodeId),
            Fan(SmallVec<[NodeId; 4]>),
            Done,
        }

        let mut id = id;
        let mut frame = frame;
        loop {
            let step = {
                let Some(node) = self.nodes.get_mut(id.0).and_then(Option::as_mut) else {
                    warn!(node = id.0, "delivery to a removed node");
                    return;
                };
                match &mut node.kind {
                    NodeKind::Pass { next } => match next {
                        Some(n) => Step::Next(*n),
                        None => Step::Done,
                    },
                    NodeKind::Scale { scaler, next } => match (scaler.apply(&frame), *next) {
                        (Ok(scaled), Some(n)) => {
                            frame = scaled;
                            Step::Next(n)
                        }
                        (Ok(_), None) => Step::Done,
                        (Err(e), _) => {
                            warn!(node = %node.name, error = %e, "scale failed, frame dropped");
                            Step::Done
                        }
                    },
                    NodeKind::Interval { filter, next } => {
                        if filter.pass(&frame) {
                            match next {
                                Some(n) => Step::Next(*n),
                                None => Step::Done,
                            }
                        } else {
                            Step::Done
                        }
                    }
                    NodeKind::Motion { detector, next } => {
                        let (pass, event) = detector.process(&frame);
                        if let Some(event) = event {
                            events.push(event);
                        }
                        match (pass, *next) {
                            (true, Some(n)) => Step::Next(n),
                            _ => Step::Done,
                        }
                    }
                    NodeKind::Gate { open, passed, dropped, next } => {
                        if *open {
                            *passed += 1;
                            match next {
                                Some(n) => Step::Next(*n),
                                None => Step::Done,
                            }
                        } else {
                            *dropped += 1;
                            Step::Done
                        }
                    }
                    NodeKind::FanOut { edges } => Step::Fan(edges.values().copied().collect()),
                    NodeKind::Terminal { sink } => {
                        if let Err(e) = sink.consume(frame) {
                            warn!(sink = sink.name(), error = %e, "terminal rejected frame");
                        }
                        return;
                    }
                }
            };

            match step {
                Step::Next(n) => id = n,
                Step::Done => return,
                Step::Fan(targets) => {
                    let Some((&last, rest)) = targets.split_last() else {
                        return;
                    };
                    for &target in rest {
                        self.deliver(target, frame.clone(), events);
                    }
                    // tail edge reuses the frame without a clone
                    id = last;
                }
            }
        }
    }
}

impl std::fmt::Debug for FilterGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterGraph")
            .field("nodes", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameMeta;
    use crate::testing::CollectSink;
    use bytes::Bytes;

    fn frame(seq: u64) -> Frame {
        Frame::new(Bytes::from(vec![0u8; 16]), FrameMeta::with_sequence(seq))
    }

    #[test]
    fn test_fanout_delivers_to_all_attached_edges() {
        let mut graph = FilterGraph::new();
        let fork = graph.add_fanout("fork");

        let a = CollectSink::new("a");
        let b = CollectSink::new("b");
        let (ha, hb) = (a.handle(), b.handle());
        let ta = graph.add_terminal("term_a", Box::new(a));
        let tb = graph.add_terminal("term_b", Box::new(b));

        graph.attach_edge(fork, "a", ta).unwrap();
        let mut events = Vec::new();
        graph.deliver(fork, frame(0), &mut events);

        graph.attach_edge(fork, "b", tb).unwrap();
        graph.deliver(fork, frame(1), &mut events);

        graph.detach_edge(fork, "a");
        graph.deliver(fork, frame(2), &mut events);

        // an edge receives exactly the frames delivered while attached
        assert_eq!(ha.sequences(), vec![0, 1]);
        assert_eq!(hb.sequences(), vec![1, 2]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_duplicate_attach_is_an_error() {
        let mut graph = FilterGraph::new();
        let fork = graph.add_fanout("fork");
        let t = graph.add_terminal("term", Box::new(CollectSink::new("t")));

        graph.attach_edge(fork, "x", t).unwrap();
        assert!(matches!(
            graph.attach_edge(fork, "x", t),
            Err(Error::DuplicateEdge { .. })
        ));
        assert_eq!(graph.edge_count(fork), 1);
    }

    #[test]
    fn test_detach_unknown_edge_returns_false() {
        let mut graph = FilterGraph::new();
        let fork = graph.add_fanout("fork");
        assert!(!graph.detach_edge(fork, "nope"));
    }

    #[test]
    fn test_attach_on_non_fanout_fails() {
        let mut graph = FilterGraph::new();
        let gate = graph.add_gate("gate", true, None);
        let t = graph.add_terminal("term", Box::new(CollectSink::new("t")));
        assert!(matches!(
            graph.attach_edge(gate, "x", t),
            Err(Error::NotAFanOut(_))
        ));
    }

    #[test]
    fn test_closed_gate_drops_frames() {
        let mut graph = FilterGraph::new();
        let sink = CollectSink::new("s");
        let handle = sink.handle();
        let term = graph.add_terminal("term", Box::new(sink));
        let gate = graph.add_gate("gate", false, Some(term));

        let mut events = Vec::new();
        graph.deliver(gate, frame(0), &mut events);
        assert_eq!(handle.count(), 0);

        graph.set_gate(gate, true).unwrap();
        graph.set_gate(gate, true).unwrap(); // idempotent
        graph.deliver(gate, frame(1), &mut events);
        assert_eq!(handle.sequences(), vec![1]);

        let stats = graph.gate_stats(gate).unwrap();
        assert!(stats.is_open);
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_set_gate_on_non_gate_fails() {
        let mut graph = FilterGraph::new();
        let fork = graph.add_fanout("fork");
        assert!(matches!(graph.set_gate(fork, true), Err(Error::NotAGate(_))));
    }

    #[test]
    fn test_removed_slot_is_recycled() {
        let mut graph = FilterGraph::new();
        let a = graph.add_pass("a", None);
        graph.remove(a);
        let b = graph.add_pass("b", None);
        assert_eq!(a.index(), b.index());
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_delivery_to_removed_node_is_dropped() {
        let mut graph = FilterGraph::new();
        let t = graph.add_terminal("term", Box::new(CollectSink::new("t")));
        graph.remove(t);
        let mut events = Vec::new();
        graph.deliver(t, frame(0), &mut events); // must not panic
    }

    #[test]
    fn test_linear_chain_preserves_order() {
        let mut graph = FilterGraph::new();
        let sink = CollectSink::new("s");
        let handle = sink.handle();
        let term = graph.add_terminal("term", Box::new(sink));
        let pass = graph.add_pass("pass", Some(term));
        let gate = graph.add_gate("gate", true, Some(pass));

        let mut events = Vec::new();
        for seq in 0..5 {
            graph.deliver(gate, frame(seq), &mut events);
        }
        assert_eq!(handle.sequences(), vec![0, 1, 2, 3, 4]);
    }
}

//! Branch client counting with cascaded activation.
//!
//! Every lazily-activated branch of a pipeline carries a client count;
//! the branch is active exactly when its count is positive. Some branches
//! imply demand on others (exporting scaled images requires the motion
//! detector, which requires decoding), so adjusting one count cascades
//! upstream. The cascade lives here, as data, so it can be asserted in a
//! unit test without constructing a pipeline.

use smallvec::SmallVec;
use std::collections::BTreeMap;
use tracing::warn;

/// What a count adjustment did to the branch's activation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Count went from zero to positive: the branch must be activated.
    Activated,
    /// Count went from positive to zero: the branch must be deactivated.
    Deactivated,
    /// The count changed without crossing zero.
    Unchanged,
}

/// A single branch's client count. Never goes negative.
#[derive(Debug, Clone)]
pub struct ClientCounter {
    name: &'static str,
    count: u32,
}

impl ClientCounter {
    /// Create a counter at zero.
    pub fn new(name: &'static str) -> Self {
        Self { name, count: 0 }
    }

    /// Current count.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Check if any client is registered.
    pub fn is_active(&self) -> bool {
        self.count > 0
    }

    /// Apply a signed delta, clamping at zero.
    ///
    /// Decrementing below zero is a caller contract violation; it is
    /// logged and clamped so branch-activation state cannot corrupt.
    pub fn apply(&mut self, delta: i32) -> Transition {
        let was = self.count;
        let new = was as i64 + delta as i64;
        if new < 0 {
            warn!(counter = self.name, count = was, delta, "client count underflow, clamping");
        }
        self.count = new.max(0) as u32;

        match (was, self.count) {
            (0, n) if n > 0 => Transition::Activated,
            (p, 0) if p > 0 => Transition::Deactivated,
            _ => Transition::Unchanged,
        }
    }
}

/// Identifies a lazily-activated branch of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// The decoder itself (decodingOn/decodingOff on the decode adapter).
    Decode,
    /// The movement-detection edge on the decode fan-out.
    Analysis,
    /// The gate in front of the scaled export fan-out.
    Export,
    /// The gate in front of the bitmap fan-out.
    Bitmap,
    /// One render target's edge on the decode fan-out.
    Presentation(usize),
}

/// The counter set of one pipeline, with its dependency cascade.
///
/// Dependencies: `Export -> Analysis -> Decode`, `Presentation(i) ->
/// Decode`; `Bitmap` stands alone (its branch hangs off the decode
/// fan-out permanently, gated rather than attached on demand, and its
/// clients come with a presentation client that keeps decoding alive).
#[derive(Debug)]
pub struct BranchCounters {
    decode: ClientCounter,
    analysis: ClientCounter,
    export: ClientCounter,
    bitmap: ClientCounter,
    presentation: BTreeMap<usize, ClientCounter>,
}

/// Ordered transitions produced by one adjustment, branch first, then its
/// upstream dependencies.
pub type Transitions = SmallVec<[(BranchKind, Transition); 3]>;

impl BranchCounters {
    /// Create all counters at zero.
    pub fn new() -> Self {
        Self {
            decode: ClientCounter::new("decode"),
            analysis: ClientCounter::new("analysis"),
            export: ClientCounter::new("export"),
            bitmap: ClientCounter::new("bitmap"),
            presentation: BTreeMap::new(),
        }
    }

    /// Apply a delta to a branch and cascade it upstream.
    ///
    /// Returns every (branch, transition) pair in application order so
    /// the owner can translate zero crossings into topology changes.
    pub fn apply(&mut self, branch: BranchKind, delta: i32) -> Transitions {
        let mut out = Transitions::new();
        match branch {
            BranchKind::Decode => {
                out.push((branch, self.decode.apply(delta)));
            }
            BranchKind::Analysis => {
                out.push((branch, self.analysis.apply(delta)));
                out.push((BranchKind::Decode, self.decode.apply(delta)));
            }
            BranchKind::Export => {
                out.push((branch, self.export.apply(delta)));
                out.push((BranchKind::Analysis, self.analysis.apply(delta)));
                out.push((BranchKind::Decode, self.decode.apply(delta)));
            }
            BranchKind::Bitmap => {
                out.push((branch, self.bitmap.apply(delta)));
            }
            BranchKind::Presentation(index) => {
                let counter = self
                    .presentation
                    .entry(index)
                    .or_insert_with(|| ClientCounter::new("presentation"));
                out.push((branch, counter.apply(delta)));
                out.push((BranchKind::Decode, self.decode.apply(delta)));
            }
        }
        out
    }

    /// Current decode client count.
    pub fn decode(&self) -> u32 {
        self.decode.count()
    }

    /// Current analysis client count.
    pub fn analysis(&self) -> u32 {
        self.analysis.count()
    }

    /// Current export client count.
    pub fn export(&self) -> u32 {
        self.export.count()
    }

    /// Current bitmap client count.
    pub fn bitmap(&self) -> u32 {
        self.bitmap.count()
    }

    /// Current presentation client count for one render target.
    pub fn presentation(&self, index: usize) -> u32 {
        self.presentation.get(&index).map_or(0, ClientCounter::count)
    }
}

impl Default for BranchCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_transitions() {
        let mut c = ClientCounter::new("test");
        assert_eq!(c.apply(1), Transition::Activated);
        assert_eq!(c.apply(1), Transition::Unchanged);
        assert_eq!(c.apply(-1), Transition::Unchanged);
        assert_eq!(c.apply(-1), Transition::Deactivated);
        assert_eq!(c.count(), 0);
    }

    #[test]
    fn test_counter_clamps_at_zero() {
        let mut c = ClientCounter::new("test");
        assert_eq!(c.apply(-1), Transition::Unchanged);
        assert_eq!(c.count(), 0);
        // state is not corrupted by the underflow
        assert_eq!(c.apply(1), Transition::Activated);
        assert_eq!(c.count(), 1);
    }

    #[test]
    fn test_export_cascades_to_decode() {
        let mut counters = BranchCounters::new();
        let transitions = counters.apply(BranchKind::Export, 1);
        assert_eq!(
            transitions.as_slice(),
            &[
                (BranchKind::Export, Transition::Activated),
                (BranchKind::Analysis, Transition::Activated),
                (BranchKind::Decode, Transition::Activated),
            ]
        );
        assert_eq!(counters.export(), 1);
        assert_eq!(counters.analysis(), 1);
        assert_eq!(counters.decode(), 1);
    }

    #[test]
    fn test_second_client_does_not_reactivate() {
        let mut counters = BranchCounters::new();
        counters.apply(BranchKind::Export, 1);
        let transitions = counters.apply(BranchKind::Export, 1);
        assert!(transitions.iter().all(|(_, t)| *t == Transition::Unchanged));
        assert_eq!(counters.export(), 2);
        assert_eq!(counters.decode(), 2);
    }

    #[test]
    fn test_deactivation_needs_all_clients_gone() {
        let mut counters = BranchCounters::new();
        counters.apply(BranchKind::Export, 1);
        counters.apply(BranchKind::Export, 1);

        let transitions = counters.apply(BranchKind::Export, -1);
        assert!(transitions.iter().all(|(_, t)| *t == Transition::Unchanged));

        let transitions = counters.apply(BranchKind::Export, -1);
        assert_eq!(
            transitions.as_slice(),
            &[
                (BranchKind::Export, Transition::Deactivated),
                (BranchKind::Analysis, Transition::Deactivated),
                (BranchKind::Decode, Transition::Deactivated),
            ]
        );
    }

    #[test]
    fn test_mixed_demand_keeps_shared_upstream_alive() {
        let mut counters = BranchCounters::new();
        counters.apply(BranchKind::Presentation(0), 1);
        counters.apply(BranchKind::Analysis, 1);
        assert_eq!(counters.decode(), 2);

        // dropping the render client leaves decoding alive for analysis
        let transitions = counters.apply(BranchKind::Presentation(0), -1);
        assert_eq!(transitions[0], (BranchKind::Presentation(0), Transition::Deactivated));
        assert_eq!(transitions[1], (BranchKind::Decode, Transition::Unchanged));
        assert_eq!(counters.decode(), 1);
    }

    #[test]
    fn test_presentation_counters_are_per_index() {
        let mut counters = BranchCounters::new();
        counters.apply(BranchKind::Presentation(0), 1);
        counters.apply(BranchKind::Presentation(1), 1);
        assert_eq!(counters.presentation(0), 1);
        assert_eq!(counters.presentation(1), 1);
        assert_eq!(counters.presentation(2), 0);
        assert_eq!(counters.decode(), 2);
    }

    #[test]
    fn test_activation_is_sign_of_count() {
        // adversarial increment/decrement ordering never desyncs
        // activation from the sign of the count
        let mut counters = BranchCounters::new();
        let deltas = [1, 1, -1, -1, -1, 1, -1, 1, 1, -1];
        let mut active = false;
        for delta in deltas {
            let transitions = counters.apply(BranchKind::Analysis, delta);
            match transitions[0].1 {
                Transition::Activated => active = true,
                Transition::Deactivated => active = false,
                Transition::Unchanged => {}
            }
            assert_eq!(active, counters.analysis() > 0);
        }
    }
}

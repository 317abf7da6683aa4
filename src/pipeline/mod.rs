//! Stream pipelines: one complete distribution graph per logical stream.
//!
//! Two flavors exist, deliberately parallel: [`LivePipeline`] for a live
//! source (camera) and [`PlaybackPipeline`] for a playback slot fed by an
//! external recording cacher. Both own their graph behind a single
//! per-pipeline mutex; every public operation, and every frame delivery,
//! is serialized through it (frames from different pipelines never
//! contend with each other).

mod live;
mod playback;

pub use live::LivePipeline;
pub use playback::PlaybackPipeline;

use crate::error::Result;
use crate::frame::Frame;
use crate::graph::NodeId;
use crate::sink::FrameSink;
use std::sync::Weak;
use tracing::trace;

/// Overall lifecycle of a pipeline.
///
/// Construction is not an observable state: `new` returns a started
/// pipeline or an error (and a failed construction never leaves a
/// half-started pipeline behind).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Adapters are running; the graph routes frames.
    Started,
    /// Stop requests have been issued; waiting for adapters.
    Closing,
    /// Adapters have been waited on (or construction failed).
    Closed,
}

/// When the recording branch lets frames through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPolicy {
    /// A valid policy that simply never opens the recording gate.
    Never,
    /// The gate follows movement events.
    OnMovement,
    /// The gate stays open while the attachment exists.
    Always,
}

/// Something frames can be delivered into at a fixed graph root.
pub(crate) trait DeliveryTarget: Send + Sync {
    fn deliver(&self, root: NodeId, frame: Frame);
}

/// A cloneable handle delivering frames into one root of a pipeline's
/// graph.
///
/// This is the handoff given to source and decoder adapters. It holds a
/// weak reference: once the owning pipeline is gone, delivery becomes a
/// silent no-op, so adapter workers draining their queues during
/// teardown never dangle.
#[derive(Clone)]
pub struct FrameInput {
    target: Weak<dyn DeliveryTarget>,
    root: NodeId,
}

impl FrameInput {
    pub(crate) fn new(target: Weak<dyn DeliveryTarget>, root: NodeId) -> Self {
        Self { target, root }
    }

    /// Deliver one frame. Runs synchronously on the calling thread.
    pub fn deliver(&self, frame: Frame) {
        match self.target.upgrade() {
            Some(target) => target.deliver(self.root, frame),
            None => trace!("frame delivered to a dropped pipeline"),
        }
    }
}

impl FrameSink for FrameInput {
    fn consume(&mut self, frame: Frame) -> Result<()> {
        self.deliver(frame);
        Ok(())
    }

    fn name(&self) -> &str {
        "frame-input"
    }
}

impl std::fmt::Debug for FrameInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameInput").field("root", &self.root).finish()
    }
}

//! The frame sink seam.
//!
//! Every terminal of a distribution graph, and every handoff point into an
//! external collaborator (decoder input, recorder input, render target),
//! is a [`FrameSink`]. Sinks run on the producer's thread inside
//! `deliver`, so implementations must be fast and non-blocking; anything
//! slow belongs behind a queue owned by the collaborator.

use crate::error::Result;
use crate::frame::Frame;

/// Consumes frames at the end of a graph branch.
pub trait FrameSink: Send {
    /// Consume one frame.
    ///
    /// Errors are recovered by the delivering graph: they are logged and
    /// never interrupt delivery to sibling edges.
    fn consume(&mut self, frame: Frame) -> Result<()>;

    /// Get the sink's name, used in log output.
    fn name(&self) -> &str;
}

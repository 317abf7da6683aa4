//! External collaborator interfaces.
//!
//! The graph core never performs network I/O, decoding, rendering, or
//! disk writes itself; it routes frames between adapters implementing
//! these traits. All blocking work lives behind the seams: the
//! `frame_sink` handoffs returned here run on the producer's thread and
//! must hand frames off quickly (typically into the adapter's own queue).
//!
//! Stopping is two-phase everywhere (`request_stop` then `wait_stop`) so
//! a group of pipelines can fan out all stop requests before blocking on
//! any of them.

use crate::error::Result;
use crate::pipeline::FrameInput;
use crate::sink::FrameSink;
use std::time::Duration;

/// Connection parameters handed to a [`SourceAdapter`] at registration.
///
/// `input` is where the adapter delivers every received frame: the main
/// fan-out of the owning pipeline.
pub struct StreamContext {
    /// Stream slot number, unique within the process.
    pub slot: usize,
    /// Stream address (e.g. an rtsp:// URL or a device path).
    pub address: String,
    /// Prefer TCP transport where the protocol allows a choice.
    pub request_tcp: bool,
    /// OS socket receive buffer size in bytes; 0 means default.
    pub recv_buffer_size: usize,
    /// Packet reordering window; zero means default.
    pub reordering_time: Duration,
    /// Reconnect after this much silence; `None` disables reconnection.
    pub reconnect: Option<Duration>,
    /// Destination for received frames.
    pub input: FrameInput,
}

/// Acquires a stream and feeds frames into the pipeline.
///
/// `start` must not deliver frames synchronously from the calling thread;
/// delivery happens from the adapter's own worker once running.
pub trait SourceAdapter: Send {
    /// Register the stream this adapter will carry.
    fn register_stream(&mut self, ctx: StreamContext) -> Result<()>;

    /// Start the adapter's worker.
    fn start(&mut self) -> Result<()>;

    /// Request the worker to stop. Must not block.
    fn request_stop(&mut self);

    /// Wait until the worker has stopped.
    fn wait_stop(&mut self) -> Result<()>;
}

/// Decodes frames between the main and decode fan-outs.
///
/// The input edge is the sink returned by [`DecoderAdapter::frame_sink`];
/// the output edge is the [`FrameInput`] given to
/// [`DecoderAdapter::connect_output`]. Decoding is demand-driven:
/// [`DecoderAdapter::set_decoding`] follows the pipeline's decode client
/// count, while the worker itself stays up from `start` to `wait_stop`.
pub trait DecoderAdapter: Send {
    /// Get the input edge: a sink accepting un-decoded frames.
    fn frame_sink(&mut self) -> Box<dyn FrameSink>;

    /// Connect the output edge: where decoded frames are delivered.
    fn connect_output(&mut self, output: FrameInput);

    /// Start the decoder worker (decoding still off).
    fn start(&mut self) -> Result<()>;

    /// Turn actual decoding on or off.
    fn set_decoding(&mut self, enabled: bool) -> Result<()>;

    /// Request the worker to stop. Must not block.
    fn request_stop(&mut self);

    /// Wait until the worker has stopped.
    fn wait_stop(&mut self) -> Result<()>;
}

/// Records frames, addressed by a correlation id.
///
/// One recorder instance typically serves many pipelines; `set_input`
/// maps a stream slot to a recorder-side input identified by the
/// correlation id, and `frame_sink` supplies the edge the pipeline's
/// recording branch writes into.
pub trait RecorderSink: Send {
    /// Get a sink accepting this pipeline's recorded frames.
    fn frame_sink(&mut self) -> Box<dyn FrameSink>;

    /// Map a stream slot to a recorder-side input.
    fn set_input(&mut self, correlation_id: i64, slot: usize) -> Result<()>;

    /// Remove the mapping for a stream slot.
    fn clear_input(&mut self, slot: usize) -> Result<()>;
}

/// Presents decoded frames on one physical display.
pub trait RenderSink: Send {
    /// Get a sink accepting frames for this target.
    fn frame_sink(&mut self) -> Box<dyn FrameSink>;
}

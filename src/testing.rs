//! Stub collaborators and frame builders for tests.
//!
//! These mirror the adapter seams with fully observable in-memory
//! implementations. They are compiled into the library (not just the
//! test tree) so integration tests and downstream crates can drive a
//! pipeline without any real source, decoder, recorder, or display.

use crate::adapter::{DecoderAdapter, RecorderSink, RenderSink, SourceAdapter, StreamContext};
use crate::error::Result;
use crate::frame::{Frame, FrameMeta, PixelFormat};
use crate::pipeline::FrameInput;
use crate::sink::FrameSink;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Build a raw frame with a constant payload.
///
/// The timestamp is derived from the sequence number at 25 fps.
pub fn raw_frame(sequence: u64, width: u32, height: u32, format: PixelFormat) -> Frame {
    let size = format.frame_size(width, height).unwrap_or(1024);
    Frame::new(
        Bytes::from(vec![sequence as u8; size]),
        FrameMeta::with_sequence(sequence)
            .with_video(format, width, height)
            .with_pts(Duration::from_millis(sequence * 40)),
    )
}

/// Build an opaque encoded frame.
pub fn encoded_frame(sequence: u64) -> Frame {
    Frame::new(
        Bytes::from(vec![sequence as u8; 256]),
        FrameMeta::with_sequence(sequence).with_pts(Duration::from_millis(sequence * 40)),
    )
}

// ============================================================================
// Sinks
// ============================================================================

/// A sink that records every frame it receives.
pub struct CollectSink {
    name: String,
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl CollectSink {
    /// Create a sink with its own frame log.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            frames: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a sink appending to a shared frame log.
    pub fn from_shared(name: impl Into<String>, frames: Arc<Mutex<Vec<Frame>>>) -> Self {
        Self {
            name: name.into(),
            frames,
        }
    }

    /// Get an observation handle that outlives the sink.
    pub fn handle(&self) -> CollectHandle {
        CollectHandle {
            frames: Arc::clone(&self.frames),
        }
    }
}

impl FrameSink for CollectSink {
    fn consume(&mut self, frame: Frame) -> Result<()> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Observation handle over a [`CollectSink`]'s frame log.
#[derive(Clone)]
pub struct CollectHandle {
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl CollectHandle {
    /// Number of frames received.
    pub fn count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    /// Sequence numbers of the received frames, in arrival order.
    pub fn sequences(&self) -> Vec<u64> {
        self.frames.lock().unwrap().iter().map(|f| f.meta().sequence).collect()
    }

    /// The most recently received frame.
    pub fn last(&self) -> Option<Frame> {
        self.frames.lock().unwrap().last().cloned()
    }
}

/// A sink that drops everything.
pub struct NullSink;

impl FrameSink for NullSink {
    fn consume(&mut self, _frame: Frame) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

// ============================================================================
// StubSource
// ============================================================================

/// Observable state of a [`StubSource`].
#[derive(Default)]
pub struct SourceProbe {
    /// The pipeline input received at registration.
    pub input: Mutex<Option<FrameInput>>,
    /// The address received at registration.
    pub address: Mutex<Option<String>>,
    /// Whether `start` has been called.
    pub started: AtomicBool,
    /// When `request_stop` was called.
    pub requested_at: Mutex<Option<Instant>>,
    /// When `wait_stop` completed.
    pub wait_done_at: Mutex<Option<Instant>>,
}

impl SourceProbe {
    /// Deliver a frame as if the source's worker had received it.
    pub fn deliver(&self, frame: Frame) {
        if let Some(input) = self.input.lock().unwrap().as_ref() {
            input.deliver(frame);
        }
    }

    /// Whether `request_stop` has been called.
    pub fn stop_requested(&self) -> bool {
        self.requested_at.lock().unwrap().is_some()
    }
}

/// A source adapter that records its lifecycle and lets the test deliver
/// frames by hand.
pub struct StubSource {
    probe: Arc<SourceProbe>,
    wait_delay: Duration,
    fail_start: bool,
}

impl StubSource {
    /// Create a stub source and its probe.
    pub fn new() -> (Self, Arc<SourceProbe>) {
        let probe = Arc::new(SourceProbe::default());
        (
            Self {
                probe: Arc::clone(&probe),
                wait_delay: Duration::ZERO,
                fail_start: false,
            },
            probe,
        )
    }

    /// Make `wait_stop` take this long, to simulate a slow teardown.
    pub fn with_wait_delay(mut self, delay: Duration) -> Self {
        self.wait_delay = delay;
        self
    }

    /// Make `start` fail, to exercise construction unwinding.
    pub fn with_failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }
}

impl SourceAdapter for StubSource {
    fn register_stream(&mut self, ctx: StreamContext) -> Result<()> {
        *self.probe.input.lock().unwrap() = Some(ctx.input);
        *self.probe.address.lock().unwrap() = Some(ctx.address);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.fail_start {
            return Err(crate::error::Error::Adapter("stub start failure".into()));
        }
        self.probe.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn request_stop(&mut self) {
        *self.probe.requested_at.lock().unwrap() = Some(Instant::now());
    }

    fn wait_stop(&mut self) -> Result<()> {
        if !self.wait_delay.is_zero() {
            std::thread::sleep(self.wait_delay);
        }
        *self.probe.wait_done_at.lock().unwrap() = Some(Instant::now());
        Ok(())
    }
}

// ============================================================================
// LoopbackDecoder
// ============================================================================

/// Observable state of a [`LoopbackDecoder`].
pub struct DecoderProbe {
    output: Mutex<Option<FrameInput>>,
    queue: Mutex<VecDeque<Frame>>,
    /// Whether `start` has been called.
    pub started: AtomicBool,
    /// Whether decoding is currently on.
    pub decoding: AtomicBool,
    /// Whether `request_stop` has been called.
    pub stop_requested: AtomicBool,
    /// Frames submitted to the input edge.
    pub submitted: AtomicU64,
    /// Every `set_decoding` value, in call order.
    pub toggles: Mutex<Vec<bool>>,
    dims: (u32, u32),
}

impl DecoderProbe {
    /// Forward the queued frames to the decode output, "decoded" to
    /// RGB24 at the configured dimensions.
    ///
    /// A real decoder does this on its own worker thread; the stub makes
    /// it an explicit step so tests control exactly when decoded frames
    /// hit the decode fan-out.
    pub fn pump(&self) {
        let output = self.output.lock().unwrap().clone();
        let Some(output) = output else { return };
        loop {
            let frame = self.queue.lock().unwrap().pop_front();
            let Some(frame) = frame else { break };
            let (w, h) = self.dims;
            let meta = FrameMeta {
                width: w,
                height: h,
                format: PixelFormat::Rgb24,
                ..frame.meta().clone()
            };
            let size = PixelFormat::Rgb24.frame_size(w, h).unwrap_or(0);
            output.deliver(Frame::new(
                Bytes::from(vec![meta.sequence as u8; size]),
                meta,
            ));
        }
    }

    /// Frames waiting in the input queue.
    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

/// A decoder adapter that queues input frames and emits RGB24 frames of
/// fixed dimensions when pumped.
pub struct LoopbackDecoder {
    probe: Arc<DecoderProbe>,
}

impl LoopbackDecoder {
    /// Create a stub decoder producing `width`×`height` RGB24 frames.
    pub fn new(width: u32, height: u32) -> (Self, Arc<DecoderProbe>) {
        let probe = Arc::new(DecoderProbe {
            output: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            started: AtomicBool::new(false),
            decoding: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            toggles: Mutex::new(Vec::new()),
            dims: (width, height),
        });
        (
            Self {
                probe: Arc::clone(&probe),
            },
            probe,
        )
    }
}

struct DecoderInput {
    probe: Arc<DecoderProbe>,
}

impl FrameSink for DecoderInput {
    fn consume(&mut self, frame: Frame) -> Result<()> {
        self.probe.submitted.fetch_add(1, Ordering::SeqCst);
        if self.probe.decoding.load(Ordering::SeqCst) {
            self.probe.queue.lock().unwrap().push_back(frame);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "loopback-decoder-in"
    }
}

impl DecoderAdapter for LoopbackDecoder {
    fn frame_sink(&mut self) -> Box<dyn FrameSink> {
        Box::new(DecoderInput {
            probe: Arc::clone(&self.probe),
        })
    }

    fn connect_output(&mut self, output: FrameInput) {
        *self.probe.output.lock().unwrap() = Some(output);
    }

    fn start(&mut self) -> Result<()> {
        self.probe.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_decoding(&mut self, enabled: bool) -> Result<()> {
        self.probe.decoding.store(enabled, Ordering::SeqCst);
        self.probe.toggles.lock().unwrap().push(enabled);
        Ok(())
    }

    fn request_stop(&mut self) {
        self.probe.stop_requested.store(true, Ordering::SeqCst);
    }

    fn wait_stop(&mut self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// CaptureRecorder
// ============================================================================

/// Observable state of a [`CaptureRecorder`].
#[derive(Default)]
pub struct RecorderProbe {
    frames: Arc<Mutex<Vec<Frame>>>,
    /// Every `set_input` call as (correlation_id, slot).
    pub inputs: Mutex<Vec<(i64, usize)>>,
    /// Every `clear_input` slot, in call order.
    pub cleared: Mutex<Vec<usize>>,
}

impl RecorderProbe {
    /// Number of frames recorded.
    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    /// Sequence numbers of the recorded frames.
    pub fn sequences(&self) -> Vec<u64> {
        self.frames.lock().unwrap().iter().map(|f| f.meta().sequence).collect()
    }
}

/// A recorder that captures frames and input mappings in memory.
pub struct CaptureRecorder {
    probe: Arc<RecorderProbe>,
}

impl CaptureRecorder {
    /// Create a recorder and its probe.
    pub fn new() -> (Self, Arc<RecorderProbe>) {
        let probe = Arc::new(RecorderProbe::default());
        (
            Self {
                probe: Arc::clone(&probe),
            },
            probe,
        )
    }
}

impl RecorderSink for CaptureRecorder {
    fn frame_sink(&mut self) -> Box<dyn FrameSink> {
        Box::new(CollectSink::from_shared(
            "capture-recorder",
            Arc::clone(&self.probe.frames),
        ))
    }

    fn set_input(&mut self, correlation_id: i64, slot: usize) -> Result<()> {
        self.probe.inputs.lock().unwrap().push((correlation_id, slot));
        Ok(())
    }

    fn clear_input(&mut self, slot: usize) -> Result<()> {
        self.probe.cleared.lock().unwrap().push(slot);
        Ok(())
    }
}

// ============================================================================
// CaptureRender
// ============================================================================

/// A render target that captures frames in memory.
///
/// `frame_sink` can be called repeatedly (the pipeline mints a new edge
/// per attach); every sink feeds the same log.
pub struct CaptureRender {
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl CaptureRender {
    /// Create a render target.
    pub fn new() -> Self {
        Self {
            frames: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Get an observation handle over the received frames.
    pub fn handle(&self) -> CollectHandle {
        CollectHandle {
            frames: Arc::clone(&self.frames),
        }
    }
}

impl Default for CaptureRender {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderSink for CaptureRender {
    fn frame_sink(&mut self) -> Box<dyn FrameSink> {
        Box::new(CollectSink::from_shared("capture-render", Arc::clone(&self.frames)))
    }
}

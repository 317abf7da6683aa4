//! The live stream pipeline.
//!
//! One instance owns the complete distribution graph for one live stream:
//!
//! ```text
//! *** main branch ***
//!
//! source ->> [fork_main] --+--> recording branch
//!                          +--> decode branch
//!
//! *** recording branch ***
//!
//! --> (record_gate, closed by default) --> [fork_record] ->> recorder
//!
//! *** decode branch ***
//!
//! ->> decoder ->> [fork_decode] --+--> render edges (per target index)
//!                                 +--> analysis branch (on demand)
//!                                 +--> bitmap branch
//!
//! *** analysis branch ***
//!
//! --> (motion) --> (export_gate) --> (scale) --> [fork_export]
//!                                                   |
//!                                     on-demand shared-memory terminals
//!
//! *** bitmap branch ***
//!
//! --> (bitmap_gate) --> (interval) --> (scale) --> [fork_bitmap]
//!                                                   |
//!                                     on-demand shared-memory terminals
//! ```
//!
//! Branches activate lazily from client counts; the recording branch is
//! wired by [`LivePipeline::set_recording`].

use crate::adapter::{DecoderAdapter, RecorderSink, RenderSink, SourceAdapter, StreamContext};
use crate::config::StreamConfig;
use crate::counter::{BranchCounters, BranchKind, Transition};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::graph::{FilterGraph, NodeId};
use crate::group::AttrValue;
use crate::motion::{MotionDetector, MotionEvent};
use crate::pipeline::{DeliveryTarget, FrameInput, PipelineState, RecordPolicy};
use crate::shmem::{ExportTerminal, TerminalHandle};
use crate::transform::{FrameInterval, Scaler};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// The active recording attachment, at most one per pipeline.
struct RecordingAttachment {
    policy: RecordPolicy,
    recorder: Arc<Mutex<dyn RecorderSink>>,
    correlation_id: i64,
    terminal: NodeId,
}

struct LiveInner {
    cfg: StreamConfig,
    graph: FilterGraph,
    counters: BranchCounters,

    // graph landmarks
    main_fanout: NodeId,
    record_fanout: NodeId,
    record_gate: NodeId,
    decode_fanout: NodeId,
    motion_entry: NodeId,
    export_gate: NodeId,
    export_fanout: NodeId,
    bitmap_gate: NodeId,
    bitmap_fanout: NodeId,

    // adapters; taken out for the blocking wait at close
    source: Option<Box<dyn SourceAdapter>>,
    decoder: Option<Box<dyn DecoderAdapter>>,
    render_targets: Vec<Box<dyn RenderSink>>,
    render_edges: Vec<Option<NodeId>>,

    recording: Option<RecordingAttachment>,
    export_terminals: HashMap<String, (NodeId, TerminalHandle)>,
    bitmap_terminals: HashMap<String, (NodeId, TerminalHandle)>,
    terminal_seq: u64,

    motion_callback: Option<Box<dyn Fn(MotionEvent) + Send>>,
    state: PipelineState,
}

/// A complete frame-distribution graph for one live stream.
///
/// All operations are serialized through one internal mutex; calls may
/// arrive concurrently from any number of threads. Frame delivery from
/// the source and decoder adapters goes through the same mutex, so
/// topology changes never race with routing.
pub struct LivePipeline {
    slot: usize,
    id: i64,
    address: String,
    inner: Arc<Mutex<LiveInner>>,
}

impl LivePipeline {
    /// Build the graph, register the stream, and start the adapters.
    ///
    /// On any adapter failure the already-started adapters are stopped
    /// again and the error is returned; a half-started pipeline is never
    /// observable.
    pub fn new(
        cfg: StreamConfig,
        source: Box<dyn SourceAdapter>,
        mut decoder: Box<dyn DecoderAdapter>,
        render_targets: Vec<Box<dyn RenderSink>>,
    ) -> Result<Arc<Self>> {
        let slot = cfg.slot;
        let mut graph = FilterGraph::new();

        // main branch
        let main_fanout = graph.add_fanout(format!("fork_main_{slot}"));

        // recording branch: gate closed until a recording is attached
        let record_fanout = graph.add_fanout(format!("fork_record_{slot}"));
        let record_gate =
            graph.add_gate(format!("record_gate_{slot}"), false, Some(record_fanout));
        graph.attach_edge(main_fanout, &format!("record_{slot}"), record_gate)?;

        // decode branch
        let decoder_in = graph.add_terminal(format!("decoder_in_{slot}"), decoder.frame_sink());
        graph.attach_edge(main_fanout, &format!("decode_{slot}"), decoder_in)?;
        let decode_fanout = graph.add_fanout(format!("fork_decode_{slot}"));

        // analysis branch, detached from the decode fan-out until needed
        let export_fanout = graph.add_fanout(format!("fork_export_{slot}"));
        let export_scale = graph.add_scale(
            format!("export_scale_{slot}"),
            Scaler::new(cfg.terminal.width, cfg.terminal.height),
            Some(export_fanout),
        );
        let export_gate =
            graph.add_gate(format!("export_gate_{slot}"), false, Some(export_scale));
        let motion_entry = graph.add_motion(
            format!("motion_{slot}"),
            MotionDetector::new(cfg.motion),
            Some(export_gate),
        );

        // bitmap branch: permanently attached, flow controlled by its gate
        let bitmap_fanout = graph.add_fanout(format!("fork_bitmap_{slot}"));
        let bitmap_scale = graph.add_scale(
            format!("bitmap_scale_{slot}"),
            Scaler::new(cfg.terminal.width, cfg.terminal.height),
            Some(bitmap_fanout),
        );
        let bitmap_interval = graph.add_interval(
            format!("bitmap_interval_{slot}"),
            FrameInterval::new(cfg.bitmap_interval),
            Some(bitmap_scale),
        );
        let bitmap_gate =
            graph.add_gate(format!("bitmap_gate_{slot}"), false, Some(bitmap_interval));
        graph.attach_edge(decode_fanout, &format!("bitmap_{slot}"), bitmap_gate)?;

        let render_edges = vec![None; render_targets.len()];
        let identity = (cfg.address.clone(), cfg.id);

        let inner = Arc::new(Mutex::new(LiveInner {
            cfg,
            graph,
            counters: BranchCounters::new(),
            main_fanout,
            record_fanout,
            record_gate,
            decode_fanout,
            motion_entry,
            export_gate,
            export_fanout,
            bitmap_gate,
            bitmap_fanout,
            source: None,
            decoder: None,
            render_targets,
            render_edges,
            recording: None,
            export_terminals: HashMap::new(),
            bitmap_terminals: HashMap::new(),
            terminal_seq: 0,
            motion_callback: None,
            state: PipelineState::Started,
        }));

        let target: Arc<dyn DeliveryTarget> = inner.clone();
        let weak: Weak<dyn DeliveryTarget> = Arc::downgrade(&target);
        let decode_output = FrameInput::new(weak.clone(), decode_fanout);
        let main_input = FrameInput::new(weak, main_fanout);

        // adapter bring-up happens outside the pipeline lock: a worker is
        // free to deliver frames the moment it starts
        decoder.connect_output(decode_output);
        if let Err(e) = decoder.start() {
            inner.lock().unwrap().state = PipelineState::Closed;
            return Err(e);
        }

        let mut source = source;
        let ctx = {
            let g = inner.lock().unwrap();
            StreamContext {
                slot,
                address: g.cfg.address.clone(),
                request_tcp: g.cfg.request_tcp,
                recv_buffer_size: g.cfg.recv_buffer_size,
                reordering_time: g.cfg.reordering_time,
                reconnect: g.cfg.reconnect,
                input: main_input,
            }
        };
        if let Err(e) = source.register_stream(ctx).and_then(|_| source.start()) {
            decoder.request_stop();
            if let Err(stop_err) = decoder.wait_stop() {
                warn!(slot, error = %stop_err, "decoder stop failed during unwind");
            }
            inner.lock().unwrap().state = PipelineState::Closed;
            return Err(e);
        }

        {
            let mut g = inner.lock().unwrap();
            g.decoder = Some(decoder);
            g.source = Some(source);
        }

        let (address, id) = identity;
        debug!(slot, id, %address, "live pipeline started");
        Ok(Arc::new(Self {
            slot,
            id,
            address,
            inner,
        }))
    }

    /// Stream slot number.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Persistent device id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Stream address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Look up a named attribute, for group searches.
    pub fn attribute(&self, key: &str) -> Option<AttrValue> {
        match key {
            "address" => Some(AttrValue::Str(self.address.clone())),
            "slot" => Some(AttrValue::Int(self.slot as i64)),
            "id" => Some(AttrValue::Int(self.id)),
            _ => None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        self.inner.lock().unwrap().state
    }

    // *** client calculators ***

    /// Adjust the number of clients that need decoded frames.
    ///
    /// The decoder runs exactly while the count is positive.
    pub fn add_decode_client(&self, delta: i32) {
        self.inner.lock().unwrap().adjust(BranchKind::Decode, delta);
    }

    /// Adjust the number of clients that need the movement detector.
    ///
    /// The analysis edge is attached to the decode fan-out exactly while
    /// the count is positive. Implies a decode client.
    pub fn add_analysis_client(&self, delta: i32) {
        self.inner.lock().unwrap().adjust(BranchKind::Analysis, delta);
    }

    /// Adjust the number of clients that need scaled export frames.
    ///
    /// The export gate is open exactly while the count is positive.
    /// Implies an analysis client (and so a decode client).
    pub fn add_export_client(&self, delta: i32) {
        self.inner.lock().unwrap().adjust(BranchKind::Export, delta);
    }

    /// Adjust the number of clients that need the bitmap branch.
    ///
    /// The bitmap gate is open exactly while the count is positive.
    pub fn add_bitmap_client(&self, delta: i32) {
        self.inner.lock().unwrap().adjust(BranchKind::Bitmap, delta);
    }

    /// Adjust the number of viewers on one render target.
    ///
    /// The target's edge on the decode fan-out exists exactly while the
    /// count is positive. Implies a decode client.
    pub fn add_presentation_client(&self, index: usize, delta: i32) -> Result<()> {
        let mut g = self.inner.lock().unwrap();
        if index >= g.render_targets.len() {
            return Err(Error::UnknownRenderTarget(index));
        }
        g.adjust(BranchKind::Presentation(index), delta);
        Ok(())
    }

    // *** recording ***

    /// Attach a recording, replacing any existing attachment first.
    ///
    /// Wires the recorder's sink onto the recording branch and maps the
    /// stream to a recorder input under `correlation_id`. `Always` opens
    /// the gate immediately; `OnMovement` takes an analysis client and
    /// lets movement events drive the gate; `Never` wires everything but
    /// keeps the gate shut.
    pub fn set_recording(
        &self,
        policy: RecordPolicy,
        recorder: Arc<Mutex<dyn RecorderSink>>,
        correlation_id: i64,
    ) -> Result<()> {
        let mut g = self.inner.lock().unwrap();
        if g.recording.is_some() {
            g.clear_recording()?;
        }

        let slot = g.cfg.slot;
        let record_fanout = g.record_fanout;
        let record_gate = g.record_gate;
        let sink = recorder.lock().unwrap().frame_sink();
        let terminal = g.graph.add_terminal(format!("recorder_{slot}"), sink);
        if let Err(e) = g
            .graph
            .attach_edge(record_fanout, &format!("recorder_{slot}"), terminal)
        {
            g.graph.remove(terminal);
            return Err(e);
        }

        match policy {
            RecordPolicy::Always => g.graph.set_gate(record_gate, true)?,
            RecordPolicy::OnMovement => g.adjust(BranchKind::Analysis, 1),
            RecordPolicy::Never => {}
        }

        if let Err(e) = recorder.lock().unwrap().set_input(correlation_id, slot) {
            // unwind to the unattached state
            match policy {
                RecordPolicy::Always => {
                    let _ = g.graph.set_gate(record_gate, false);
                }
                RecordPolicy::OnMovement => g.adjust(BranchKind::Analysis, -1),
                RecordPolicy::Never => {}
            }
            g.graph.detach_edge(record_fanout, &format!("recorder_{slot}"));
            g.graph.remove(terminal);
            return Err(e);
        }

        debug!(slot, ?policy, correlation_id, "recording attached");
        g.recording = Some(RecordingAttachment {
            policy,
            recorder,
            correlation_id,
            terminal,
        });
        Ok(())
    }

    /// Detach the current recording. No-op without one.
    pub fn clear_recording(&self) -> Result<()> {
        self.inner.lock().unwrap().clear_recording()
    }

    /// Check whether a recording attachment exists.
    pub fn is_recording(&self) -> bool {
        self.inner.lock().unwrap().recording.is_some()
    }

    /// Policy of the current recording attachment, if any.
    pub fn record_policy(&self) -> Option<RecordPolicy> {
        self.inner.lock().unwrap().recording.as_ref().map(|a| a.policy)
    }

    // *** motion events ***

    /// Feed an external movement event into the pipeline.
    ///
    /// This is the entry point for out-of-process motion detectors; the
    /// built-in detector on the analysis branch arrives here too. Under
    /// an `OnMovement` recording the event drives the recording gate.
    pub fn motion_event(&self, start: bool, at: Duration) {
        self.inner
            .lock()
            .unwrap()
            .handle_motion_event(MotionEvent { start, at });
    }

    /// Register a callback observing every movement event.
    ///
    /// The callback runs behind a panic barrier; a failing callback is
    /// logged and never disturbs frame delivery or gate state.
    pub fn on_motion(&self, callback: impl Fn(MotionEvent) + Send + 'static) {
        self.inner.lock().unwrap().motion_callback = Some(Box::new(callback));
    }

    // *** shared-memory terminals ***

    /// Allocate a new export terminal and attach it to the export
    /// fan-out.
    ///
    /// The first terminal activates the whole analysis branch. The
    /// returned handle carries the unique name used to release the
    /// terminal and everything a consumer needs to map the ring.
    pub fn acquire_export_terminal(&self) -> Result<TerminalHandle> {
        let mut g = self.inner.lock().unwrap();
        if g.state != PipelineState::Started {
            return Err(Error::Closed);
        }
        let handle = g.acquire_terminal(TerminalBranch::Export)?;
        g.adjust(BranchKind::Export, 1);
        Ok(handle)
    }

    /// Release an export terminal by name.
    ///
    /// Returns false (and logs) for an unknown name; releasing twice
    /// during a teardown race is expected and harmless.
    pub fn release_export_terminal(&self, name: &str) -> bool {
        let mut g = self.inner.lock().unwrap();
        if !g.release_terminal(TerminalBranch::Export, name) {
            return false;
        }
        g.adjust(BranchKind::Export, -1);
        true
    }

    /// Release every export terminal.
    pub fn release_all_export_terminals(&self) {
        self.inner.lock().unwrap().release_all_terminals(TerminalBranch::Export);
    }

    /// Allocate a terminal on the bitmap branch.
    ///
    /// Same lifecycle as an export terminal, but fed by the interval-
    /// limited bitmap branch and counted against the bitmap gate.
    pub fn acquire_bitmap_terminal(&self) -> Result<TerminalHandle> {
        let mut g = self.inner.lock().unwrap();
        if g.state != PipelineState::Started {
            return Err(Error::Closed);
        }
        let handle = g.acquire_terminal(TerminalBranch::Bitmap)?;
        g.adjust(BranchKind::Bitmap, 1);
        Ok(handle)
    }

    /// Release a bitmap terminal by name.
    pub fn release_bitmap_terminal(&self, name: &str) -> bool {
        let mut g = self.inner.lock().unwrap();
        if !g.release_terminal(TerminalBranch::Bitmap, name) {
            return false;
        }
        g.adjust(BranchKind::Bitmap, -1);
        true
    }

    /// Release every bitmap terminal.
    pub fn release_all_bitmap_terminals(&self) {
        self.inner.lock().unwrap().release_all_terminals(TerminalBranch::Bitmap);
    }

    /// Look up a live export or bitmap terminal by name.
    pub fn terminal_handle(&self, name: &str) -> Option<TerminalHandle> {
        let g = self.inner.lock().unwrap();
        g.export_terminals
            .get(name)
            .or_else(|| g.bitmap_terminals.get(name))
            .map(|(_, handle)| handle.clone())
    }

    // *** lifecycle ***

    /// Request shutdown without blocking.
    ///
    /// Issues stop requests to the decoder and source, clears the
    /// recording attachment, releases every terminal, and detaches all
    /// render edges. Idempotent.
    pub fn request_close(&self) {
        let mut g = self.inner.lock().unwrap();
        if g.state != PipelineState::Started {
            return;
        }
        g.state = PipelineState::Closing;

        if let Some(decoder) = g.decoder.as_mut() {
            decoder.request_stop();
        }
        if let Err(e) = g.clear_recording() {
            warn!(slot = g.cfg.slot, error = %e, "recorder detach failed during close");
        }
        g.release_all_terminals(TerminalBranch::Export);
        g.release_all_terminals(TerminalBranch::Bitmap);
        g.clear_presentation();
        if let Some(source) = g.source.as_mut() {
            source.request_stop();
        }
        debug!(slot = g.cfg.slot, "close requested");
    }

    /// Wait for the adapters to finish stopping.
    ///
    /// Requests close first if that has not happened yet. Adapter stop
    /// failures are surfaced here; the pipeline ends up closed either
    /// way.
    pub fn wait_close(&self) -> Result<()> {
        self.request_close();

        let (decoder, source) = {
            let mut g = self.inner.lock().unwrap();
            if g.state == PipelineState::Closed {
                return Ok(());
            }
            g.state = PipelineState::Closed;
            (g.decoder.take(), g.source.take())
        };

        // the blocking joins happen outside the lock so in-flight
        // deliveries can drain instead of deadlocking
        let mut result = Ok(());
        if let Some(mut decoder) = decoder {
            if let Err(e) = decoder.wait_stop() {
                result = Err(e);
            }
        }
        if let Some(mut source) = source {
            if let Err(e) = source.wait_stop() {
                result = result.and(Err(e));
            }
        }
        result
    }

    /// Two-phase close in one call.
    pub fn close(&self) -> Result<()> {
        self.request_close();
        self.wait_close()
    }

    // *** introspection, mainly for tests and status displays ***

    /// Current decode client count.
    pub fn decode_clients(&self) -> u32 {
        self.inner.lock().unwrap().counters.decode()
    }

    /// Current analysis client count.
    pub fn analysis_clients(&self) -> u32 {
        self.inner.lock().unwrap().counters.analysis()
    }

    /// Current export client count.
    pub fn export_clients(&self) -> u32 {
        self.inner.lock().unwrap().counters.export()
    }

    /// Current bitmap client count.
    pub fn bitmap_clients(&self) -> u32 {
        self.inner.lock().unwrap().counters.bitmap()
    }

    /// Current presentation client count for one render target.
    pub fn presentation_clients(&self, index: usize) -> u32 {
        self.inner.lock().unwrap().counters.presentation(index)
    }

    /// Check whether the analysis edge is attached to the decode fan-out.
    pub fn analysis_attached(&self) -> bool {
        let g = self.inner.lock().unwrap();
        let edge = format!("analysis_{}", g.cfg.slot);
        g.graph.has_edge(g.decode_fanout, &edge)
    }

    /// Check whether the export gate is open.
    pub fn export_gate_open(&self) -> bool {
        let g = self.inner.lock().unwrap();
        g.graph.gate_stats(g.export_gate).is_some_and(|s| s.is_open)
    }

    /// Check whether the recording gate is open.
    pub fn record_gate_open(&self) -> bool {
        let g = self.inner.lock().unwrap();
        g.graph.gate_stats(g.record_gate).is_some_and(|s| s.is_open)
    }

    /// Check whether the bitmap gate is open.
    pub fn bitmap_gate_open(&self) -> bool {
        let g = self.inner.lock().unwrap();
        g.graph.gate_stats(g.bitmap_gate).is_some_and(|s| s.is_open)
    }
}

impl Drop for LivePipeline {
    fn drop(&mut self) {
        // last-resort cleanup; callers should close() and check the result
        self.request_close();
    }
}

impl std::fmt::Debug for LivePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivePipeline")
            .field("slot", &self.slot)
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}

/// Which fan-out a shared-memory terminal hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TerminalBranch {
    Export,
    Bitmap,
}

impl LiveInner {
    /// Apply a counter delta and translate the zero crossings into
    /// topology changes.
    fn adjust(&mut self, branch: BranchKind, delta: i32) {
        let transitions = self.counters.apply(branch, delta);
        for (kind, transition) in transitions {
            match transition {
                Transition::Unchanged => {}
                Transition::Activated => self.activate(kind),
                Transition::Deactivated => self.deactivate(kind),
            }
        }
    }

    fn activate(&mut self, kind: BranchKind) {
        let slot = self.cfg.slot;
        match kind {
            BranchKind::Decode => {
                debug!(slot, "decoding on");
                match self.decoder.as_mut() {
                    Some(decoder) => {
                        if let Err(e) = decoder.set_decoding(true) {
                            warn!(slot, error = %e, "decoder refused to start decoding");
                        }
                    }
                    None => warn!(slot, "decode demand on a closed pipeline"),
                }
            }
            BranchKind::Analysis => {
                debug!(slot, "attaching analysis branch");
                let edge = format!("analysis_{slot}");
                if let Err(e) = self.graph.attach_edge(self.decode_fanout, &edge, self.motion_entry)
                {
                    warn!(slot, error = %e, "analysis attach failed");
                }
            }
            BranchKind::Export => {
                debug!(slot, "opening export gate");
                if let Err(e) = self.graph.set_gate(self.export_gate, true) {
                    warn!(slot, error = %e, "export gate missing");
                }
            }
            BranchKind::Bitmap => {
                debug!(slot, "opening bitmap gate");
                if let Err(e) = self.graph.set_gate(self.bitmap_gate, true) {
                    warn!(slot, error = %e, "bitmap gate missing");
                }
            }
            BranchKind::Presentation(index) => {
                debug!(slot, index, "attaching render edge");
                let sink = self.render_targets[index].frame_sink();
                let node = self.graph.add_terminal(format!("render_{index}_{slot}"), sink);
                let edge = format!("render_{index}");
                if let Err(e) = self.graph.attach_edge(self.decode_fanout, &edge, node) {
                    warn!(slot, index, error = %e, "render attach failed");
                    self.graph.remove(node);
                    return;
                }
                self.render_edges[index] = Some(node);
            }
        }
    }

    fn deactivate(&mut self, kind: BranchKind) {
        let slot = self.cfg.slot;
        match kind {
            BranchKind::Decode => {
                debug!(slot, "decoding off");
                if let Some(decoder) = self.decoder.as_mut() {
                    if let Err(e) = decoder.set_decoding(false) {
                        warn!(slot, error = %e, "decoder refused to stop decoding");
                    }
                }
            }
            BranchKind::Analysis => {
                debug!(slot, "detaching analysis branch");
                self.graph.detach_edge(self.decode_fanout, &format!("analysis_{slot}"));
            }
            BranchKind::Export => {
                debug!(slot, "closing export gate");
                if let Err(e) = self.graph.set_gate(self.export_gate, false) {
                    warn!(slot, error = %e, "export gate missing");
                }
            }
            BranchKind::Bitmap => {
                debug!(slot, "closing bitmap gate");
                if let Err(e) = self.graph.set_gate(self.bitmap_gate, false) {
                    warn!(slot, error = %e, "bitmap gate missing");
                }
            }
            BranchKind::Presentation(index) => {
                debug!(slot, index, "detaching render edge");
                self.graph.detach_edge(self.decode_fanout, &format!("render_{index}"));
                if let Some(node) = self.render_edges[index].take() {
                    self.graph.remove(node);
                }
            }
        }
    }

    fn clear_recording(&mut self) -> Result<()> {
        let Some(attachment) = self.recording.take() else {
            return Ok(());
        };
        let slot = self.cfg.slot;

        match attachment.policy {
            RecordPolicy::Always => {
                if let Err(e) = self.graph.set_gate(self.record_gate, false) {
                    warn!(slot, error = %e, "record gate missing");
                }
            }
            RecordPolicy::OnMovement => {
                self.adjust(BranchKind::Analysis, -1);
                // a half-open movement window must not outlive the
                // attachment that was following it
                if let Err(e) = self.graph.set_gate(self.record_gate, false) {
                    warn!(slot, error = %e, "record gate missing");
                }
            }
            RecordPolicy::Never => {}
        }

        let result = attachment.recorder.lock().unwrap().clear_input(slot);
        self.graph.detach_edge(self.record_fanout, &format!("recorder_{slot}"));
        self.graph.remove(attachment.terminal);
        debug!(slot, correlation_id = attachment.correlation_id, "recording detached");
        result
    }

    fn handle_motion_event(&mut self, event: MotionEvent) {
        if let Some(attachment) = &self.recording {
            if attachment.policy == RecordPolicy::OnMovement {
                if let Err(e) = self.graph.set_gate(self.record_gate, event.start) {
                    warn!(slot = self.cfg.slot, error = %e, "record gate missing");
                }
            }
        }
        if let Some(callback) = &self.motion_callback {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!(slot = self.cfg.slot, "motion callback panicked");
            }
        }
    }

    fn acquire_terminal(&mut self, branch: TerminalBranch) -> Result<TerminalHandle> {
        let (tag, fanout) = match branch {
            TerminalBranch::Export => ("export", self.export_fanout),
            TerminalBranch::Bitmap => ("bitmap", self.bitmap_fanout),
        };
        let name = format!("{}_{}_{}_{}", self.cfg.id, self.cfg.slot, tag, self.terminal_seq);
        self.terminal_seq += 1;

        let terminal = ExportTerminal::new(
            &name,
            self.cfg.terminal.n_slots,
            self.cfg.terminal.width,
            self.cfg.terminal.height,
        )?;
        let handle = terminal.handle();
        let node = self.graph.add_terminal(&name, Box::new(terminal));
        if let Err(e) = self.graph.attach_edge(fanout, &name, node) {
            self.graph.remove(node);
            return Err(e);
        }

        debug!(slot = self.cfg.slot, terminal = %name, "terminal reserved");
        match branch {
            TerminalBranch::Export => self.export_terminals.insert(name, (node, handle.clone())),
            TerminalBranch::Bitmap => self.bitmap_terminals.insert(name, (node, handle.clone())),
        };
        Ok(handle)
    }

    fn release_terminal(&mut self, branch: TerminalBranch, name: &str) -> bool {
        let (terminals, fanout) = match branch {
            TerminalBranch::Export => (&mut self.export_terminals, self.export_fanout),
            TerminalBranch::Bitmap => (&mut self.bitmap_terminals, self.bitmap_fanout),
        };
        let Some((node, _)) = terminals.remove(name) else {
            warn!(slot = self.cfg.slot, terminal = name, "release of unknown terminal");
            return false;
        };
        self.graph.detach_edge(fanout, name);
        self.graph.remove(node);
        debug!(slot = self.cfg.slot, terminal = name, "terminal released");
        true
    }

    fn release_all_terminals(&mut self, branch: TerminalBranch) {
        let names: Vec<String> = match branch {
            TerminalBranch::Export => self.export_terminals.keys().cloned().collect(),
            TerminalBranch::Bitmap => self.bitmap_terminals.keys().cloned().collect(),
        };
        let kind = match branch {
            TerminalBranch::Export => BranchKind::Export,
            TerminalBranch::Bitmap => BranchKind::Bitmap,
        };
        for name in names {
            if self.release_terminal(branch, &name) {
                self.adjust(kind, -1);
            }
        }
    }

    fn clear_presentation(&mut self) {
        for index in 0..self.render_targets.len() {
            let count = self.counters.presentation(index);
            if count > 0 {
                self.adjust(BranchKind::Presentation(index), -(count as i32));
            }
        }
    }
}

impl DeliveryTarget for Mutex<LiveInner> {
    fn deliver(&self, root: NodeId, frame: Frame) {
        let mut g = self.lock().unwrap();
        let mut events = Vec::new();
        g.graph.deliver(root, frame, &mut events);
        for event in events {
            g.handle_motion_event(event);
        }
    }
}

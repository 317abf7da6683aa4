//! The playback pipeline.
//!
//! The playback flavor of the distribution graph, fed by an external
//! recording cacher instead of a live source:
//!
//! ```text
//! cacher ->> [fork_main] ->> decoder ->> [fork_decode] --+--> render edges
//! ```
//!
//! Frames enter through the handle returned by
//! [`PlaybackPipeline::input`]. Recording, analysis, and bitmap branches
//! do not exist here; decode and presentation clients behave exactly as
//! on the live flavor.

use crate::adapter::{DecoderAdapter, RenderSink};
use crate::config::PlaybackConfig;
use crate::counter::{BranchCounters, BranchKind, Transition};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::graph::{FilterGraph, NodeId};
use crate::group::AttrValue;
use crate::pipeline::{DeliveryTarget, FrameInput, PipelineState};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

struct PlaybackInner {
    slot: usize,
    graph: FilterGraph,
    counters: BranchCounters,
    decode_fanout: NodeId,
    decoder: Option<Box<dyn DecoderAdapter>>,
    render_targets: Vec<Box<dyn RenderSink>>,
    render_edges: Vec<Option<NodeId>>,
    state: PipelineState,
}

/// A frame-distribution graph for one playback slot.
pub struct PlaybackPipeline {
    slot: usize,
    id: i64,
    inner: Arc<Mutex<PlaybackInner>>,
    input: FrameInput,
}

impl PlaybackPipeline {
    /// Build the graph and start the decoder.
    pub fn new(
        cfg: PlaybackConfig,
        mut decoder: Box<dyn DecoderAdapter>,
        render_targets: Vec<Box<dyn RenderSink>>,
    ) -> Result<Arc<Self>> {
        let slot = cfg.slot;
        let mut graph = FilterGraph::new();

        let main_fanout = graph.add_fanout(format!("fork_main_{slot}"));
        let decoder_in = graph.add_terminal(format!("decoder_in_{slot}"), decoder.frame_sink());
        graph.attach_edge(main_fanout, &format!("decode_{slot}"), decoder_in)?;
        let decode_fanout = graph.add_fanout(format!("fork_decode_{slot}"));

        let render_edges = vec![None; render_targets.len()];
        let inner = Arc::new(Mutex::new(PlaybackInner {
            slot,
            graph,
            counters: BranchCounters::new(),
            decode_fanout,
            decoder: None,
            render_targets,
            render_edges,
            state: PipelineState::Started,
        }));

        let target: Arc<dyn DeliveryTarget> = inner.clone();
        let weak: Weak<dyn DeliveryTarget> = Arc::downgrade(&target);
        let decode_output = FrameInput::new(weak.clone(), decode_fanout);
        let input = FrameInput::new(weak, main_fanout);

        decoder.connect_output(decode_output);
        if let Err(e) = decoder.start() {
            inner.lock().unwrap().state = PipelineState::Closed;
            return Err(e);
        }
        inner.lock().unwrap().decoder = Some(decoder);

        debug!(slot, id = cfg.id, "playback pipeline started");
        Ok(Arc::new(Self {
            slot,
            id: cfg.id,
            inner,
            input,
        }))
    }

    /// Playback slot number.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Persistent device id of the recording.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Look up a named attribute, for group searches.
    pub fn attribute(&self, key: &str) -> Option<AttrValue> {
        match key {
            "slot" => Some(AttrValue::Int(self.slot as i64)),
            "id" => Some(AttrValue::Int(self.id)),
            _ => None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        self.inner.lock().unwrap().state
    }

    /// Where the external cacher delivers this slot's frames.
    pub fn input(&self) -> FrameInput {
        self.input.clone()
    }

    /// Adjust the number of clients that need decoded frames.
    pub fn add_decode_client(&self, delta: i32) {
        self.inner.lock().unwrap().adjust(BranchKind::Decode, delta);
    }

    /// Adjust the number of viewers on one render target.
    pub fn add_presentation_client(&self, index: usize, delta: i32) -> Result<()> {
        let mut g = self.inner.lock().unwrap();
        if index >= g.render_targets.len() {
            return Err(Error::UnknownRenderTarget(index));
        }
        g.adjust(BranchKind::Presentation(index), delta);
        Ok(())
    }

    /// Current decode client count.
    pub fn decode_clients(&self) -> u32 {
        self.inner.lock().unwrap().counters.decode()
    }

    /// Current presentation client count for one render target.
    pub fn presentation_clients(&self, index: usize) -> u32 {
        self.inner.lock().unwrap().counters.presentation(index)
    }

    /// Request shutdown without blocking. Idempotent.
    pub fn request_close(&self) {
        let mut g = self.inner.lock().unwrap();
        if g.state != PipelineState::Started {
            return;
        }
        g.state = PipelineState::Closing;
        if let Some(decoder) = g.decoder.as_mut() {
            decoder.request_stop();
        }
        g.clear_presentation();
        debug!(slot = g.slot, "close requested");
    }

    /// Wait for the decoder to finish stopping.
    pub fn wait_close(&self) -> Result<()> {
        self.request_close();
        let decoder = {
            let mut g = self.inner.lock().unwrap();
            if g.state == PipelineState::Closed {
                return Ok(());
            }
            g.state = PipelineState::Closed;
            g.decoder.take()
        };
        match decoder {
            Some(mut decoder) => decoder.wait_stop(),
            None => Ok(()),
        }
    }

    /// Two-phase close in one call.
    pub fn close(&self) -> Result<()> {
        self.request_close();
        self.wait_close()
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        // last-resort cleanup; callers should close() and check the result
        self.request_close();
    }
}

impl std::fmt::Debug for PlaybackPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackPipeline")
            .field("slot", &self.slot)
            .field("id", &self.id)
            .finish()
    }
}

impl PlaybackInner {
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
        match kind {
            BranchKind::Decode => {
                debug!(slot = self.slot, "decoding on");
                match self.decoder.as_mut() {
                    Some(decoder) => {
                        if let Err(e) = decoder.set_decoding(true) {
                            warn!(slot = self.slot, error = %e, "decoder refused to start decoding");
                        }
                    }
                    None => warn!(slot = self.slot, "decode demand on a closed pipeline"),
                }
            }
            BranchKind::Presentation(index) => {
                debug!(slot = self.slot, index, "attaching render edge");
                let sink = self.render_targets[index].frame_sink();
                let node = self
                    .graph
                    .add_terminal(format!("render_{}_{}", index, self.slot), sink);
                if let Err(e) = self
                    .graph
                    .attach_edge(self.decode_fanout, &format!("render_{index}"), node)
                {
                    warn!(slot = self.slot, index, error = %e, "render attach failed");
                    self.graph.remove(node);
                    return;
                }
                self.render_edges[index] = Some(node);
            }
            // playback has no analysis, export, or bitmap branch
            _ => warn!(slot = self.slot, ?kind, "branch not present on playback"),
        }
    }

    fn deactivate(&mut self, kind: BranchKind) {
        match kind {
            BranchKind::Decode => {
                debug!(slot = self.slot, "decoding off");
                if let Some(decoder) = self.decoder.as_mut() {
                    if let Err(e) = decoder.set_decoding(false) {
                        warn!(slot = self.slot, error = %e, "decoder refused to stop decoding");
                    }
                }
            }
            BranchKind::Presentation(index) => {
                debug!(slot = self.slot, index, "detaching render edge");
                self.graph
                    .detach_edge(self.decode_fanout, &format!("render_{index}"));
                if let Some(node) = self.render_edges[index].take() {
                    self.graph.remove(node);
                }
            }
            _ => {}
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

impl DeliveryTarget for Mutex<PlaybackInner> {
    fn deliver(&self, root: NodeId, frame: Frame) {
        let mut g = self.lock().unwrap();
        let mut events = Vec::new();
        g.graph.deliver(root, frame, &mut events);
        debug_assert!(events.is_empty(), "playback graph has no motion nodes");
    }
}

//! # Manifold
//!
//! Runtime-mutable frame distribution graphs for multi-stream video
//! pipelines.
//!
//! Manifold routes decoded and raw video frames from one source to a
//! variable set of consumers (screen renderers, shared-memory export
//! terminals, recorders, motion analyzers) through a per-stream graph
//! whose branches turn on and off lazily with subscriber demand.
//!
//! ## Features
//!
//! - **Fan-out / gate primitives**: named, runtime-mutable edges;
//!   frames clone in O(1) across edges
//! - **Reference-counted branches**: a branch is active exactly while
//!   its client count is positive, with cascaded upstream demand
//! - **Shared-memory export terminals**: memfd-backed frame rings
//!   consumed out-of-band by analyzer processes
//! - **Demand-driven recording**: always / on-movement / never policies
//!   over an externally owned recorder
//! - **Parallel group shutdown**: stop requests fan out to every
//!   pipeline before any is waited on
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use manifold::prelude::*;
//!
//! let pipeline = LivePipeline::new(
//!     StreamConfig::new("rtsp://cam1.local/stream", 1, 42),
//!     source,   // your SourceAdapter
//!     decoder,  // your DecoderAdapter
//!     render_targets,
//! )?;
//!
//! // a viewer appears on display 0
//! pipeline.add_presentation_client(0, 1)?;
//!
//! // an analyzer wants scaled frames via shared memory
//! let terminal = pipeline.acquire_export_terminal()?;
//! // hand terminal.name / terminal.fd to the analyzer process...
//!
//! pipeline.close()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod adapter;
pub mod config;
pub mod counter;
pub mod error;
pub mod frame;
pub mod graph;
pub mod group;
pub mod motion;
pub mod pipeline;
pub mod shmem;
pub mod sink;
pub mod testing;
pub mod transform;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::adapter::{DecoderAdapter, RecorderSink, RenderSink, SourceAdapter};
    pub use crate::config::{PlaybackConfig, StreamConfig, TerminalConfig};
    pub use crate::error::{Error, Result};
    pub use crate::frame::{Frame, FrameMeta, PixelFormat};
    pub use crate::group::{PipelineFactory, PipelineGroup};
    pub use crate::motion::{MotionConfig, MotionEvent};
    pub use crate::pipeline::{LivePipeline, PipelineState, PlaybackPipeline, RecordPolicy};
    pub use crate::shmem::TerminalHandle;
    pub use crate::sink::FrameSink;
}

pub use error::{Error, Result};

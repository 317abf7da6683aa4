//! Error types for Manifold.

use thiserror::Error;

/// Result type alias using Manifold's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Manifold operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An edge with this name is already attached to the fan-out node.
    #[error("edge '{edge}' already attached to fan-out '{node}'")]
    DuplicateEdge {
        /// Name of the fan-out node.
        node: String,
        /// Name of the offending edge.
        edge: String,
    },

    /// No edge with this name is attached to the fan-out node.
    #[error("no edge '{edge}' on fan-out '{node}'")]
    UnknownEdge {
        /// Name of the fan-out node.
        node: String,
        /// Name of the missing edge.
        edge: String,
    },

    /// The operation requires a fan-out node.
    #[error("node '{0}' is not a fan-out")]
    NotAFanOut(String),

    /// The operation requires a gate node.
    #[error("node '{0}' is not a gate")]
    NotAGate(String),

    /// No render target registered for this index.
    #[error("no render target with index {0}")]
    UnknownRenderTarget(usize),

    /// A frame was rejected by a transform or terminal.
    #[error("frame rejected: {0}")]
    BadFrame(String),

    /// An external adapter failed a lifecycle call.
    #[error("adapter error: {0}")]
    Adapter(String),

    /// The pipeline has already been closed.
    #[error("pipeline is closed")]
    Closed,

    /// Shared memory allocation failed.
    #[error("shared memory allocation failed: {0}")]
    AllocationFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

//! Pipeline construction parameters.
//!
//! Everything the surrounding application used to keep in ambient
//! registries is passed in explicitly through these structs; the core
//! holds no process-wide state.

use crate::motion::MotionConfig;
use std::time::Duration;

/// Geometry of on-demand export terminals.
#[derive(Debug, Clone, Copy)]
pub struct TerminalConfig {
    /// Number of frame slots per terminal ring.
    pub n_slots: usize,
    /// Width frames are scaled to before export.
    pub width: u32,
    /// Height frames are scaled to before export.
    pub height: u32,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        // quarter 1080p, the classic analysis resolution
        Self {
            n_slots: 10,
            width: 1920 / 4,
            height: 1080 / 4,
        }
    }
}

/// Construction parameters for one live stream pipeline.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Stream address (e.g. an rtsp:// URL or a device path).
    pub address: String,
    /// Stream slot number, unique within the process.
    pub slot: usize,
    /// Persistent identity of the device behind the stream.
    pub id: i64,
    /// Prefer TCP transport.
    pub request_tcp: bool,
    /// OS socket receive buffer size in bytes; 0 means default.
    pub recv_buffer_size: usize,
    /// Packet reordering window; zero means default.
    pub reordering_time: Duration,
    /// Reconnect after this much silence; `None` disables reconnection.
    pub reconnect: Option<Duration>,
    /// Export terminal geometry.
    pub terminal: TerminalConfig,
    /// Movement detection parameters.
    pub motion: MotionConfig,
    /// Minimum spacing of frames on the bitmap branch.
    pub bitmap_interval: Duration,
}

impl StreamConfig {
    /// Create a config with defaults for the given identity.
    pub fn new(address: impl Into<String>, slot: usize, id: i64) -> Self {
        Self {
            address: address.into(),
            slot,
            id,
            request_tcp: false,
            recv_buffer_size: 0,
            reordering_time: Duration::ZERO,
            reconnect: Some(Duration::from_millis(10_000)),
            terminal: TerminalConfig::default(),
            motion: MotionConfig::default(),
            bitmap_interval: Duration::from_millis(500),
        }
    }

    /// Set the export terminal geometry.
    pub fn with_terminal(mut self, terminal: TerminalConfig) -> Self {
        self.terminal = terminal;
        self
    }

    /// Set the movement detection parameters.
    pub fn with_motion(mut self, motion: MotionConfig) -> Self {
        self.motion = motion;
        self
    }

    /// Prefer TCP transport.
    pub fn with_tcp(mut self) -> Self {
        self.request_tcp = true;
        self
    }
}

/// Construction parameters for one playback pipeline.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Playback slot number, unique within the process.
    pub slot: usize,
    /// Persistent identity of the recording's device.
    pub id: i64,
}

impl PlaybackConfig {
    /// Create a playback config.
    pub fn new(slot: usize, id: i64) -> Self {
        Self { slot, id }
    }
}

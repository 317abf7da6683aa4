//! Movement detection over decoded frames.
//!
//! The detector samples the luma channel at a fixed interval, compares it
//! against the previous sample, and opens a pass-through window for a
//! configurable duration whenever the mean delta crosses a threshold.
//! Window transitions are reported as [`MotionEvent`]s so a recording
//! gate (or an external observer) can follow them.

use crate::frame::{Frame, PixelFormat};
use std::time::{Duration, Instant};

/// Sample every Nth pixel when computing the luma delta.
const SAMPLE_STEP: usize = 4;

/// Movement detection parameters.
#[derive(Debug, Clone, Copy)]
pub struct MotionConfig {
    /// Minimum spacing between analyzed frames; frames in between are
    /// dropped from the analysis branch.
    pub interval: Duration,
    /// Mean absolute luma delta (0.0 - 1.0) at which movement starts.
    /// Zero means every analyzed frame counts as movement.
    pub threshold: f32,
    /// How long frames keep passing after the last detected movement.
    pub duration: Duration,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            threshold: 0.0,
            duration: Duration::from_millis(30_000),
        }
    }
}

/// A movement window transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionEvent {
    /// True when a movement window opens, false when it closes.
    pub start: bool,
    /// Stream timestamp of the frame that triggered the transition.
    pub at: Duration,
}

/// Detects movement between consecutive frames of one stream.
pub struct MotionDetector {
    cfg: MotionConfig,
    epoch: Instant,
    last_check: Option<Duration>,
    /// Timestamp of the most recent movement, if a window is open.
    movement_at: Option<Duration>,
    prev: Option<LumaSample>,
}

struct LumaSample {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl MotionDetector {
    /// Create a detector with the given parameters.
    pub fn new(cfg: MotionConfig) -> Self {
        Self {
            cfg,
            epoch: Instant::now(),
            last_check: None,
            movement_at: None,
            prev: None,
        }
    }

    /// Check if a movement window is currently open.
    pub fn in_movement(&self) -> bool {
        self.movement_at.is_some()
    }

    /// Process one frame.
    ///
    /// Returns whether the frame passes downstream, plus a window
    /// transition event when one occurred on this frame.
    pub fn process(&mut self, frame: &Frame) -> (bool, Option<MotionEvent>) {
        let t = frame.meta().pts.unwrap_or_else(|| self.epoch.elapsed());

        // analysis rate limit; frames in between never pass
        if let Some(last) = self.last_check {
            if t >= last && t - last < self.cfg.interval {
                return (false, None);
            }
        }
        self.last_check = Some(t);

        let moving = self.measure(frame);

        let mut event = None;
        if moving {
            if self.movement_at.is_none() {
                event = Some(MotionEvent { start: true, at: t });
            }
            self.movement_at = Some(t);
        } else if let Some(since) = self.movement_at {
            if t < since || t - since >= self.cfg.duration {
                self.movement_at = None;
                event = Some(MotionEvent { start: false, at: t });
            }
        }

        (self.movement_at.is_some(), event)
    }

    /// Compare the frame's luma against the previous sample.
    fn measure(&mut self, frame: &Frame) -> bool {
        let meta = frame.meta();
        let (w, h) = (meta.width, meta.height);
        let luma_len = (w * h) as usize;
        if luma_len == 0 || frame.len() < luma_len {
            return false;
        }
        // Yuv420: the Y plane leads the payload. Rgb24: green carries most
        // of the luma; sampling one channel is close enough here.
        let cur: Vec<u8> = match meta.format {
            PixelFormat::Yuv420 => frame.as_bytes()[..luma_len]
                .iter()
                .step_by(SAMPLE_STEP)
                .copied()
                .collect(),
            PixelFormat::Rgb24 => frame
                .as_bytes()
                .iter()
                .skip(1)
                .step_by(3 * SAMPLE_STEP)
                .copied()
                .collect(),
            PixelFormat::Encoded => return false,
        };

        let moving = match &self.prev {
            Some(prev) if prev.width == w && prev.height == h && prev.data.len() == cur.len() => {
                let total: u64 = prev
                    .data
                    .iter()
                    .zip(cur.iter())
                    .map(|(&a, &b)| a.abs_diff(b) as u64)
                    .sum();
                let delta = total as f32 / (cur.len().max(1) as f32 * 255.0);
                delta >= self.cfg.threshold
            }
            // first frame, or a resolution change: no basis for comparison
            _ => self.cfg.threshold <= 0.0,
        };

        self.prev = Some(LumaSample {
            width: w,
            height: h,
            data: cur,
        });
        moving
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameMeta;
    use bytes::Bytes;

    fn frame(pts_ms: u64, fill: u8) -> Frame {
        let size = PixelFormat::Yuv420.frame_size(8, 8).unwrap();
        Frame::new(
            Bytes::from(vec![fill; size]),
            FrameMeta::with_sequence(pts_ms)
                .with_video(PixelFormat::Yuv420, 8, 8)
                .with_pts(Duration::from_millis(pts_ms)),
        )
    }

    fn detector(threshold: f32, interval_ms: u64, duration_ms: u64) -> MotionDetector {
        MotionDetector::new(MotionConfig {
            interval: Duration::from_millis(interval_ms),
            threshold,
            duration: Duration::from_millis(duration_ms),
        })
    }

    #[test]
    fn test_zero_threshold_passes_everything_analyzed() {
        let mut d = detector(0.0, 100, 1000);
        let (pass, event) = d.process(&frame(0, 10));
        assert!(pass);
        assert_eq!(event, Some(MotionEvent { start: true, at: Duration::ZERO }));
        let (pass, event) = d.process(&frame(100, 10));
        assert!(pass);
        assert!(event.is_none());
    }

    #[test]
    fn test_interval_gates_analysis() {
        let mut d = detector(0.0, 100, 1000);
        assert!(d.process(&frame(0, 0)).0);
        // too close to the previous analyzed frame
        assert!(!d.process(&frame(50, 0)).0);
        assert!(d.process(&frame(100, 0)).0);
    }

    #[test]
    fn test_movement_window_opens_and_closes() {
        let mut d = detector(0.05, 100, 1000);

        // identical frames: no movement
        assert!(!d.process(&frame(0, 100)).0);
        let (pass, event) = d.process(&frame(100, 100));
        assert!(!pass);
        assert!(event.is_none());

        // large luma jump: movement starts
        let (pass, event) = d.process(&frame(200, 200));
        assert!(pass);
        assert_eq!(
            event,
            Some(MotionEvent { start: true, at: Duration::from_millis(200) })
        );
        assert!(d.in_movement());

        // still within the duration window, frame itself static
        let (pass, event) = d.process(&frame(300, 200));
        assert!(pass);
        assert!(event.is_none());

        // past the window with no further movement: closes
        let (pass, event) = d.process(&frame(1300, 200));
        assert!(!pass);
        assert_eq!(
            event,
            Some(MotionEvent { start: false, at: Duration::from_millis(1300) })
        );
        assert!(!d.in_movement());
    }

    #[test]
    fn test_movement_retriggers_window() {
        let mut d = detector(0.05, 100, 500);
        d.process(&frame(0, 0));
        assert!(d.process(&frame(100, 200)).0); // start
        assert!(d.process(&frame(400, 0)).0); // retrigger at 400
        // 400 + 500 > 800: still open
        assert!(d.process(&frame(800, 200)).0);
    }
}

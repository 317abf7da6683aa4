//! In-graph frame transforms: rescaling and rate limiting.
//!
//! Both transforms run synchronously on the producer's thread, so neither
//! is allowed to sleep: the interval filter limits rate by dropping
//! frames, not by delaying them.

use crate::error::{Error, Result};
use crate::frame::{Frame, PixelFormat};
use bytes::Bytes;
use std::time::{Duration, Instant};

// ============================================================================
// Scaler
// ============================================================================

/// Scaling interpolation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleMode {
    /// Bilinear interpolation (smoother, slower).
    #[default]
    Bilinear,
    /// Nearest neighbor (faster, pixelated).
    NearestNeighbor,
}

/// Rescales raw video frames to fixed target dimensions.
///
/// Source dimensions are taken from each frame's metadata, so one scaler
/// serves a stream whose input resolution changes mid-flight. Frames
/// already at the target size pass through without copying.
#[derive(Debug)]
pub struct Scaler {
    dst_width: u32,
    dst_height: u32,
    mode: ScaleMode,
    frames_processed: u64,
}

impl Scaler {
    /// Create a scaler with the given target dimensions.
    pub fn new(dst_width: u32, dst_height: u32) -> Self {
        Self {
            dst_width,
            dst_height,
            mode: ScaleMode::default(),
            frames_processed: 0,
        }
    }

    /// Set the interpolation mode.
    pub fn with_mode(mut self, mode: ScaleMode) -> Self {
        self.mode = mode;
        self
    }

    /// Get target dimensions.
    pub fn dst_dimensions(&self) -> (u32, u32) {
        (self.dst_width, self.dst_height)
    }

    /// Get the number of frames processed.
    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Scale one frame to the target dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadFrame`] for encoded payloads, zero-sized source
    /// dimensions, or payloads smaller than the source dimensions imply.
    pub fn apply(&mut self, frame: &Frame) -> Result<Frame> {
        let meta = frame.meta();
        let (sw, sh) = (meta.width, meta.height);

        if sw == 0 || sh == 0 {
            return Err(Error::BadFrame("frame has no dimensions".into()));
        }
        let expected = meta
            .format
            .frame_size(sw, sh)
            .ok_or_else(|| Error::BadFrame("cannot scale an encoded frame".into()))?;
        if frame.len() < expected {
            return Err(Error::BadFrame(format!(
                "payload too small: {} < {} (expected for {}x{})",
                frame.len(),
                expected,
                sw,
                sh
            )));
        }

        self.frames_processed += 1;

        if sw == self.dst_width && sh == self.dst_height {
            return Ok(frame.clone());
        }

        let input = &frame.as_bytes()[..expected];
        let output = match meta.format {
            PixelFormat::Yuv420 => self.scale_yuv420(input, sw, sh),
            PixelFormat::Rgb24 => self.scale_rgb24(input, sw, sh),
            PixelFormat::Encoded => unreachable!("rejected above"),
        };

        let mut out_meta = meta.clone();
        out_meta.width = self.dst_width;
        out_meta.height = self.dst_height;
        Ok(Frame::new(Bytes::from(output), out_meta))
    }

    /// Scale a YUV420 planar payload. Each plane is scaled independently.
    fn scale_yuv420(&self, input: &[u8], sw: u32, sh: u32) -> Vec<u8> {
        let (dw, dh) = (self.dst_width, self.dst_height);

        let src_y = (sw * sh) as usize;
        let (suw, suh) = (sw / 2, sh / 2);
        let src_uv = (suw * suh) as usize;

        let dst_y = (dw * dh) as usize;
        let (duw, duh) = (dw / 2, dh / 2);
        let dst_uv = (duw * duh) as usize;

        let mut output = vec![0u8; dst_y + 2 * dst_uv];

        let planes = [
            (&input[..src_y], sw, sh, 0, dst_y, dw, dh),
            (&input[src_y..src_y + src_uv], suw, suh, dst_y, dst_uv, duw, duh),
            (
                &input[src_y + src_uv..src_y + 2 * src_uv],
                suw,
                suh,
                dst_y + dst_uv,
                dst_uv,
                duw,
                duh,
            ),
        ];
        for (src, psw, psh, off, len, pdw, pdh) in planes {
            let dst = &mut output[off..off + len];
            match self.mode {
                ScaleMode::Bilinear => scale_plane_bilinear(src, psw, psh, dst, pdw, pdh),
                ScaleMode::NearestNeighbor => scale_plane_nearest(src, psw, psh, dst, pdw, pdh),
            }
        }
        output
    }

    /// Scale an interleaved RGB24 payload.
    fn scale_rgb24(&self, input: &[u8], sw: u32, sh: u32) -> Vec<u8> {
        let (dw, dh) = (self.dst_width, self.dst_height);
        let mut output = vec![0u8; (dw * dh * 3) as usize];

        let x_ratio = sw as f32 / dw as f32;
        let y_ratio = sh as f32 / dh as f32;

        match self.mode {
            ScaleMode::NearestNeighbor => {
                for dy in 0..dh {
                    let sy = (((dy as f32 + 0.5) * y_ratio) as u32).min(sh - 1);
                    for dx in 0..dw {
                        let sx = (((dx as f32 + 0.5) * x_ratio) as u32).min(sw - 1);
                        let s = ((sy * sw + sx) * 3) as usize;
                        let d = ((dy * dw + dx) * 3) as usize;
                        output[d..d + 3].copy_from_slice(&input[s..s + 3]);
                    }
                }
            }
            ScaleMode::Bilinear => {
                for dy in 0..dh {
                    let sy_f = dy as f32 * y_ratio;
                    let sy0 = sy_f.floor() as u32;
                    let sy1 = (sy0 + 1).min(sh - 1);
                    let yf = sy_f - sy0 as f32;
                    for dx in 0..dw {
                        let sx_f = dx as f32 * x_ratio;
                        let sx0 = sx_f.floor() as u32;
                        let sx1 = (sx0 + 1).min(sw - 1);
                        let xf = sx_f - sx0 as f32;
                        for c in 0..3usize {
                            let p00 = input[((sy0 * sw + sx0) * 3) as usize + c] as f32;
                            let p10 = input[((sy0 * sw + sx1) * 3) as usize + c] as f32;
                            let p01 = input[((sy1 * sw + sx0) * 3) as usize + c] as f32;
                            let p11 = input[((sy1 * sw + sx1) * 3) as usize + c] as f32;
                            let top = p00 * (1.0 - xf) + p10 * xf;
                            let bottom = p01 * (1.0 - xf) + p11 * xf;
                            let value = top * (1.0 - yf) + bottom * yf;
                            output[((dy * dw + dx) * 3) as usize + c] = value.round() as u8;
                        }
                    }
                }
            }
        }
        output
    }
}

/// Bilinear interpolation for a single plane.
fn scale_plane_bilinear(src: &[u8], sw: u32, sh: u32, dst: &mut [u8], dw: u32, dh: u32) {
    let x_ratio = sw as f32 / dw as f32;
    let y_ratio = sh as f32 / dh as f32;

    for dy in 0..dh {
        let sy_f = dy as f32 * y_ratio;
        let sy0 = sy_f.floor() as u32;
        let sy1 = (sy0 + 1).min(sh - 1);
        let yf = sy_f - sy0 as f32;

        for dx in 0..dw {
            let sx_f = dx as f32 * x_ratio;
            let sx0 = sx_f.floor() as u32;
            let sx1 = (sx0 + 1).min(sw - 1);
            let xf = sx_f - sx0 as f32;

            let p00 = src[(sy0 * sw + sx0) as usize] as f32;
            let p10 = src[(sy0 * sw + sx1) as usize] as f32;
            let p01 = src[(sy1 * sw + sx0) as usize] as f32;
            let p11 = src[(sy1 * sw + sx1) as usize] as f32;

            let top = p00 * (1.0 - xf) + p10 * xf;
            let bottom = p01 * (1.0 - xf) + p11 * xf;
            let value = top * (1.0 - yf) + bottom * yf;

            dst[(dy * dw + dx) as usize] = value.round() as u8;
        }
    }
}

/// Nearest neighbor scaling for a single plane.
fn scale_plane_nearest(src: &[u8], sw: u32, sh: u32, dst: &mut [u8], dw: u32, dh: u32) {
    let x_ratio = sw as f32 / dw as f32;
    let y_ratio = sh as f32 / dh as f32;

    for dy in 0..dh {
        let sy = (((dy as f32 + 0.5) * y_ratio) as u32).min(sh - 1);
        for dx in 0..dw {
            let sx = (((dx as f32 + 0.5) * x_ratio) as u32).min(sw - 1);
            dst[(dy * dw + dx) as usize] = src[(sy * sw + sx) as usize];
        }
    }
}

// ============================================================================
// FrameInterval
// ============================================================================

/// Drops frames arriving faster than a fixed interval.
///
/// The frame's presentation timestamp drives the decision; frames without
/// one fall back to a wall clock relative to this filter's creation.
#[derive(Debug)]
pub struct FrameInterval {
    interval: Duration,
    epoch: Instant,
    last: Option<Duration>,
    passed: u64,
    dropped: u64,
}

impl FrameInterval {
    /// Create an interval filter. An interval of zero passes everything.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            epoch: Instant::now(),
            last: None,
            passed: 0,
            dropped: 0,
        }
    }

    /// Decide whether a frame passes. Updates internal state.
    pub fn pass(&mut self, frame: &Frame) -> bool {
        let t = frame.meta().pts.unwrap_or_else(|| self.epoch.elapsed());
        let ok = match self.last {
            Some(last) => t < last || t - last >= self.interval,
            None => true,
        };
        if ok {
            self.last = Some(t);
            self.passed += 1;
        } else {
            self.dropped += 1;
        }
        ok
    }

    /// Frames passed so far.
    pub fn passed(&self) -> u64 {
        self.passed
    }

    /// Frames dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameMeta;

    fn raw(seq: u64, w: u32, h: u32, format: PixelFormat, pts_ms: u64) -> Frame {
        let size = format.frame_size(w, h).unwrap();
        Frame::new(
            Bytes::from(vec![seq as u8; size]),
            FrameMeta::with_sequence(seq)
                .with_video(format, w, h)
                .with_pts(Duration::from_millis(pts_ms)),
        )
    }

    #[test]
    fn test_scaler_noop_passthrough() {
        let mut scaler = Scaler::new(4, 4);
        let frame = raw(0, 4, 4, PixelFormat::Yuv420, 0);
        let out = scaler.apply(&frame).unwrap();
        assert_eq!(out.as_bytes().as_ptr(), frame.as_bytes().as_ptr());
        assert_eq!(scaler.frames_processed(), 1);
    }

    #[test]
    fn test_scaler_yuv_downscale() {
        let mut scaler = Scaler::new(2, 2);
        let frame = raw(0, 4, 4, PixelFormat::Yuv420, 0);
        let out = scaler.apply(&frame).unwrap();
        // 2x2 YUV420: Y=4, U=1, V=1
        assert_eq!(out.len(), 6);
        assert_eq!(out.meta().width, 2);
        assert_eq!(out.meta().height, 2);
    }

    #[test]
    fn test_scaler_rgb_upscale() {
        let mut scaler = Scaler::new(4, 4).with_mode(ScaleMode::NearestNeighbor);
        let frame = raw(0, 2, 2, PixelFormat::Rgb24, 0);
        let out = scaler.apply(&frame).unwrap();
        assert_eq!(out.len(), 48);
        // nearest neighbor of a constant image is constant
        assert!(out.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_scaler_rejects_encoded() {
        let mut scaler = Scaler::new(2, 2);
        let frame = Frame::new(
            Bytes::from(vec![0u8; 100]),
            FrameMeta::with_sequence(0).with_video(PixelFormat::Encoded, 4, 4),
        );
        assert!(scaler.apply(&frame).is_err());
    }

    #[test]
    fn test_scaler_rejects_short_payload() {
        let mut scaler = Scaler::new(2, 2);
        let frame = Frame::new(
            Bytes::from(vec![0u8; 4]),
            FrameMeta::with_sequence(0).with_video(PixelFormat::Yuv420, 640, 480),
        );
        assert!(scaler.apply(&frame).is_err());
    }

    #[test]
    fn test_interval_drops_fast_frames() {
        let mut filter = FrameInterval::new(Duration::from_millis(100));
        assert!(filter.pass(&raw(0, 2, 2, PixelFormat::Rgb24, 0)));
        assert!(!filter.pass(&raw(1, 2, 2, PixelFormat::Rgb24, 50)));
        assert!(filter.pass(&raw(2, 2, 2, PixelFormat::Rgb24, 100)));
        assert!(!filter.pass(&raw(3, 2, 2, PixelFormat::Rgb24, 199)));
        assert!(filter.pass(&raw(4, 2, 2, PixelFormat::Rgb24, 250)));
        assert_eq!(filter.passed(), 3);
        assert_eq!(filter.dropped(), 2);
    }

    #[test]
    fn test_interval_timestamp_jump_backwards() {
        // a stream restart resets timestamps; the filter must recover
        let mut filter = FrameInterval::new(Duration::from_millis(100));
        assert!(filter.pass(&raw(0, 2, 2, PixelFormat::Rgb24, 5000)));
        assert!(filter.pass(&raw(1, 2, 2, PixelFormat::Rgb24, 10)));
    }
}

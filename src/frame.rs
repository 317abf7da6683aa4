//! Frame and metadata types.

use bytes::Bytes;
use std::time::Duration;

/// Pixel layout of a frame payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PixelFormat {
    /// Opaque compressed payload, as delivered by a source before decoding.
    #[default]
    Encoded,
    /// Planar YUV 4:2:0, Y plane then U then V.
    Yuv420,
    /// Interleaved 8-bit RGB.
    Rgb24,
}

impl PixelFormat {
    /// Payload size in bytes for a raw frame of the given dimensions.
    ///
    /// Returns `None` for [`PixelFormat::Encoded`], whose size is not a
    /// function of the dimensions.
    pub fn frame_size(&self, width: u32, height: u32) -> Option<usize> {
        match self {
            PixelFormat::Encoded => None,
            PixelFormat::Yuv420 => {
                let y = (width * height) as usize;
                let uv = ((width / 2) * (height / 2)) as usize;
                Some(y + 2 * uv)
            }
            PixelFormat::Rgb24 => Some((width * height * 3) as usize),
        }
    }
}

/// Metadata associated with a frame.
#[derive(Debug, Clone, Default)]
pub struct FrameMeta {
    /// Presentation timestamp, relative to the stream epoch.
    pub pts: Option<Duration>,
    /// Monotonic sequence number within the stream.
    pub sequence: u64,
    /// Frame width in pixels (0 if unknown, e.g. before decoding).
    pub width: u32,
    /// Frame height in pixels (0 if unknown).
    pub height: u32,
    /// Pixel layout of the payload.
    pub format: PixelFormat,
    /// Frame is a sync point (keyframe equivalent).
    pub sync_point: bool,
}

impl FrameMeta {
    /// Create metadata with a sequence number.
    pub fn with_sequence(sequence: u64) -> Self {
        Self {
            sequence,
            ..Default::default()
        }
    }

    /// Set the presentation timestamp.
    pub fn with_pts(mut self, pts: Duration) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Set the pixel format and dimensions.
    pub fn with_video(mut self, format: PixelFormat, width: u32, height: u32) -> Self {
        self.format = format;
        self.width = width;
        self.height = height;
        self
    }

    /// Mark as a sync point.
    pub fn with_sync_point(mut self) -> Self {
        self.sync_point = true;
        self
    }
}

/// A video frame moving through a distribution graph.
///
/// The payload is reference counted; `Clone` is O(1) and never copies
/// pixel data, which keeps fan-out duplication cheap on the delivery path.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    payload: Bytes,
    meta: FrameMeta,
}

impl Frame {
    /// Create a new frame from a payload and its metadata.
    pub fn new(payload: Bytes, meta: FrameMeta) -> Self {
        Self { payload, meta }
    }

    /// Get a reference to the frame's metadata.
    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    /// Get a mutable reference to the frame's metadata.
    pub fn meta_mut(&mut self) -> &mut FrameMeta {
        &mut self.meta
    }

    /// Get the payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Get the payload as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_builder() {
        let meta = FrameMeta::with_sequence(42)
            .with_pts(Duration::from_millis(100))
            .with_video(PixelFormat::Rgb24, 640, 480);

        assert_eq!(meta.sequence, 42);
        assert_eq!(meta.pts, Some(Duration::from_millis(100)));
        assert_eq!(meta.width, 640);
        assert_eq!(meta.format, PixelFormat::Rgb24);
        assert!(!meta.sync_point);
    }

    #[test]
    fn test_frame_clone_shares_payload() {
        let frame = Frame::new(Bytes::from(vec![1u8, 2, 3]), FrameMeta::with_sequence(7));
        let copy = frame.clone();
        assert_eq!(frame.as_bytes().as_ptr(), copy.as_bytes().as_ptr());
        assert_eq!(copy.meta().sequence, 7);
    }

    #[test]
    fn test_frame_sizes() {
        assert_eq!(PixelFormat::Yuv420.frame_size(640, 480), Some(460800));
        assert_eq!(PixelFormat::Rgb24.frame_size(4, 4), Some(48));
        assert_eq!(PixelFormat::Encoded.frame_size(640, 480), None);
    }
}

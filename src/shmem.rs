//! Shared-memory export terminals.
//!
//! An export terminal is a named ring of fixed-size frame slots backed by
//! anonymous shared memory (`memfd_create`). The owning pipeline writes
//! frames into the ring on the delivery path; an external analyzer or GUI
//! process maps the same memory and reads frames out-of-band. The
//! terminal's [`TerminalHandle`] (name + file descriptor + geometry) is
//! the entire handoff contract; no frame ever crosses a function call
//! boundary to the consumer.
//!
//! Layout: a 64-byte segment header (magic, geometry, a volatile write
//! counter) followed by `n_slots` slots, each a 32-byte slot header plus
//! `slot_size` payload bytes. The writer bumps the counter after every
//! completed slot, so a polling reader always knows the most recent slot.

use crate::error::{Error, Result};
use crate::frame::{Frame, PixelFormat};
use crate::sink::FrameSink;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;
use tracing::warn;

const SEGMENT_MAGIC: u64 = 0x4d4e_464c_4430_3031; // "MNFLD001"
const SEGMENT_HEADER_LEN: usize = 64;
const SLOT_HEADER_LEN: usize = 32;

// ============================================================================
// SharedSegment
// ============================================================================

/// A memory segment backed by Linux memfd (anonymous shared memory).
///
/// The segment is shared with other processes by passing the file
/// descriptor (`SCM_RIGHTS` over a Unix socket, or inheritance); the
/// kernel reclaims the memory once every reference is closed.
pub struct SharedSegment {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
}

impl SharedSegment {
    /// Create a new shared memory segment.
    ///
    /// # Errors
    ///
    /// Returns an error if `memfd_create`, `ftruncate`, or `mmap` fails,
    /// or if `size` is zero.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed("size must be greater than 0".into()));
        }

        let cname = CString::new(name).map_err(|e| Error::AllocationFailed(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        Ok(Self { fd, ptr, len: size })
    }

    /// Map an existing segment from a raw file descriptor.
    ///
    /// The fd is duplicated, so the original stays valid and the segment
    /// keeps its own reference.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `fd` is a live memfd of at least
    /// `size` bytes.
    pub unsafe fn from_raw_fd(fd: RawFd, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed("size must be greater than 0".into()));
        }
        let fd = rustix::io::fcntl_dupfd_cloexec(unsafe { BorrowedFd::borrow_raw(fd) }, 0)?;

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        Ok(Self { fd, ptr, len: size })
    }

    /// Segment length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the segment is empty (it never is; kept for symmetry).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw file descriptor, for handing to another process.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn slice_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr/len describe a live mapping owned exclusively by
        // self on the writer side.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    fn read_counter(&self, offset: usize) -> u64 {
        debug_assert!(offset + 8 <= self.len && offset % 8 == 0);
        // SAFETY: bounds and alignment checked above; volatile because
        // another mapping may be writing concurrently.
        unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(offset).cast::<u64>()) }
    }

    fn write_counter(&mut self, offset: usize, value: u64) {
        debug_assert!(offset + 8 <= self.len && offset % 8 == 0);
        // SAFETY: as above.
        unsafe { std::ptr::write_volatile(self.ptr.as_ptr().add(offset).cast::<u64>(), value) }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact region we mapped; fd closes with
        // the OwnedFd.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

impl AsFd for SharedSegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

// SAFETY: the mapping is plain shared memory with no thread affinity;
// the fd is reference-counted by the kernel.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

// ============================================================================
// Slot metadata
// ============================================================================

/// Metadata of one frame slot in an export ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMeta {
    /// Payload length in bytes.
    pub len: u32,
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
    /// Pixel format of the payload.
    pub format: PixelFormat,
    /// Stream sequence number of the frame.
    pub sequence: u64,
    /// Presentation timestamp in milliseconds, -1 when absent.
    pub pts_ms: i64,
}

fn format_code(format: PixelFormat) -> u32 {
    match format {
        PixelFormat::Encoded => 0,
        PixelFormat::Yuv420 => 1,
        PixelFormat::Rgb24 => 2,
    }
}

fn format_from_code(code: u32) -> PixelFormat {
    match code {
        1 => PixelFormat::Yuv420,
        2 => PixelFormat::Rgb24,
        _ => PixelFormat::Encoded,
    }
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(buf[offset..offset + 8].try_into().unwrap())
}

// header field offsets
const H_MAGIC: usize = 0;
const H_NSLOTS: usize = 8;
const H_SLOT_SIZE: usize = 12;
const H_WIDTH: usize = 16;
const H_HEIGHT: usize = 20;
const H_WRITTEN: usize = 24;

// slot field offsets
const S_LEN: usize = 0;
const S_WIDTH: usize = 4;
const S_HEIGHT: usize = 8;
const S_FORMAT: usize = 12;
const S_SEQUENCE: usize = 16;
const S_PTS: usize = 24;

fn slot_offset(idx: usize, slot_size: usize) -> usize {
    SEGMENT_HEADER_LEN + idx * (SLOT_HEADER_LEN + slot_size)
}

// ============================================================================
// TerminalHandle
// ============================================================================

/// Out-of-band description of an export terminal.
///
/// Everything a consumer needs to map the ring: the globally unique
/// terminal name, the memfd, the total mapping size, and the slot
/// geometry. The fd stays valid while the owning terminal is alive;
/// consumers that outlive it must duplicate the fd first (which
/// [`ExportReader::open`] does).
#[derive(Debug, Clone)]
pub struct TerminalHandle {
    /// Globally unique terminal name.
    pub name: String,
    /// Raw memfd of the backing segment.
    pub fd: RawFd,
    /// Total segment size in bytes.
    pub size: usize,
    /// Number of frame slots in the ring.
    pub n_slots: usize,
    /// Payload capacity of each slot in bytes.
    pub slot_size: usize,
    /// Frame width the ring was sized for.
    pub width: u32,
    /// Frame height the ring was sized for.
    pub height: u32,
}

// ============================================================================
// ExportTerminal
// ============================================================================

/// Writer side of a shared-memory frame ring.
pub struct ExportTerminal {
    name: String,
    segment: SharedSegment,
    n_slots: usize,
    slot_size: usize,
    width: u32,
    height: u32,
    written: u64,
    dropped: u64,
}

impl ExportTerminal {
    /// Create a terminal sized for `n_slots` frames of `width`×`height`.
    ///
    /// Slots are sized for RGB24, the largest raw format the analysis
    /// branch produces; smaller payloads (YUV420) fit with room to spare.
    pub fn new(name: impl Into<String>, n_slots: usize, width: u32, height: u32) -> Result<Self> {
        let name = name.into();
        if n_slots == 0 {
            return Err(Error::AllocationFailed("terminal needs at least one slot".into()));
        }
        let slot_size = (width as usize) * (height as usize) * 3;
        let size = SEGMENT_HEADER_LEN + n_slots * (SLOT_HEADER_LEN + slot_size);

        let mut segment = SharedSegment::new(&name, size)?;
        {
            let buf = segment.slice_mut();
            write_u64(buf, H_MAGIC, SEGMENT_MAGIC);
            write_u32(buf, H_NSLOTS, n_slots as u32);
            write_u32(buf, H_SLOT_SIZE, slot_size as u32);
            write_u32(buf, H_WIDTH, width);
            write_u32(buf, H_HEIGHT, height);
            write_u64(buf, H_WRITTEN, 0);
        }

        Ok(Self {
            name,
            segment,
            n_slots,
            slot_size,
            width,
            height,
            written: 0,
            dropped: 0,
        })
    }

    /// The terminal's globally unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frames written into the ring so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Frames rejected (oversized payloads).
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Get the out-of-band handle for consumers.
    pub fn handle(&self) -> TerminalHandle {
        TerminalHandle {
            name: self.name.clone(),
            fd: self.segment.as_raw_fd(),
            size: self.segment.len(),
            n_slots: self.n_slots,
            slot_size: self.slot_size,
            width: self.width,
            height: self.height,
        }
    }

    /// Write one frame into the next ring slot.
    pub fn write(&mut self, frame: &Frame) -> Result<()> {
        let payload = frame.as_bytes();
        if payload.len() > self.slot_size {
            self.dropped += 1;
            return Err(Error::BadFrame(format!(
                "payload {} exceeds slot capacity {}",
                payload.len(),
                self.slot_size
            )));
        }

        let meta = frame.meta();
        let idx = (self.written % self.n_slots as u64) as usize;
        let offset = slot_offset(idx, self.slot_size);

        let buf = self.segment.slice_mut();
        write_u32(buf, offset + S_LEN, payload.len() as u32);
        write_u32(buf, offset + S_WIDTH, meta.width);
        write_u32(buf, offset + S_HEIGHT, meta.height);
        write_u32(buf, offset + S_FORMAT, format_code(meta.format));
        write_u64(buf, offset + S_SEQUENCE, meta.sequence);
        write_u64(
            buf,
            offset + S_PTS,
            meta.pts.map_or(-1i64, |p| p.as_millis() as i64) as u64,
        );
        buf[offset + SLOT_HEADER_LEN..offset + SLOT_HEADER_LEN + payload.len()]
            .copy_from_slice(payload);

        self.written += 1;
        // publish after the slot contents are in place
        self.segment.write_counter(H_WRITTEN, self.written);
        Ok(())
    }
}

impl FrameSink for ExportTerminal {
    fn consume(&mut self, frame: Frame) -> Result<()> {
        self.write(&frame)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ExportTerminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportTerminal")
            .field("name", &self.name)
            .field("n_slots", &self.n_slots)
            .field("slot_size", &self.slot_size)
            .field("written", &self.written)
            .finish()
    }
}

// ============================================================================
// ExportReader
// ============================================================================

/// Consumer side of a shared-memory frame ring.
///
/// Opens its own mapping over a duplicated fd, so it stays valid even if
/// the writing pipeline releases the terminal afterwards.
pub struct ExportReader {
    segment: SharedSegment,
    n_slots: usize,
    slot_size: usize,
}

impl ExportReader {
    /// Map the ring described by a [`TerminalHandle`].
    ///
    /// Validates the segment magic and geometry before use.
    pub fn open(handle: &TerminalHandle) -> Result<Self> {
        // SAFETY: the handle came from a live ExportTerminal; the fd is
        // duplicated inside from_raw_fd.
        let segment = unsafe { SharedSegment::from_raw_fd(handle.fd, handle.size)? };

        let buf = segment.slice();
        if read_u64(buf, H_MAGIC) != SEGMENT_MAGIC {
            return Err(Error::AllocationFailed("segment magic mismatch".into()));
        }
        let n_slots = read_u32(buf, H_NSLOTS) as usize;
        let slot_size = read_u32(buf, H_SLOT_SIZE) as usize;
        if n_slots != handle.n_slots
            || slot_size != handle.slot_size
            || segment.len() < SEGMENT_HEADER_LEN + n_slots * (SLOT_HEADER_LEN + slot_size)
        {
            return Err(Error::AllocationFailed("segment geometry mismatch".into()));
        }

        Ok(Self {
            segment,
            n_slots,
            slot_size,
        })
    }

    /// Total frames written by the producer so far.
    pub fn written(&self) -> u64 {
        self.segment.read_counter(H_WRITTEN)
    }

    /// Read a slot by ring index.
    pub fn slot(&self, idx: usize) -> Option<(SlotMeta, Vec<u8>)> {
        if idx >= self.n_slots {
            return None;
        }
        let offset = slot_offset(idx, self.slot_size);
        let buf = self.segment.slice();
        let meta = SlotMeta {
            len: read_u32(buf, offset + S_LEN),
            width: read_u32(buf, offset + S_WIDTH),
            height: read_u32(buf, offset + S_HEIGHT),
            format: format_from_code(read_u32(buf, offset + S_FORMAT)),
            sequence: read_u64(buf, offset + S_SEQUENCE),
            pts_ms: read_u64(buf, offset + S_PTS) as i64,
        };
        if meta.len as usize > self.slot_size {
            warn!(slot = idx, len = meta.len, "corrupt slot length");
            return None;
        }
        let payload =
            buf[offset + SLOT_HEADER_LEN..offset + SLOT_HEADER_LEN + meta.len as usize].to_vec();
        Some((meta, payload))
    }

    /// Read the most recently written slot.
    pub fn latest(&self) -> Option<(SlotMeta, Vec<u8>)> {
        let written = self.written();
        if written == 0 {
            return None;
        }
        self.slot(((written - 1) % self.n_slots as u64) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameMeta;
    use bytes::Bytes;
    use std::time::Duration;

    fn rgb_frame(seq: u64, w: u32, h: u32, fill: u8) -> Frame {
        let size = PixelFormat::Rgb24.frame_size(w, h).unwrap();
        Frame::new(
            Bytes::from(vec![fill; size]),
            FrameMeta::with_sequence(seq)
                .with_video(PixelFormat::Rgb24, w, h)
                .with_pts(Duration::from_millis(seq * 40)),
        )
    }

    #[test]
    fn test_terminal_roundtrip() {
        let mut term = ExportTerminal::new("test-roundtrip", 4, 8, 8).unwrap();
        term.write(&rgb_frame(7, 8, 8, 42)).unwrap();

        let reader = ExportReader::open(&term.handle()).unwrap();
        assert_eq!(reader.written(), 1);
        let (meta, payload) = reader.latest().unwrap();
        assert_eq!(meta.sequence, 7);
        assert_eq!(meta.width, 8);
        assert_eq!(meta.format, PixelFormat::Rgb24);
        assert_eq!(meta.pts_ms, 280);
        assert_eq!(payload.len(), 8 * 8 * 3);
        assert!(payload.iter().all(|&b| b == 42));
    }

    #[test]
    fn test_ring_wraparound() {
        let mut term = ExportTerminal::new("test-wrap", 3, 4, 4).unwrap();
        for seq in 0..7 {
            term.write(&rgb_frame(seq, 4, 4, seq as u8)).unwrap();
        }
        let reader = ExportReader::open(&term.handle()).unwrap();
        assert_eq!(reader.written(), 7);
        // frame 6 landed in slot 6 % 3 = 0
        let (meta, _) = reader.latest().unwrap();
        assert_eq!(meta.sequence, 6);
        let (meta, _) = reader.slot(1).unwrap();
        assert_eq!(meta.sequence, 4);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut term = ExportTerminal::new("test-oversize", 2, 4, 4).unwrap();
        let frame = rgb_frame(0, 8, 8, 1); // 192 bytes > 48-byte slots
        assert!(term.write(&frame).is_err());
        assert_eq!(term.written(), 0);
        assert_eq!(term.dropped(), 1);
    }

    #[test]
    fn test_reader_survives_writer_drop() {
        let term = ExportTerminal::new("test-survive", 2, 4, 4).unwrap();
        let handle = term.handle();
        let mut term = term;
        term.write(&rgb_frame(3, 4, 4, 9)).unwrap();

        let reader = ExportReader::open(&handle).unwrap();
        drop(term);
        let (meta, _) = reader.latest().unwrap();
        assert_eq!(meta.sequence, 3);
    }

    #[test]
    fn test_zero_slots_rejected() {
        assert!(ExportTerminal::new("test-zero", 0, 4, 4).is_err());
    }

    #[test]
    fn test_geometry_mismatch_detected() {
        let term = ExportTerminal::new("test-geom", 2, 4, 4).unwrap();
        let mut handle = term.handle();
        handle.n_slots = 99;
        assert!(ExportReader::open(&handle).is_err());
    }
}

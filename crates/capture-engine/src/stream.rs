//! Per-stream shared state: ring buffer, negotiated format, counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::frame::{EncodedFrame, StreamFormat, StreamKind};
use crate::ring_buffer::RingBuffer;

const NO_PTS: i64 = i64::MIN;

/// Runtime statistics for one capture stream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    /// Frames appended to the ring buffer.
    pub frames_buffered: u64,

    /// Frames thrown away because capture was disabled.
    pub frames_discarded: u64,

    /// Payload bytes appended to the ring buffer.
    pub bytes_buffered: u64,
}

impl PipelineStats {
    /// Discard rate as a percentage.
    pub fn discard_rate(&self) -> f64 {
        let total = self.frames_buffered + self.frames_discarded;
        if total == 0 {
            return 0.0;
        }
        self.frames_discarded as f64 / total as f64 * 100.0
    }
}

/// Everything the capture side and the clip assembler share about one
/// stream.
#[derive(Debug)]
pub struct StreamState {
    buffer: RingBuffer,
    format: Mutex<Option<StreamFormat>>,
    last_pts: AtomicI64,
    frames_buffered: AtomicU64,
    frames_discarded: AtomicU64,
    bytes_buffered: AtomicU64,
}

impl StreamState {
    pub fn new(kind: StreamKind, capacity_us: i64) -> Self {
        Self {
            buffer: RingBuffer::new(kind, capacity_us),
            format: Mutex::new(None),
            last_pts: AtomicI64::new(NO_PTS),
            frames_buffered: AtomicU64::new(0),
            frames_discarded: AtomicU64::new(0),
            bytes_buffered: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.buffer.kind()
    }

    pub fn buffer(&self) -> &RingBuffer {
        &self.buffer
    }

    /// Buffer a frame and remember its timestamp.
    pub fn record(&self, frame: EncodedFrame) {
        self.last_pts.store(frame.pts_us(), Ordering::Release);
        self.frames_buffered.fetch_add(1, Ordering::Relaxed);
        self.bytes_buffered
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        self.buffer.append(frame);
    }

    /// Count a frame dropped while capture was disabled.
    pub fn discard(&self) {
        self.frames_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Timestamp of the newest buffered frame, surviving buffer clears.
    pub fn last_pts(&self) -> Option<i64> {
        match self.last_pts.load(Ordering::Acquire) {
            NO_PTS => None,
            pts => Some(pts),
        }
    }

    pub fn format(&self) -> Option<StreamFormat> {
        self.lock_format().clone()
    }

    pub fn set_format(&self, format: StreamFormat) {
        *self.lock_format() = Some(format);
    }

    /// Forget the format and the buffered frames. Used when the stream's
    /// pipeline goes away.
    pub fn reset(&self) {
        *self.lock_format() = None;
        self.buffer.clear();
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames_buffered: self.frames_buffered.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            bytes_buffered: self.bytes_buffered.load(Ordering::Relaxed),
        }
    }

    fn lock_format(&self) -> std::sync::MutexGuard<'_, Option<StreamFormat>> {
        self.format.lock().unwrap_or_else(|p| p.into_inner())
    }
}

//! Duration-bounded store of encoded frames for one stream.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::frame::{EncodedFrame, StreamKind};

/// A bounded, duration-trimmed ring of encoded frames.
///
/// Invariants after every `append`:
/// - `last.pts - first.pts <= capacity_us`
/// - for video, the head frame is a key frame
///
/// Appends come from the owning pipeline thread; snapshots and clears from
/// the control thread. A single mutex guards the deque and is held only
/// for the duration of a push or a copy.
#[derive(Debug)]
pub struct RingBuffer {
    kind: StreamKind,
    capacity_us: i64,
    frames: Mutex<VecDeque<EncodedFrame>>,
}

impl RingBuffer {
    pub fn new(kind: StreamKind, capacity_us: i64) -> Self {
        Self {
            kind,
            capacity_us: capacity_us.max(0),
            frames: Mutex::new(VecDeque::new()),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn capacity_us(&self) -> i64 {
        self.capacity_us
    }

    /// Append a frame, then trim the head.
    pub fn append(&self, frame: EncodedFrame) {
        let mut frames = self.lock();
        frames.push_back(frame);

        while span_of(&frames) > self.capacity_us {
            frames.pop_front();
        }

        // A clip must start on a decodable boundary.
        if self.kind == StreamKind::Video {
            while frames.front().is_some_and(|f| !f.is_key_frame()) {
                frames.pop_front();
            }
        }
    }

    /// The longest run of newest frames whose span is at most `duration_us`.
    ///
    /// The buffer is not modified. Returns an empty vector when the buffer
    /// is empty or `duration_us` is negative.
    pub fn snapshot(&self, duration_us: i64) -> Vec<EncodedFrame> {
        let frames = self.lock();
        let start = suffix_start(&frames, duration_us);
        frames.range(start..).cloned().collect()
    }

    /// Drop every buffered frame.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Time covered by the buffered frames (`last.pts - first.pts`).
    pub fn span_us(&self) -> i64 {
        span_of(&self.lock())
    }

    pub fn first_pts(&self) -> Option<i64> {
        self.lock().front().map(EncodedFrame::pts_us)
    }

    pub fn last_pts(&self) -> Option<i64> {
        self.lock().back().map(EncodedFrame::pts_us)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<EncodedFrame>> {
        // A panicking appender cannot leave the deque half-updated.
        self.frames.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn span_of(frames: &VecDeque<EncodedFrame>) -> i64 {
    match (frames.front(), frames.back()) {
        (Some(first), Some(last)) => last.pts_us() - first.pts_us(),
        _ => 0,
    }
}

/// Index of the oldest frame that still fits within `duration_us` of the
/// newest frame. Equals `frames.len()` when nothing fits.
fn suffix_start(frames: &VecDeque<EncodedFrame>, duration_us: i64) -> usize {
    let Some(last) = frames.back() else {
        return 0;
    };
    if duration_us < 0 {
        return frames.len();
    }
    let newest = last.pts_us();
    let mut start = frames.len() - 1;
    while start > 0 && newest - frames[start - 1].pts_us() <= duration_us {
        start -= 1;
    }
    start
}

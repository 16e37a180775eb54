//! Container writer interface used by the clip assembler.
//!
//! The lifecycle mirrors a typical muxer: open, add tracks, start, write
//! samples, stop, release. `stop` and `release` are separate so a failure
//! in one does not keep the other from running.

use std::path::Path;
use std::sync::Arc;

use rewind_common::error::RewindResult;

use crate::frame::StreamFormat;

/// Index of a track inside an open container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackHandle(pub usize);

/// One sample handed to the container, already rebased.
#[derive(Debug, Clone)]
pub struct Sample {
    pub data: Arc<[u8]>,
    pub pts_us: i64,
    pub key_frame: bool,
}

/// Serializes interleaved audio/video samples into one media file.
pub trait ContainerWriter: Send {
    /// Declare a track. Only valid before `start`.
    fn add_track(&mut self, format: &StreamFormat) -> RewindResult<TrackHandle>;

    /// Begin accepting samples.
    fn start(&mut self) -> RewindResult<()>;

    /// Write one sample to a track.
    fn write_sample(&mut self, track: TrackHandle, sample: Sample) -> RewindResult<()>;

    /// Flush pending data and finish the file.
    fn stop(&mut self) -> RewindResult<()>;

    /// Release OS and library resources.
    fn release(&mut self) -> RewindResult<()>;
}

/// Opens container writers at a path.
pub trait ContainerFactory: Send + Sync {
    fn open(&self, path: &Path) -> RewindResult<Box<dyn ContainerWriter>>;

    /// File extension of the produced containers.
    fn extension(&self) -> &str {
        "mkv"
    }
}

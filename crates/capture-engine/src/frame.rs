//! Encoded media units and the encoder output protocol.

use std::fmt;
use std::sync::Arc;

use rewind_common::error::RewindError;

/// Which elementary stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Video,
    Audio,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Video => f.write_str("video"),
            StreamKind::Audio => f.write_str("audio"),
        }
    }
}

/// A timestamped compressed media unit.
///
/// Frames are immutable once built. The payload is shared, so handing a
/// frame to both the ring buffer and a live clip does not copy it.
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    bytes: Arc<[u8]>,
    pts_us: i64,
    key_frame: bool,
    kind: StreamKind,
}

impl EncodedFrame {
    pub fn new(kind: StreamKind, bytes: impl Into<Arc<[u8]>>, pts_us: i64, key_frame: bool) -> Self {
        Self {
            bytes: bytes.into(),
            pts_us,
            // Every audio unit decodes on its own.
            key_frame: key_frame || kind == StreamKind::Audio,
            kind,
        }
    }

    pub fn video(bytes: impl Into<Arc<[u8]>>, pts_us: i64, key_frame: bool) -> Self {
        Self::new(StreamKind::Video, bytes, pts_us, key_frame)
    }

    pub fn audio(bytes: impl Into<Arc<[u8]>>, pts_us: i64) -> Self {
        Self::new(StreamKind::Audio, bytes, pts_us, true)
    }

    pub fn bytes(&self) -> &Arc<[u8]> {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Presentation timestamp in microseconds since pipeline start.
    pub fn pts_us(&self) -> i64 {
        self.pts_us
    }

    pub fn is_key_frame(&self) -> bool {
        self.key_frame
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }
}

impl fmt::Debug for EncodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedFrame")
            .field("kind", &self.kind)
            .field("pts_us", &self.pts_us)
            .field("key_frame", &self.key_frame)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Negotiated output format of an encoder, expressed as a GStreamer caps
/// string so it can be handed to a muxer unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFormat {
    pub kind: StreamKind,
    pub caps: String,
}

impl StreamFormat {
    pub fn new(kind: StreamKind, caps: impl Into<String>) -> Self {
        Self {
            kind,
            caps: caps.into(),
        }
    }

    /// Interleaved signed 16-bit little-endian PCM.
    pub fn pcm_s16le(sample_rate: u32, channels: u16) -> Self {
        Self::new(
            StreamKind::Audio,
            format!(
                "audio/x-raw,format=S16LE,layout=interleaved,rate={sample_rate},channels={channels}"
            ),
        )
    }
}

/// One unit as it leaves an encoder, before it is stamped with a stream.
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    pub data: Vec<u8>,
    pub pts_us: i64,
    pub key_frame: bool,
    /// Out-of-band codec configuration (SPS/PPS and the like).
    pub codec_config: bool,
}

impl EncodedUnit {
    /// Turn the unit into a bufferable frame. Empty units and codec
    /// configuration units carry no media and yield `None`.
    pub fn into_frame(self, kind: StreamKind) -> Option<EncodedFrame> {
        if self.data.is_empty() || self.codec_config {
            return None;
        }
        Some(EncodedFrame::new(kind, self.data, self.pts_us, self.key_frame))
    }
}

/// What an encoder produced when polled.
#[derive(Debug, Clone)]
pub enum EncoderOutput {
    /// The encoder (re)negotiated its output format.
    FormatChanged(StreamFormat),
    /// An encoded unit is ready.
    Frame(EncodedUnit),
    /// Nothing arrived within the poll timeout.
    Pending,
    /// The encoder drained and will produce nothing more.
    EndOfStream,
}

/// Receiver of pipeline output. Implemented by the engine; called from
/// the pipeline threads.
pub trait FrameSink: Send + Sync {
    /// The stream's encoder reported a new output format.
    fn on_format(&self, format: StreamFormat);

    /// A new encoded frame is available.
    fn on_frame(&self, frame: EncodedFrame);

    /// The stream's pipeline hit a device or codec error and shut down.
    fn on_failure(&self, kind: StreamKind, error: &RewindError);
}

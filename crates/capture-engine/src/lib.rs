//! Rewind Capture Engine
//!
//! Keeps the last few seconds of encoded screen and audio in memory and,
//! when triggered, writes a clip covering a window before and after the
//! trigger.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  ClipCaptureEngine                   │
//! │  ┌──────────────┐              ┌──────────────────┐  │
//! │  │ Video        │              │ Audio            │  │
//! │  │ Pipeline     │              │ Pipeline         │  │
//! │  └──────┬───────┘              └────────┬─────────┘  │
//! │         ▼                               ▼            │
//! │  ┌──────────────┐              ┌──────────────────┐  │
//! │  │ RingBuffer   │              │ RingBuffer       │  │
//! │  └──────┬───────┘              └────────┬─────────┘  │
//! │         └───── snapshot + live ─────────┘            │
//! │                       ▼                              │
//! │              ┌──────────────────┐                    │
//! │              │  ClipAssembler   │──▶ clip_*.mkv      │
//! │              └────────┬─────────┘                    │
//! │                       ▼                              │
//! │              ┌──────────────────┐                    │
//! │              │AnalysisDispatcher│──▶ analysis worker │
//! │              └──────────────────┘                    │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod assembler;
pub mod audio;
pub mod backend;
pub mod container;
pub mod context;
pub mod dispatch;
pub mod encoder;
pub mod engine;
pub mod frame;
pub mod pipeline;
pub mod ring_buffer;
pub mod storage;
pub mod stream;
pub mod video;
pub mod voice;
pub mod window;

pub use assembler::{AssemblerState, ClipAssembler, ClipTicket, FinishedClip};
pub use audio::{AudioCapturePipeline, AudioComponents, AudioPipelineConfig};
pub use container::{ContainerFactory, ContainerWriter, Sample, TrackHandle};
pub use context::{LinkTracker, SourceContext, SourceContextProvider, StaticContext};
pub use dispatch::{AnalysisDispatcher, AnalysisRequest, AnalysisSink, JsonlQueueSink, LogSink};
pub use encoder::{AudioEncoder, AudioSource, PcmAudioEncoder, VideoEncoder};
pub use engine::{ClipCaptureEngine, EngineConfig, EngineParts, EngineStatus};
pub use frame::{EncodedFrame, EncodedUnit, EncoderOutput, FrameSink, StreamFormat, StreamKind};
pub use ring_buffer::RingBuffer;
pub use storage::ClipStorage;
pub use video::VideoCapturePipeline;
pub use voice::{VoiceNote, VoiceNoteRecorder};
pub use window::{CaptureWindow, CaptureWindowController};

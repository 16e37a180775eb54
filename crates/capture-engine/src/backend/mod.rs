//! GStreamer backends for the capture interfaces.
//!
//! Display capture rights are assumed to be granted already; on Wayland
//! the caller hands over a PipeWire node obtained through the portal.

use gstreamer as gst;

use rewind_common::clock::ns_to_us;
use rewind_common::config::AppConfig;
use rewind_common::error::{RewindError, RewindResult};

use crate::audio::AudioComponents;
use crate::encoder::{AudioEncoder, PcmAudioEncoder};

pub mod gst_audio;
pub mod gst_container;
pub mod gst_video;

pub use gst_audio::{GstAudioEncoder, GstAudioSource};
pub use gst_container::{GstContainerFactory, GstContainerWriter};
pub use gst_video::{GstVideoEncoder, VideoEncoderSettings};

/// Where video frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSource {
    /// An X11 display (including XWayland).
    X11 {
        display: Option<String>,
        show_pointer: bool,
    },
    /// A PipeWire screencast node.
    PipeWire { node_id: u32 },
    /// Synthetic test pattern.
    TestPattern,
}

impl VideoSource {
    /// Pick a source for the current session.
    pub fn detect() -> RewindResult<Self> {
        if let Ok(display) = std::env::var("DISPLAY") {
            if !display.is_empty() {
                return Ok(Self::X11 {
                    display: Some(display),
                    show_pointer: true,
                });
            }
        }
        if std::env::var_os("WAYLAND_DISPLAY").is_some() {
            return Err(RewindError::config(
                "Wayland session without XWayland; pass a PipeWire node from the ScreenCast portal",
            ));
        }
        Err(RewindError::config("No display server detected"))
    }

    pub(crate) fn launch_fragment(&self) -> String {
        match self {
            Self::X11 {
                display,
                show_pointer,
            } => {
                let display = display
                    .as_deref()
                    .map(|d| format!(" display-name=\"{d}\""))
                    .unwrap_or_default();
                format!("ximagesrc use-damage=false show-pointer={show_pointer}{display}")
            }
            Self::PipeWire { node_id } => format!("pipewiresrc path={node_id} do-timestamp=true"),
            Self::TestPattern => "videotestsrc is-live=true pattern=smpte".to_string(),
        }
    }

    /// GStreamer elements this source needs.
    pub fn required_elements(&self) -> &'static [&'static str] {
        match self {
            Self::X11 { .. } => &["ximagesrc"],
            Self::PipeWire { .. } => &["pipewiresrc"],
            Self::TestPattern => &["videotestsrc"],
        }
    }
}

/// Where audio samples come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioInput {
    /// A PulseAudio (or pipewire-pulse) source; the default device when
    /// `device` is `None`.
    Pulse { device: Option<String> },
    /// Synthetic sine tone.
    TestTone,
}

impl AudioInput {
    pub(crate) fn launch_fragment(&self) -> String {
        match self {
            Self::Pulse { device: Some(device) } => {
                format!("pulsesrc do-timestamp=true device=\"{device}\"")
            }
            Self::Pulse { device: None } => "pulsesrc do-timestamp=true".to_string(),
            Self::TestTone => "audiotestsrc is-live=true wave=sine freq=440 volume=0.2".to_string(),
        }
    }

    pub fn required_elements(&self) -> &'static [&'static str] {
        match self {
            Self::Pulse { .. } => &["pulsesrc"],
            Self::TestTone => &["audiotestsrc"],
        }
    }
}

/// Elements every capture setup needs regardless of sources.
pub const CORE_ELEMENTS: &[&str] = &[
    "videoconvert",
    "videorate",
    "x264enc",
    "h264parse",
    "appsink",
    "appsrc",
    "audioconvert",
    "audioresample",
    "matroskamux",
    "filesink",
    "wavenc",
];

/// Elements needed by a codec name from the config.
pub fn codec_elements(codec: &str) -> &'static [&'static str] {
    match codec {
        "opus" => &["opusenc"],
        _ => &[],
    }
}

/// Timestamp of an encoded buffer, or `None` when the element left it
/// unset. Such buffers are dropped rather than placed at zero.
pub(crate) fn buffer_pts_us(buffer: &gst::BufferRef) -> Option<i64> {
    buffer.pts().map(|t| ns_to_us(t.nseconds()))
}

/// Build the audio encoder named in the config.
pub fn build_audio_encoder(
    codec: &str,
    sample_rate: u32,
    channels: u16,
) -> RewindResult<Box<dyn AudioEncoder>> {
    match codec {
        "pcm" => Ok(Box::new(PcmAudioEncoder::new(sample_rate, channels))),
        "opus" => Ok(Box::new(GstAudioEncoder::opus(sample_rate, channels))),
        other => Err(RewindError::config(format!("Unknown audio codec '{other}'"))),
    }
}

/// Build the components for one audio capture run.
pub fn build_audio_components(input: &AudioInput, config: &AppConfig) -> RewindResult<AudioComponents> {
    let audio = &config.audio;
    Ok(AudioComponents {
        source: Box::new(GstAudioSource::new(
            input.clone(),
            audio.sample_rate,
            audio.channels,
        )),
        secondary: None,
        encoder: build_audio_encoder(&audio.codec, audio.sample_rate, audio.channels)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_without_pts_has_no_timestamp() {
        gst::init().unwrap();
        let mut buffer = gst::Buffer::with_size(4).unwrap();
        assert_eq!(buffer_pts_us(&buffer), None);
        buffer
            .get_mut()
            .unwrap()
            .set_pts(gst::ClockTime::from_mseconds(40));
        assert_eq!(buffer_pts_us(&buffer), Some(40_000));
    }

    #[test]
    fn test_x11_fragment_names_display() {
        let source = VideoSource::X11 {
            display: Some(":1".into()),
            show_pointer: false,
        };
        assert_eq!(
            source.launch_fragment(),
            "ximagesrc use-damage=false show-pointer=false display-name=\":1\""
        );
    }

    #[test]
    fn test_unknown_codec_is_a_config_error() {
        assert!(build_audio_encoder("pcm", 44_100, 1).is_ok());
        assert!(matches!(
            build_audio_encoder("mp3", 44_100, 1),
            Err(RewindError::Config { .. })
        ));
    }
}

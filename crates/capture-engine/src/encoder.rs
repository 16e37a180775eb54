//! Encoder and audio source interfaces driven by the capture pipelines.
//!
//! Encoders are polled: each pipeline thread asks for the next output with
//! a timeout and reacts to what comes back. Backends that deliver output
//! through callbacks queue it internally and drain the queue here.

use std::time::Duration;

use rewind_common::error::RewindResult;

use crate::frame::{EncodedUnit, EncoderOutput, StreamFormat};

/// A video encoder attached to a live display surface.
pub trait VideoEncoder: Send {
    /// Configure and start the encoder. Errors here are configuration
    /// errors and are returned to whoever started the pipeline.
    fn start(&mut self) -> RewindResult<()>;

    /// Wait up to `timeout` for the next output.
    fn next_output(&mut self, timeout: Duration) -> RewindResult<EncoderOutput>;

    fn stop(&mut self) -> RewindResult<()>;
}

/// A blocking PCM source delivering interleaved signed 16-bit samples.
pub trait AudioSource: Send {
    fn start(&mut self) -> RewindResult<()>;

    /// Fill `buf` with samples. Blocks until the buffer is full or the
    /// source stops; returns the number of samples written, 0 at end.
    fn read(&mut self, buf: &mut [i16]) -> RewindResult<usize>;

    fn stop(&mut self) -> RewindResult<()>;
}

/// An audio encoder fed one PCM chunk at a time.
pub trait AudioEncoder: Send {
    fn start(&mut self) -> RewindResult<()>;

    /// Encode one chunk stamped `pts_us`. Returns whatever outputs the
    /// encoder has ready, possibly none.
    fn encode(&mut self, samples: &[i16], pts_us: i64) -> RewindResult<Vec<EncoderOutput>>;

    fn stop(&mut self) -> RewindResult<()>;
}

/// Passes PCM through unchanged as little-endian S16 frames.
#[derive(Debug)]
pub struct PcmAudioEncoder {
    format: StreamFormat,
    announced: bool,
}

impl PcmAudioEncoder {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            format: StreamFormat::pcm_s16le(sample_rate, channels),
            announced: false,
        }
    }
}

impl AudioEncoder for PcmAudioEncoder {
    fn start(&mut self) -> RewindResult<()> {
        self.announced = false;
        Ok(())
    }

    fn encode(&mut self, samples: &[i16], pts_us: i64) -> RewindResult<Vec<EncoderOutput>> {
        let mut outputs = Vec::with_capacity(2);
        if !self.announced {
            outputs.push(EncoderOutput::FormatChanged(self.format.clone()));
            self.announced = true;
        }
        if !samples.is_empty() {
            let data: Vec<u8> = samples.iter().copied().flat_map(i16::to_le_bytes).collect();
            outputs.push(EncoderOutput::Frame(EncodedUnit {
                data,
                pts_us,
                key_frame: true,
                codec_config: false,
            }));
        }
        Ok(outputs)
    }

    fn stop(&mut self) -> RewindResult<()> {
        Ok(())
    }
}

/// Add `secondary` into `primary` sample by sample, saturating at the i16
/// range. Extra secondary samples are ignored.
pub fn mix_samples(primary: &mut [i16], secondary: &[i16]) {
    for (p, s) in primary.iter_mut().zip(secondary) {
        *p = p.saturating_add(*s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_encoder_announces_format_once() {
        let mut encoder = PcmAudioEncoder::new(48_000, 2);
        encoder.start().unwrap();

        let first = encoder.encode(&[1, -1], 0).unwrap();
        assert_eq!(first.len(), 2);
        assert!(matches!(&first[0], EncoderOutput::FormatChanged(f) if f.caps.contains("rate=48000")));
        match &first[1] {
            EncoderOutput::Frame(unit) => {
                assert_eq!(unit.data, vec![1, 0, 0xff, 0xff]);
                assert!(unit.key_frame);
            }
            other => panic!("unexpected output {other:?}"),
        }

        let second = encoder.encode(&[5], 1_000).unwrap();
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_pcm_encoder_skips_empty_chunks() {
        let mut encoder = PcmAudioEncoder::new(44_100, 1);
        let outputs = encoder.encode(&[], 0).unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(matches!(outputs[0], EncoderOutput::FormatChanged(_)));
    }

    #[test]
    fn test_mixing_saturates() {
        let mut primary = [i16::MAX - 1, i16::MIN + 1, 100, 7];
        mix_samples(&mut primary, &[10, -10, -50]);
        assert_eq!(primary, [i16::MAX, i16::MIN, 50, 7]);
    }
}

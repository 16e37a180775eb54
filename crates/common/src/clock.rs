//! Clock and timestamp utilities for media streams.
//!
//! Every Rewind stream carries presentation timestamps in microseconds
//! relative to its own pipeline start. This module provides:
//! - A sample-counting audio clock that never drifts
//! - Offset measurement between independently based streams

pub const US_PER_SEC: i64 = 1_000_000;

/// Convert milliseconds to microseconds, saturating.
pub fn ms_to_us(ms: u64) -> i64 {
    i64::try_from(ms.saturating_mul(1_000)).unwrap_or(i64::MAX)
}

/// Convert nanoseconds to microseconds.
pub fn ns_to_us(ns: u64) -> i64 {
    (ns / 1_000) as i64
}

/// Convert microseconds to nanoseconds; negative values clamp to zero.
pub fn us_to_ns(us: i64) -> u64 {
    (us.max(0) as u64).saturating_mul(1_000)
}

/// Derives audio presentation timestamps from the number of sample
/// frames fed to the encoder.
///
/// The timestamp of a chunk is computed from the running frame total,
/// not accumulated per chunk, so integer truncation never adds up.
#[derive(Debug, Clone)]
pub struct AudioClock {
    sample_rate: u32,
    channels: u16,
    origin_us: i64,
    frames_encoded: u64,
}

impl AudioClock {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self::starting_at(sample_rate, channels, 0)
    }

    /// A clock whose first chunk is stamped `origin_us`. Used when a
    /// restarted capture continues an earlier timeline.
    pub fn starting_at(sample_rate: u32, channels: u16, origin_us: i64) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            origin_us: origin_us.max(0),
            frames_encoded: 0,
        }
    }

    /// Timestamp for a chunk of `sample_count` interleaved samples, then
    /// advance the clock past it. Empty chunks do not advance the clock.
    pub fn next_pts(&mut self, sample_count: usize) -> i64 {
        let pts = self.current_pts();
        let frames = sample_count as u64 / self.channels as u64;
        self.frames_encoded += frames;
        pts
    }

    /// Timestamp of the next frame to be encoded.
    pub fn current_pts(&self) -> i64 {
        let us = self.frames_encoded as u128 * US_PER_SEC as u128 / self.sample_rate as u128;
        i64::try_from(us)
            .unwrap_or(i64::MAX)
            .saturating_add(self.origin_us)
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    pub fn reset(&mut self) {
        self.frames_encoded = 0;
    }
}

/// Offset between the timestamp bases of two streams.
#[derive(Debug, Clone, Copy)]
pub struct StreamOffset {
    /// Base timestamp of the reference stream (µs).
    pub reference_us: i64,
    /// Base timestamp of the measured stream (µs).
    pub measured_us: i64,
}

impl StreamOffset {
    /// Offset in microseconds (positive = measured starts later).
    pub fn offset_us(&self) -> i64 {
        self.measured_us - self.reference_us
    }

    /// Offset in milliseconds.
    pub fn offset_ms(&self) -> f64 {
        self.offset_us() as f64 / 1_000.0
    }

    /// Whether the offset exceeds an acceptable threshold.
    pub fn exceeds_threshold_ms(&self, threshold_ms: f64) -> bool {
        self.offset_ms().abs() > threshold_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversions() {
        assert_eq!(ms_to_us(1_500), 1_500_000);
        assert_eq!(ns_to_us(2_500_000), 2_500);
        assert_eq!(us_to_ns(3), 3_000);
        assert_eq!(us_to_ns(-10), 0);
        assert_eq!(ms_to_us(u64::MAX), i64::MAX);
    }

    #[test]
    fn test_audio_clock_first_chunk_starts_at_zero() {
        let mut clock = AudioClock::new(44_100, 1);
        assert_eq!(clock.next_pts(2048), 0);
        // 2048 / 44100 s = 46439.9 µs
        assert_eq!(clock.next_pts(2048), 46_439);
    }

    #[test]
    fn test_audio_clock_does_not_accumulate_truncation() {
        let mut clock = AudioClock::new(44_100, 1);
        for _ in 0..44_100 / 441 {
            clock.next_pts(441);
        }
        // Exactly one second of frames, no drift from per-chunk rounding.
        assert_eq!(clock.current_pts(), 1_000_000);
    }

    #[test]
    fn test_audio_clock_counts_frames_not_samples() {
        let mut clock = AudioClock::new(48_000, 2);
        clock.next_pts(96_000);
        assert_eq!(clock.frames_encoded(), 48_000);
        assert_eq!(clock.current_pts(), 1_000_000);
    }

    #[test]
    fn test_audio_clock_empty_chunk_keeps_time() {
        let mut clock = AudioClock::new(44_100, 1);
        clock.next_pts(100);
        let before = clock.current_pts();
        assert_eq!(clock.next_pts(0), before);
        assert_eq!(clock.current_pts(), before);
        clock.reset();
        assert_eq!(clock.current_pts(), 0);
    }

    #[test]
    fn test_audio_clock_starting_at_offset() {
        let mut clock = AudioClock::starting_at(1_000, 1, 2_000_000);
        assert_eq!(clock.next_pts(100), 2_000_000);
        assert_eq!(clock.next_pts(100), 2_100_000);
        clock.reset();
        assert_eq!(clock.current_pts(), 2_000_000);
    }

    #[test]
    fn test_stream_offset() {
        let offset = StreamOffset {
            reference_us: 1_000_000,
            measured_us: 1_050_000,
        };
        assert_eq!(offset.offset_us(), 50_000);
        assert!((offset.offset_ms() - 50.0).abs() < 1e-9);
        assert!(offset.exceeds_threshold_ms(10.0));
        assert!(!offset.exceeds_threshold_ms(100.0));
    }
}

//! Decoded sample storage shared between the control and render contexts

use crate::error::EngineError;
use std::fmt;

pub const MAX_CHANNELS: u16 = 8;
pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const MAX_SAMPLE_RATE: u32 = 384_000;

/// Immutable interleaved audio
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
    frames: u64,
}

impl AudioBuffer {
    /// Validate and wrap decoded samples
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Result<Self, EngineError> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(EngineError::mismatch(format!(
                "channel count {} outside 1..={}",
                channels, MAX_CHANNELS
            )));
        }
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&sample_rate) {
            return Err(EngineError::mismatch(format!(
                "sample rate {} Hz outside {}..={} Hz",
                sample_rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
            )));
        }
        if samples.len() % channels as usize != 0 {
            return Err(EngineError::mismatch(format!(
                "{} samples is not a whole number of {}-channel frames",
                samples.len(),
                channels
            )));
        }
        if samples.is_empty() {
            return Err(EngineError::mismatch("buffer has no frames"));
        }
        if let Some(index) = samples.iter().position(|s| !s.is_finite()) {
            return Err(EngineError::mismatch(format!(
                "non-finite sample at index {}",
                index
            )));
        }

        let frames = (samples.len() / channels as usize) as u64;
        Ok(Self {
            samples,
            sample_rate,
            channels,
            frames,
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn channels(&self) -> usize {
        self.channels as usize
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames as f64 / self.sample_rate as f64
    }

    /// Interleaved samples
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// One sample, silence past the end
    #[inline]
    pub fn sample(&self, frame: u64, channel: usize) -> f32 {
        if frame >= self.frames {
            return 0.0;
        }
        let channels = self.channels as usize;
        self.samples[frame as usize * channels + channel % channels]
    }

    /// Linearly interpolated read at a fractional frame position.
    /// Positions outside `[0, frames)` read as silence.
    #[inline]
    pub fn read(&self, position: f64, channel: usize) -> f32 {
        if position < 0.0 || position >= self.frames as f64 {
            return 0.0;
        }
        let index = position as u64;
        let frac = (position - index as f64) as f32;
        let a = self.sample(index, channel);
        if frac == 0.0 {
            return a;
        }
        let b = self.sample(index + 1, channel);
        a + (b - a) * frac
    }

    /// Average of all channels, one value per frame
    pub fn mono_mix(&self) -> Vec<f32> {
        let channels = self.channels as usize;
        if channels == 1 {
            return self.samples.clone();
        }
        let scale = 1.0 / channels as f32;
        self.samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() * scale)
            .collect()
    }
}

/// Identity of a loaded track, doubling as its load generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackId(pub(crate) u64);

impl TrackId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A buffer together with its identity
#[derive(Debug)]
pub struct Track {
    id: TrackId,
    buffer: AudioBuffer,
}

impl Track {
    pub fn new(id: TrackId, buffer: AudioBuffer) -> Self {
        Self { id, buffer }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn buffer(&self) -> &AudioBuffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_mismatch(result: Result<AudioBuffer, EngineError>) -> bool {
        matches!(result, Err(EngineError::DecodeMismatch { .. }))
    }

    #[test]
    fn test_rejects_inconsistent_layouts() {
        assert!(is_mismatch(AudioBuffer::new(vec![0.0; 4], 44100, 0)));
        assert!(is_mismatch(AudioBuffer::new(vec![0.0; 18], 44100, 9)));
        assert!(is_mismatch(AudioBuffer::new(vec![0.0; 4], 1000, 2)));
        assert!(is_mismatch(AudioBuffer::new(vec![0.0; 4], 500_000, 2)));
        assert!(is_mismatch(AudioBuffer::new(vec![0.0; 5], 44100, 2)));
        assert!(is_mismatch(AudioBuffer::new(Vec::new(), 44100, 2)));
        assert!(is_mismatch(AudioBuffer::new(
            vec![0.0, f32::NAN],
            44100,
            2
        )));
    }

    #[test]
    fn test_accepts_valid_buffer() {
        let buffer = AudioBuffer::new(vec![0.0, 1.0, 0.5, -0.5], 48000, 2).unwrap();
        assert_eq!(buffer.frames(), 2);
        assert_eq!(buffer.channels(), 2);
        assert_eq!(buffer.sample(1, 1), -0.5);
        assert_eq!(buffer.sample(2, 0), 0.0);
    }

    #[test]
    fn test_interpolated_read() {
        let buffer = AudioBuffer::new(vec![0.0, 1.0, 0.0], 44100, 1).unwrap();
        assert_eq!(buffer.read(0.5, 0), 0.5);
        assert_eq!(buffer.read(1.0, 0), 1.0);
        assert_eq!(buffer.read(1.25, 0), 0.75);
        assert_eq!(buffer.read(-0.1, 0), 0.0);
        assert_eq!(buffer.read(3.0, 0), 0.0);
    }

    #[test]
    fn test_mono_mix() {
        let buffer = AudioBuffer::new(vec![1.0, 0.0, 0.5, 0.5], 44100, 2).unwrap();
        assert_eq!(buffer.mono_mix(), vec![0.5, 0.5]);
    }
}

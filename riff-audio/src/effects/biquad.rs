//! RBJ biquad filter (shelves and peaking)

use super::Effect;
use crate::buffer::MAX_CHANNELS;
use std::f32::consts::PI;

/// Filter response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BiquadKind {
    #[default]
    Peaking,
    LowShelf,
    HighShelf,
}

#[derive(Debug, Clone, Copy, Default)]
struct ChannelState {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

/// Biquad filter with independent state per channel
pub struct Biquad {
    kind: BiquadKind,
    sample_rate: f32,
    frequency: f32,
    q: f32,
    gain_db: f32,

    // Normalised coefficients
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,

    state: [ChannelState; MAX_CHANNELS as usize],
}

impl Biquad {
    pub fn new(kind: BiquadKind, sample_rate: f32, frequency: f32, q: f32, gain_db: f32) -> Self {
        let mut filter = Self {
            kind,
            sample_rate: sample_rate.max(1.0),
            frequency,
            q,
            gain_db,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            state: [ChannelState::default(); MAX_CHANNELS as usize],
        };
        filter.calculate_coefficients();
        filter
    }

    pub fn gain_db(&self) -> f32 {
        self.gain_db
    }

    /// Set gain in dB (-24 to +24)
    pub fn set_gain_db(&mut self, gain_db: f32) {
        let gain_db = gain_db.clamp(-24.0, 24.0);
        if gain_db != self.gain_db {
            self.gain_db = gain_db;
            self.calculate_coefficients();
        }
    }

    fn calculate_coefficients(&mut self) {
        let frequency = self.frequency.clamp(20.0, self.sample_rate * 0.4);
        let omega = 2.0 * PI * frequency / self.sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * self.q.clamp(0.1, 10.0));
        let a = 10.0f32.powf(self.gain_db / 40.0);
        let sqrt_a_alpha = 2.0 * a.sqrt() * alpha;

        let (b0, b1, b2, a0, a1, a2) = match self.kind {
            BiquadKind::Peaking => (
                1.0 + alpha * a,
                -2.0 * cos_omega,
                1.0 - alpha * a,
                1.0 + alpha / a,
                -2.0 * cos_omega,
                1.0 - alpha / a,
            ),
            BiquadKind::LowShelf => (
                a * ((a + 1.0) - (a - 1.0) * cos_omega + sqrt_a_alpha),
                2.0 * a * ((a - 1.0) - (a + 1.0) * cos_omega),
                a * ((a + 1.0) - (a - 1.0) * cos_omega - sqrt_a_alpha),
                (a + 1.0) + (a - 1.0) * cos_omega + sqrt_a_alpha,
                -2.0 * ((a - 1.0) + (a + 1.0) * cos_omega),
                (a + 1.0) + (a - 1.0) * cos_omega - sqrt_a_alpha,
            ),
            BiquadKind::HighShelf => (
                a * ((a + 1.0) + (a - 1.0) * cos_omega + sqrt_a_alpha),
                -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_omega),
                a * ((a + 1.0) + (a - 1.0) * cos_omega - sqrt_a_alpha),
                (a + 1.0) - (a - 1.0) * cos_omega + sqrt_a_alpha,
                2.0 * ((a - 1.0) - (a + 1.0) * cos_omega),
                (a + 1.0) - (a - 1.0) * cos_omega - sqrt_a_alpha,
            ),
        };

        self.b0 = b0 / a0;
        self.b1 = b1 / a0;
        self.b2 = b2 / a0;
        self.a1 = a1 / a0;
        self.a2 = a2 / a0;
    }

    /// Filter one sample of `channel`
    #[inline]
    pub fn process_sample(&mut self, input: f32, channel: usize) -> f32 {
        let s = &mut self.state[channel];
        let output = self.b0 * input + self.b1 * s.x1 + self.b2 * s.x2 - self.a1 * s.y1 - self.a2 * s.y2;
        s.x2 = s.x1;
        s.x1 = input;
        s.y2 = s.y1;
        s.y1 = output;
        output
    }
}

impl Effect for Biquad {
    fn process(&mut self, samples: &mut [f32], channels: usize) {
        if channels == 0 {
            return;
        }
        let channels = channels.min(MAX_CHANNELS as usize);
        for frame in samples.chunks_exact_mut(channels) {
            for (channel, sample) in frame.iter_mut().enumerate() {
                *sample = self.process_sample(*sample, channel);
            }
        }
    }

    fn reset(&mut self) {
        self.state = [ChannelState::default(); MAX_CHANNELS as usize];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_block(freq: f32, frames: usize) -> Vec<f32> {
        (0..frames)
            .flat_map(|i| {
                let s = (2.0 * PI * freq * i as f32 / 48000.0).sin();
                [s, s]
            })
            .collect()
    }

    fn rms_tail(samples: &[f32]) -> f32 {
        let tail = &samples[samples.len() / 2..];
        (tail.iter().map(|s| s * s).sum::<f32>() / tail.len() as f32).sqrt()
    }

    #[test]
    fn test_flat_peaking_is_transparent() {
        let mut filter = Biquad::new(BiquadKind::Peaking, 48000.0, 1000.0, 0.707, 0.0);
        let input = sine_block(1000.0, 4800);
        let mut output = input.clone();
        filter.process(&mut output, 2);
        for (a, b) in input.iter().zip(&output) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_low_shelf_cut_attenuates_bass_only() {
        let mut filter = Biquad::new(BiquadKind::LowShelf, 48000.0, 80.0, 0.707, -12.0);

        let mut bass = sine_block(30.0, 48000);
        filter.process(&mut bass, 2);
        assert!(rms_tail(&bass) < 0.707 * 0.5);

        filter.reset();
        let mut treble = sine_block(5000.0, 48000);
        filter.process(&mut treble, 2);
        assert!((rms_tail(&treble) - 0.707).abs() < 0.05);
    }

    #[test]
    fn test_gain_is_clamped() {
        let mut filter = Biquad::new(BiquadKind::HighShelf, 48000.0, 8000.0, 0.707, 0.0);
        filter.set_gain_db(40.0);
        assert_eq!(filter.gain_db(), 24.0);
        filter.set_gain_db(-30.0);
        assert_eq!(filter.gain_db(), -24.0);
    }
}

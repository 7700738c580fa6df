//! Three-band EQ insert: low shelf, mid peak, high shelf

use super::{Biquad, BiquadKind, Effect};
use crate::buffer::MAX_CHANNELS;

/// Largest boost or cut per band
pub const MAX_EQ_DB: f32 = 24.0;
/// Per-block gain movement, keeps coefficient changes inaudible
const MAX_DB_PER_BLOCK: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqBand {
    Low,
    Mid,
    High,
}

/// Band gains in dB
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EqGains {
    pub low_db: f32,
    pub mid_db: f32,
    pub high_db: f32,
}

impl EqGains {
    pub fn get(&self, band: EqBand) -> f32 {
        match band {
            EqBand::Low => self.low_db,
            EqBand::Mid => self.mid_db,
            EqBand::High => self.high_db,
        }
    }

    /// Copy with one band changed, clamped to +/- 24 dB
    pub fn with(mut self, band: EqBand, gain_db: f32) -> Self {
        let gain_db = gain_db.clamp(-MAX_EQ_DB, MAX_EQ_DB);
        match band {
            EqBand::Low => self.low_db = gain_db,
            EqBand::Mid => self.mid_db = gain_db,
            EqBand::High => self.high_db = gain_db,
        }
        self
    }

    pub fn is_flat(&self) -> bool {
        self.low_db == 0.0 && self.mid_db == 0.0 && self.high_db == 0.0
    }
}

/// Shelf at 80 Hz, peak at 1 kHz, shelf at 8 kHz
pub struct ThreeBandEq {
    low: Biquad,
    mid: Biquad,
    high: Biquad,
    target: EqGains,
    /// Filters hold state from a non-flat block
    ringing: bool,
}

impl ThreeBandEq {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            low: Biquad::new(BiquadKind::LowShelf, sample_rate, 80.0, 0.707, 0.0),
            mid: Biquad::new(BiquadKind::Peaking, sample_rate, 1000.0, 0.707, 0.0),
            high: Biquad::new(BiquadKind::HighShelf, sample_rate, 8000.0, 0.707, 0.0),
            target: EqGains::default(),
            ringing: false,
        }
    }

    /// Gains to glide toward over the next blocks
    pub fn set_gains(&mut self, gains: EqGains) {
        self.target = gains;
    }

    /// Gains currently applied
    pub fn gains(&self) -> EqGains {
        EqGains {
            low_db: self.low.gain_db(),
            mid_db: self.mid.gain_db(),
            high_db: self.high.gain_db(),
        }
    }

    fn glide(filter: &mut Biquad, target: f32) {
        let current = filter.gain_db();
        if current != target {
            let delta = (target - current).clamp(-MAX_DB_PER_BLOCK, MAX_DB_PER_BLOCK);
            filter.set_gain_db(current + delta);
        }
    }

    /// First flat block after boosting or cutting: crossfade the filter
    /// tail into the dry signal, then drop the state
    fn fade_to_dry(&mut self, samples: &mut [f32], channels: usize) {
        let channels = channels.min(MAX_CHANNELS as usize);
        let frames = samples.len() / channels;
        for (i, frame) in samples.chunks_exact_mut(channels).enumerate() {
            let wet_share = 1.0 - (i + 1) as f32 / frames as f32;
            for (channel, sample) in frame.iter_mut().enumerate() {
                let low = self.low.process_sample(*sample, channel);
                let mid = self.mid.process_sample(low, channel);
                let wet = self.high.process_sample(mid, channel);
                *sample += (wet - *sample) * wet_share;
            }
        }
        self.reset();
    }
}

impl Effect for ThreeBandEq {
    fn process(&mut self, samples: &mut [f32], channels: usize) {
        if channels == 0 {
            return;
        }

        Self::glide(&mut self.low, self.target.low_db);
        Self::glide(&mut self.mid, self.target.mid_db);
        Self::glide(&mut self.high, self.target.high_db);

        // Flat bands are identity filters once their tail is gone
        if self.gains().is_flat() {
            if self.ringing {
                self.fade_to_dry(samples, channels);
            }
            return;
        }

        self.ringing = true;
        self.low.process(samples, channels);
        self.mid.process(samples, channels);
        self.high.process(samples, channels);
    }

    fn reset(&mut self) {
        self.low.reset();
        self.mid.reset();
        self.high.reset();
        self.ringing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gains_clamp() {
        let gains = EqGains::default().with(EqBand::High, 40.0).with(EqBand::Low, -3.0);
        assert_eq!(gains.high_db, MAX_EQ_DB);
        assert_eq!(gains.get(EqBand::Low), -3.0);
        assert!(!gains.is_flat());
    }

    #[test]
    fn test_gain_glides_per_block() {
        let mut eq = ThreeBandEq::new(48000.0);
        eq.set_gains(EqGains::default().with(EqBand::Mid, 6.0));

        let mut block = vec![0.0f32; 256];
        eq.process(&mut block, 2);
        assert_eq!(eq.gains().mid_db, 0.5);

        for _ in 0..20 {
            eq.process(&mut block, 2);
        }
        assert_eq!(eq.gains().mid_db, 6.0);
    }

    #[test]
    fn test_flat_eq_passes_audio_untouched() {
        let mut eq = ThreeBandEq::new(48000.0);
        let mut block: Vec<f32> = (0..512).map(|i| (i as f32 * 0.01).sin()).collect();
        let original = block.clone();
        eq.process(&mut block, 2);
        assert_eq!(block, original);
    }

    fn sine_blocks(blocks: usize, frames: usize) -> Vec<Vec<f32>> {
        (0..blocks)
            .map(|b| {
                (b * frames..(b + 1) * frames)
                    .flat_map(|i| {
                        let s = 0.25 * (2.0 * std::f32::consts::PI * 100.0 * i as f32 / 48000.0).sin();
                        [s, s]
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_returning_to_flat_fades_out_the_filter_tail() {
        let mut eq = ThreeBandEq::new(48000.0);
        let input = sine_blocks(80, 256);
        let mut output = Vec::new();

        eq.set_gains(EqGains::default().with(EqBand::Low, 6.0));
        let mut flat_at = None;
        for (i, block) in input.iter().enumerate() {
            if i == 30 {
                eq.set_gains(EqGains::default());
            }
            let mut block = block.clone();
            eq.process(&mut block, 2);
            output.extend_from_slice(&block);
            if i > 30 && flat_at.is_none() && eq.gains().is_flat() {
                flat_at = Some(i);
            }
        }
        let flat_at = flat_at.unwrap();

        // The first flat block still carries the tail, later ones are dry
        let block_len = 256 * 2;
        assert_ne!(&output[flat_at * block_len..(flat_at + 1) * block_len], &input[flat_at][..]);
        assert_eq!(&output[(flat_at + 1) * block_len..(flat_at + 2) * block_len], &input[flat_at + 1][..]);

        let around = &output[flat_at * block_len - 2..(flat_at + 2) * block_len];
        let max_step = around
            .chunks_exact(2)
            .zip(around.chunks_exact(2).skip(1))
            .map(|(a, b)| (b[0] - a[0]).abs())
            .fold(0.0f32, f32::max);
        // A 0.25 sine at 100 Hz moves at most 0.0033 per frame
        assert!(max_step < 0.005, "max step {}", max_step);
    }
}

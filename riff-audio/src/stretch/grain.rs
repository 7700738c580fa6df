//! Grain state for the overlap-add stretcher

use crate::looping::LoopMap;
use std::f32::consts::PI;

/// Upper bound on simultaneously sounding grains. Two overlap in steady
/// state; the rest absorb fade-outs after seeks.
pub(crate) const MAX_GRAINS: usize = 8;

/// One windowed read through the source
#[derive(Debug, Clone, Copy)]
pub(crate) struct Grain {
    pub active: bool,
    /// Source frame read at index 0
    pub start: f64,
    /// Source frames per output frame inside the grain
    pub step: f64,
    pub index: usize,
    pub map: LoopMap,
    pub gain: f32,
    /// Per-frame gain decrement while fading out
    pub fade_step: f32,
}

impl Grain {
    pub const IDLE: Grain = Grain {
        active: false,
        start: 0.0,
        step: 1.0,
        index: 0,
        map: LoopMap::IDENTITY,
        gain: 1.0,
        fade_step: 0.0,
    };

    #[inline]
    pub fn read_position(&self) -> f64 {
        self.start + self.index as f64 * self.step
    }

    pub fn fade_out(&mut self, frames: usize) {
        if self.active && self.fade_step == 0.0 {
            self.fade_step = self.gain / frames.max(1) as f32;
        }
    }
}

/// Periodic Hann window; copies spaced half a window apart sum to one
pub(crate) fn hann_window(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / len as f32).cos())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_overlap_sums_to_one() {
        let window = hann_window(2048);
        for i in 0..1024 {
            let sum = window[i] + window[i + 1024];
            assert!((sum - 1.0).abs() < 1e-5, "sum at {} = {}", i, sum);
        }
        assert_eq!(window[0], 0.0);
    }
}

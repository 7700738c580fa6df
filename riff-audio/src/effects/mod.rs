//! Insert effects applied after the stretcher

mod biquad;
mod eq;

pub use biquad::{Biquad, BiquadKind};
pub use eq::{EqBand, EqGains, ThreeBandEq};

/// Trait for audio effects
pub trait Effect: Send {
    /// Process interleaved audio in place
    fn process(&mut self, samples: &mut [f32], channels: usize);

    /// Reset effect state
    fn reset(&mut self);
}

//! Time-stretch and pitch-shift by waveform-similarity overlap-add
//!
//! A grain starts every half window at the logical playhead, which the
//! caller advances by `tempo` source frames per output frame. Inside a grain
//! the source is read at the pitch ratio, so tempo only sets the rate of
//! consumption and pitch only sets the read rate. Each grain's start is
//! nudged within the search radius to line up with the waveform the
//! previous grain is about to play, which keeps the overlap phase coherent.
//! The playhead itself is never nudged.
//!
//! Grains read the in-memory source directly. There is no lookahead buffer,
//! so latency is bounded by one grain length.

mod grain;

use crate::buffer::AudioBuffer;
use crate::looping::LoopMap;
use grain::{hann_window, Grain, MAX_GRAINS};

/// Distance between correlation points
const CORRELATION_STRIDE: usize = 4;
/// Coarse search resolution before refinement
const COARSE_STEP: usize = 8;
/// Score improvement needed to move away from an earlier candidate
const ALIGN_MARGIN: f32 = 1e-3;

/// Where the most recent grain will be reading when the next one starts
#[derive(Debug, Clone, Copy)]
struct Continuation {
    position: f64,
    step: f64,
    map: LoopMap,
}

/// Granular stretcher state, owned by the render context
pub struct StretchEngine {
    grain_len: usize,
    hop: usize,
    search_radius: usize,
    declick_frames: usize,
    window: Vec<f32>,
    grains: [Grain; MAX_GRAINS],
    until_next: usize,
    previous: Option<Continuation>,
    /// Scratch for the continuation waveform
    reference: Vec<f32>,
}

impl StretchEngine {
    /// Allocates the window and scratch; everything after this is
    /// allocation-free
    pub fn new(grain_len: usize, search_radius: usize, declick_frames: usize) -> Self {
        let grain_len = (grain_len.max(4) / 2) * 2;
        let hop = grain_len / 2;
        Self {
            grain_len,
            hop,
            search_radius: search_radius.min(hop),
            declick_frames,
            window: hann_window(grain_len),
            grains: [Grain::IDLE; MAX_GRAINS],
            until_next: 0,
            previous: None,
            reference: vec![0.0; hop.div_ceil(CORRELATION_STRIDE)],
        }
    }

    pub fn grain_len(&self) -> usize {
        self.grain_len
    }

    pub fn hop(&self) -> usize {
        self.hop
    }

    /// Drop all grains immediately
    pub fn reset(&mut self) {
        self.grains = [Grain::IDLE; MAX_GRAINS];
        self.until_next = 0;
        self.previous = None;
    }

    /// Fade in-flight grains out and start fresh on the next frame
    pub fn fade_out_all(&mut self) {
        for grain in self.grains.iter_mut() {
            grain.fade_out(self.declick_frames);
        }
        self.until_next = 0;
        self.previous = None;
    }

    pub fn active_grains(&self) -> usize {
        self.grains.iter().filter(|g| g.active).count()
    }

    /// A grain must start before the next frame is mixed
    #[inline]
    pub fn grain_due(&self) -> bool {
        self.until_next == 0
    }

    /// Start a grain at `position`, reading `step` source frames per output
    /// frame through `map`
    pub fn start_grain(
        &mut self,
        buffer: &AudioBuffer,
        position: f64,
        tempo: f64,
        step: f64,
        map: LoopMap,
    ) {
        let offset = self.align(buffer, position, tempo, step, &map);
        let start = position + offset;

        let slot = match self.grains.iter().position(|g| !g.active) {
            Some(i) => i,
            // Steal the grain closest to finishing
            None => self
                .grains
                .iter()
                .enumerate()
                .max_by_key(|(_, g)| g.index)
                .map_or(0, |(i, _)| i),
        };

        self.grains[slot] = Grain {
            active: true,
            start,
            step,
            index: 0,
            map,
            gain: 1.0,
            fade_step: 0.0,
        };
        self.previous = Some(Continuation {
            position: start + self.hop as f64 * step,
            step,
            map,
        });
        self.until_next = self.hop;
    }

    /// Mix one output frame of every sounding grain into `out` (one slot per
    /// source channel)
    #[inline]
    pub fn mix_frame(&mut self, buffer: &AudioBuffer, out: &mut [f32]) {
        out.fill(0.0);

        for grain in self.grains.iter_mut().filter(|g| g.active) {
            let weight = self.window[grain.index] * grain.gain;
            if weight != 0.0 {
                let taps = grain.map.locate(grain.read_position());
                for (channel, slot) in out.iter_mut().enumerate() {
                    let mut value = buffer.read(taps.primary, channel);
                    if taps.blend != 0.0 {
                        let other = buffer.read(taps.secondary, channel);
                        value += (other - value) * taps.blend;
                    }
                    *slot += value * weight;
                }
            }

            grain.index += 1;
            if grain.fade_step > 0.0 {
                grain.gain -= grain.fade_step;
                if grain.gain <= 1e-6 {
                    grain.active = false;
                }
            }
            if grain.index >= self.grain_len {
                grain.active = false;
            }
        }

        self.until_next = self.until_next.saturating_sub(1);
    }

    /// Offset from `position` that best continues the previous grain
    fn align(
        &mut self,
        buffer: &AudioBuffer,
        position: f64,
        tempo: f64,
        step: f64,
        map: &LoopMap,
    ) -> f64 {
        let Some(prev) = self.previous else {
            return 0.0;
        };

        let natural = prev.position - position;
        let radius = self.search_radius as f64;

        // Consumption matches the read rate: the exact continuation is in reach
        if prev.step == step && prev.map == *map && (tempo - step).abs() < 1e-9 {
            if natural.abs() <= radius {
                return natural;
            }
        }
        if self.search_radius == 0 {
            return 0.0;
        }

        let mut energy = 0.0f32;
        for (k, slot) in self.reference.iter_mut().enumerate() {
            let x = prev.position + (k * CORRELATION_STRIDE) as f64 * prev.step;
            *slot = mono_at(buffer, &prev.map, x);
            energy += *slot * *slot;
        }
        if energy < 1e-9 {
            return 0.0;
        }

        let score = |offset: i64| -> f32 {
            let start = position + offset as f64;
            if start < 0.0 {
                return f32::MIN;
            }
            let mut dot = 0.0f32;
            let mut candidate_energy = 0.0f32;
            for (k, r) in self.reference.iter().enumerate() {
                let c = mono_at(buffer, map, start + (k * CORRELATION_STRIDE) as f64 * step);
                dot += r * c;
                candidate_energy += c * c;
            }
            let norm = (energy * candidate_energy).sqrt();
            if norm > 0.0 {
                dot / norm
            } else {
                0.0
            }
        };

        let radius = self.search_radius as i64;
        let mut best = 0i64;
        let mut best_score = score(0);

        let mut distance = COARSE_STEP as i64;
        while distance <= radius {
            for candidate in [distance, -distance] {
                let s = score(candidate);
                if s > best_score + ALIGN_MARGIN {
                    best = candidate;
                    best_score = s;
                }
            }
            distance += COARSE_STEP as i64;
        }

        let center = best;
        for distance in 1..COARSE_STEP as i64 {
            for candidate in [center + distance, center - distance] {
                if candidate.abs() > radius {
                    continue;
                }
                let s = score(candidate);
                if s > best_score + ALIGN_MARGIN {
                    best = candidate;
                    best_score = s;
                }
            }
        }

        best as f64
    }
}

/// Channel average at an unrolled read position
#[inline]
fn mono_at(buffer: &AudioBuffer, map: &LoopMap, x: f64) -> f32 {
    let taps = map.locate(x);
    let channels = buffer.channels();
    let mut sum = 0.0;
    for channel in 0..channels {
        let mut value = buffer.read(taps.primary, channel);
        if taps.blend != 0.0 {
            value += (buffer.read(taps.secondary, channel) - value) * taps.blend;
        }
        sum += value;
    }
    sum / channels as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    const SR: u32 = 44100;

    fn sine(freq: f32, secs: f32) -> AudioBuffer {
        let frames = (secs * SR as f32) as usize;
        let samples = (0..frames)
            .map(|i| 0.5 * (2.0 * PI * freq * i as f32 / SR as f32).sin())
            .collect();
        AudioBuffer::new(samples, SR, 1).unwrap()
    }

    /// Drive the engine the way the renderer does, mono out
    fn run(engine: &mut StretchEngine, buffer: &AudioBuffer, tempo: f64, step: f64, frames: usize) -> Vec<f32> {
        let mut position = 0.0;
        let mut out = Vec::with_capacity(frames);
        let mut frame = [0.0f32; 1];
        for _ in 0..frames {
            if engine.grain_due() {
                engine.start_grain(buffer, position, tempo, step, LoopMap::IDENTITY);
            }
            engine.mix_frame(buffer, &mut frame);
            out.push(frame[0]);
            position += tempo;
        }
        out
    }

    fn zero_crossings(samples: &[f32]) -> usize {
        samples
            .windows(2)
            .filter(|w| (w[0] < 0.0) != (w[1] < 0.0))
            .count()
    }

    #[test]
    fn test_unity_settings_reproduce_source() {
        let buffer = sine(440.0, 1.0);
        let mut engine = StretchEngine::new(2048, 512, 256);
        let out = run(&mut engine, &buffer, 1.0, 1.0, 20_000);

        // After the first half window the overlap is complete
        for (i, &value) in out.iter().enumerate().skip(1024) {
            let expected = buffer.sample(i as u64, 0);
            assert!((value - expected).abs() < 1e-4, "frame {}: {} vs {}", i, value, expected);
        }
        assert!(engine.active_grains() <= 2);
    }

    #[test]
    fn test_octave_up_doubles_frequency() {
        let buffer = sine(220.0, 3.0);
        let mut engine = StretchEngine::new(2048, 512, 256);
        let out = run(&mut engine, &buffer, 1.0, 2.0, SR as usize);

        // One second of output: 440Hz gives ~880 crossings
        let crossings = zero_crossings(&out[2048..]) as f32 / (SR as usize - 2048) as f32 * SR as f32;
        assert!((crossings - 880.0).abs() < 880.0 * 0.05, "crossings/s = {}", crossings);
    }

    #[test]
    fn test_slow_tempo_keeps_pitch() {
        let buffer = sine(440.0, 3.0);
        let mut engine = StretchEngine::new(2048, 512, 256);
        let out = run(&mut engine, &buffer, 0.5, 1.0, SR as usize);

        let crossings = zero_crossings(&out[2048..]) as f32 / (SR as usize - 2048) as f32 * SR as f32;
        assert!((crossings - 880.0).abs() < 880.0 * 0.05, "crossings/s = {}", crossings);
    }

    #[test]
    fn test_fade_out_releases_grains() {
        let buffer = sine(440.0, 1.0);
        let mut engine = StretchEngine::new(2048, 512, 256);
        run(&mut engine, &buffer, 1.0, 1.0, 4096);
        assert!(engine.active_grains() > 0);

        engine.fade_out_all();
        assert!(engine.grain_due());
        let mut frame = [0.0f32; 1];
        for _ in 0..256 {
            engine.mix_frame(&buffer, &mut frame);
        }
        assert_eq!(engine.active_grains(), 0);
    }
}

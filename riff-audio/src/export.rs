//! Offline render of a processed range
//!
//! Export drives a private engine/renderer pair over the same shared track
//! as fast as it can, so the live renderer is never touched.

use crate::config::EngineConfig;
use crate::effects::{EqBand, EqGains};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::looping::LoopRegion;
use std::sync::Arc;
use tracing::{debug, info};

/// Which part of the track to render
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportRange {
    /// Whole track from frame 0
    Full,
    /// The stored loop region, played `repetitions` times through its seam
    Loop { repetitions: u32 },
    /// An explicit `[start, end)` source range
    Frames { start: u64, end: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportSettings {
    pub range: ExportRange,
    pub fade_in_secs: f32,
    pub fade_out_secs: f32,
    /// Frames per `render_block` call
    pub block_frames: usize,
    /// Render at the live tempo; off renders at 1.0x
    pub apply_time_stretch: bool,
    /// Render at the live pitch; off renders at 0 semitones
    pub apply_pitch_shift: bool,
    /// Render through the live EQ; off renders flat
    pub apply_eq: bool,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            range: ExportRange::Full,
            fade_in_secs: 0.0,
            fade_out_secs: 0.0,
            block_frames: 4096,
            apply_time_stretch: true,
            apply_pitch_shift: true,
            apply_eq: true,
        }
    }
}

/// Rendered interleaved audio, ready for an encoder
#[derive(Debug, Clone)]
pub struct ExportedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl ExportedAudio {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

impl Engine {
    /// Render `settings.range` with the current volume and, unless
    /// bypassed, the current tempo, pitch and EQ
    pub fn export(&self, settings: &ExportSettings) -> Result<ExportedAudio, EngineError> {
        let track = self.track().ok_or(EngineError::NothingLoaded)?;
        let buffer = track.buffer();
        let total = buffer.frames();
        let sample_rate = buffer.sample_rate();
        let channels = buffer.channels();
        let mut params = self.params();
        if !settings.apply_time_stretch {
            params.tempo_ratio = 1.0;
        }
        if !settings.apply_pitch_shift {
            params.pitch_semitones = 0;
        }
        if !settings.apply_eq {
            params.eq = EqGains::default();
        }
        let tempo = params.tempo_ratio as f64;

        let config = EngineConfig {
            output_channels: channels,
            ..self.config().clone()
        };
        let (mut engine, mut renderer) = Engine::new(config);
        engine.install_track(Arc::clone(&track));
        engine.set_tempo(params.tempo_ratio);
        engine.set_pitch(params.pitch_semitones);
        engine.set_volume(params.volume);
        engine.set_eq(EqBand::Low, params.eq.low_db);
        engine.set_eq(EqBand::Mid, params.eq.mid_db);
        engine.set_eq(EqBand::High, params.eq.high_db);

        let source_frames = match settings.range {
            ExportRange::Full => total as f64,
            ExportRange::Frames { start, end } => {
                let region = LoopRegion::new(start, end, total)?;
                engine.seek(region.start());
                region.len() as f64
            }
            ExportRange::Loop { repetitions } => {
                let region = self.loop_region().ok_or(EngineError::NothingLoaded)?;
                let repetitions = repetitions.max(1) as u64;
                engine.seek(region.start());
                engine.set_loop(region.start(), region.end())?;
                engine.enable_loop();

                let xfade = region.crossfade_len(engine.config().crossfade_frames(sample_rate));
                (region.len() + (repetitions - 1) * (region.len() - xfade)) as f64
            }
        };

        let output_frames = (source_frames / tempo).ceil() as usize;
        let block_frames = settings.block_frames.max(1);
        info!(
            range = ?settings.range,
            output_frames,
            tempo = params.tempo_ratio,
            pitch = params.pitch_semitones,
            eq = !params.eq.is_flat(),
            "export started"
        );

        engine.play();
        let mut samples = Vec::with_capacity(output_frames * channels);
        let mut block = vec![0.0f32; block_frames * channels];
        let mut rendered = 0;
        let mut next_report = output_frames / 10;
        while rendered < output_frames {
            let n = block_frames.min(output_frames - rendered);
            renderer.render_block(&mut block, n);
            samples.extend_from_slice(&block[..n * channels]);
            engine.poll();
            rendered += n;
            if rendered >= next_report && output_frames > 0 {
                debug!(percent = rendered * 100 / output_frames, "export progress");
                next_report += output_frames / 10 + 1;
            }
        }

        apply_fades(
            &mut samples,
            channels,
            sample_rate,
            settings.fade_in_secs,
            settings.fade_out_secs,
        );

        info!(frames = rendered, "export finished");
        Ok(ExportedAudio {
            samples,
            sample_rate,
            channels: channels as u16,
        })
    }
}

/// Linear fade-in from silence and fade-out to silence
fn apply_fades(samples: &mut [f32], channels: usize, sample_rate: u32, fade_in_secs: f32, fade_out_secs: f32) {
    let frames = samples.len() / channels.max(1);
    let to_frames = |secs: f32| ((secs.max(0.0) as f64 * sample_rate as f64) as usize).min(frames);

    let fade_in = to_frames(fade_in_secs);
    for (i, frame) in samples.chunks_exact_mut(channels).take(fade_in).enumerate() {
        let gain = i as f32 / fade_in as f32;
        frame.iter_mut().for_each(|s| *s *= gain);
    }

    let fade_out = to_frames(fade_out_secs);
    let first = frames - fade_out;
    for (i, frame) in samples.chunks_exact_mut(channels).skip(first).enumerate() {
        let gain = (fade_out - 1 - i) as f32 / fade_out as f32;
        frame.iter_mut().for_each(|s| *s *= gain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 44100;

    fn engine_with_tone(secs: f32) -> Engine {
        let frames = (secs * SR as f32) as usize;
        let samples: Vec<f32> = (0..frames)
            .flat_map(|i| {
                let s = 0.5 * (2.0 * std::f32::consts::PI * 220.0 * i as f32 / SR as f32).sin();
                [s, s]
            })
            .collect();
        let (mut engine, _renderer) = Engine::new(EngineConfig::default());
        engine.load_track(samples, SR, 2).unwrap();
        engine
    }

    #[test]
    fn test_export_needs_a_track() {
        let (engine, _renderer) = Engine::new(EngineConfig::default());
        let result = engine.export(&ExportSettings::default());
        assert_eq!(result.unwrap_err(), EngineError::NothingLoaded);
    }

    #[test]
    fn test_frames_range_is_stretched_by_tempo() {
        let mut engine = engine_with_tone(4.0);
        engine.set_tempo(0.5);

        let settings = ExportSettings {
            range: ExportRange::Frames {
                start: SR as u64,
                end: 2 * SR as u64,
            },
            ..Default::default()
        };
        let audio = engine.export(&settings).unwrap();
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.frames(), 2 * SR as usize);
        assert!(audio.samples.iter().any(|s| s.abs() > 0.3));
    }

    #[test]
    fn test_invalid_frames_range_is_rejected() {
        let engine = engine_with_tone(1.0);
        let settings = ExportSettings {
            range: ExportRange::Frames { start: 10, end: 10 },
            ..Default::default()
        };
        assert!(matches!(
            engine.export(&settings),
            Err(EngineError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_loop_export_length_counts_seams() {
        let mut engine = engine_with_tone(4.0);
        engine.set_loop(SR as u64, 2 * SR as u64).unwrap();

        let settings = ExportSettings {
            range: ExportRange::Loop { repetitions: 3 },
            ..Default::default()
        };
        let audio = engine.export(&settings).unwrap();

        let len = SR as usize;
        let xfade = 1323;
        assert_eq!(audio.frames(), len + 2 * (len - xfade));
    }

    #[test]
    fn test_full_export_leaves_live_state_alone() {
        let mut engine = engine_with_tone(1.0);
        engine.set_volume(0.5);
        let before = engine.params();

        let audio = engine.export(&ExportSettings::default()).unwrap();
        assert_eq!(audio.frames(), SR as usize);
        assert_eq!(engine.params(), before);
        assert_eq!(engine.current_position(), 0);
    }

    #[test]
    fn test_bypassed_processing_matches_neutral_export() {
        let mut engine = engine_with_tone(2.0);
        let neutral = engine.export(&ExportSettings::default()).unwrap();

        engine.set_tempo(0.5);
        engine.set_pitch(12);
        engine.set_eq(EqBand::Low, -24.0);
        let bypassed = engine
            .export(&ExportSettings {
                apply_time_stretch: false,
                apply_pitch_shift: false,
                apply_eq: false,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(bypassed.samples, neutral.samples);

        // Bypassing pitch alone still renders at the live tempo
        let stretched = engine
            .export(&ExportSettings {
                apply_pitch_shift: false,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(stretched.frames(), 2 * neutral.frames());
        assert_ne!(&stretched.samples[..neutral.samples.len()], &neutral.samples[..]);
    }

    #[test]
    fn test_fades() {
        let mut samples = vec![1.0f32; 20];
        apply_fades(&mut samples, 2, 10, 0.5, 0.5);
        // 10 frames: five fading in, five fading out
        assert_eq!(samples[0], 0.0);
        assert_eq!(samples[2], 0.2);
        assert_eq!(samples[8], 0.8);
        assert_eq!(samples[18], 0.0);
        assert_eq!(samples[10], 0.8);
    }
}

//! Engine configuration

use std::time::Duration;

/// Tunables for the engine and its render pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Loop seam crossfade length in milliseconds
    pub crossfade_ms: f32,
    /// Grain (analysis window) length in frames
    pub grain_frames: usize,
    /// Waveform-similarity search radius in frames
    pub search_radius: usize,
    /// Fade length for seeks and play/pause
    pub declick_frames: usize,
    /// Render heartbeat deadline
    pub watchdog_interval: Duration,
    /// Shortest loop that edit operations will produce
    pub min_loop_ms: f32,
    pub beats_per_bar: u32,
    /// Capacity of the retired snapshot queue
    pub retire_capacity: usize,
    /// Interleaved channel count written by `render_block`
    pub output_channels: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            crossfade_ms: 30.0,
            grain_frames: 2048,
            search_radius: 512,
            declick_frames: 256,
            watchdog_interval: Duration::from_millis(500),
            min_loop_ms: 100.0,
            beats_per_bar: 4,
            retire_capacity: 64,
            output_channels: 2,
        }
    }
}

impl EngineConfig {
    /// Copy with every field pulled into a range the engine can run with
    pub fn sanitized(&self) -> Self {
        // Even grain length keeps the half-window hop exact
        let grain_frames = (self.grain_frames.clamp(256, 16384) / 2) * 2;
        Self {
            crossfade_ms: if self.crossfade_ms.is_finite() {
                self.crossfade_ms.clamp(1.0, 500.0)
            } else {
                30.0
            },
            grain_frames,
            search_radius: self.search_radius.min(grain_frames / 2),
            declick_frames: self.declick_frames.clamp(1, 48_000),
            watchdog_interval: self.watchdog_interval.max(Duration::from_millis(10)),
            min_loop_ms: if self.min_loop_ms.is_finite() {
                self.min_loop_ms.max(1.0)
            } else {
                100.0
            },
            beats_per_bar: self.beats_per_bar.clamp(1, 16),
            retire_capacity: self.retire_capacity.clamp(4, 4096),
            output_channels: self.output_channels.clamp(1, crate::buffer::MAX_CHANNELS as usize),
        }
    }

    /// Configured seam crossfade in frames at `sample_rate`
    pub fn crossfade_frames(&self, sample_rate: u32) -> u64 {
        (self.crossfade_ms as f64 * 0.001 * sample_rate as f64).round() as u64
    }

    pub fn min_loop_frames(&self, sample_rate: u32) -> u64 {
        (self.min_loop_ms as f64 * 0.001 * sample_rate as f64).round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.crossfade_frames(44100), 1323);
        assert_eq!(config.min_loop_frames(48000), 4800);
        assert_eq!(config.sanitized(), config);
    }

    #[test]
    fn test_sanitize_clamps() {
        let config = EngineConfig {
            grain_frames: 1001,
            search_radius: 10_000,
            output_channels: 0,
            crossfade_ms: f32::NAN,
            ..Default::default()
        }
        .sanitized();

        assert_eq!(config.grain_frames, 1000);
        assert_eq!(config.search_radius, 500);
        assert_eq!(config.output_channels, 1);
        assert_eq!(config.crossfade_ms, 30.0);
    }
}

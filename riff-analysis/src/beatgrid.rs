//! Beat grid analysis for loop snapping
//!
//! Estimates a BPM via spectral flux onset detection and autocorrelation,
//! then phase-aligns a regular grid of beat positions to the strongest
//! onsets. Runs once per loaded track, off the real-time path.

use rustfft::{num_complex::Complex, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;
use tracing::debug;

/// Tempo used when no reliable periodicity is found
pub const DEFAULT_BPM: f32 = 120.0;

/// Where a grid came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridSource {
    /// Estimated from the signal
    Detected,
    /// Fallback grid (120 BPM from frame 0)
    Default,
}

/// A regular grid of beat positions for one track
#[derive(Debug, Clone)]
pub struct BeatGrid {
    /// Estimated tempo of the track
    pub bpm: f32,
    /// Confidence score (0.0 - 1.0) indicating detection reliability
    pub confidence: f32,
    /// Detected or fallback
    pub source: GridSource,
    /// Sample rate used for calculations
    sample_rate: u32,
    /// Frames per beat (cached, fractional)
    frames_per_beat: f64,
    /// Earliest beat in the buffer, in frames
    first_beat: f64,
    /// Beat positions in frames, strictly increasing
    beats: Vec<u64>,
}

impl BeatGrid {
    /// Build a grid anchored at `anchor_frame` that covers `[0, total_frames)`
    pub fn new(
        bpm: f32,
        anchor_frame: f64,
        total_frames: u64,
        sample_rate: u32,
        confidence: f32,
        source: GridSource,
    ) -> Self {
        let bpm = if bpm.is_finite() && bpm > 0.0 {
            bpm
        } else {
            DEFAULT_BPM
        };
        let frames_per_beat = 60.0 / bpm as f64 * sample_rate.max(1) as f64;

        // Walk back from the anchor so the grid also covers the intro
        let first_beat = anchor_frame.max(0.0).rem_euclid(frames_per_beat);

        let mut beats = Vec::new();
        let mut k = 0u64;
        loop {
            let pos = first_beat + k as f64 * frames_per_beat;
            if pos >= total_frames as f64 {
                break;
            }
            let frame = (pos.round() as u64).min(total_frames.saturating_sub(1));
            if beats.last().map_or(true, |&last| frame > last) {
                beats.push(frame);
            }
            k += 1;
        }

        Self {
            bpm,
            confidence: confidence.clamp(0.0, 1.0),
            source,
            sample_rate,
            frames_per_beat,
            first_beat,
            beats,
        }
    }

    /// Fallback grid: 120 BPM with the first beat on frame 0
    pub fn default_for(total_frames: u64, sample_rate: u32) -> Self {
        Self::new(
            DEFAULT_BPM,
            0.0,
            total_frames,
            sample_rate,
            0.0,
            GridSource::Default,
        )
    }

    /// True when the grid was estimated from the signal
    pub fn is_detected(&self) -> bool {
        self.source == GridSource::Detected
    }

    /// Beat positions in frames
    pub fn beats(&self) -> &[u64] {
        &self.beats
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frame position of the earliest beat
    pub fn first_beat(&self) -> f64 {
        self.first_beat
    }

    pub fn frames_per_beat(&self) -> f64 {
        self.frames_per_beat
    }

    /// Frames in one bar of `beats_per_bar` beats
    pub fn frames_per_bar(&self, beats_per_bar: u32) -> f64 {
        self.frames_per_beat * beats_per_bar.max(1) as f64
    }

    /// Closest grid entry to `frame` (earlier entry wins a tie)
    pub fn nearest_beat(&self, frame: u64) -> Option<u64> {
        match self.beats.binary_search(&frame) {
            Ok(i) => Some(self.beats[i]),
            Err(0) => self.beats.first().copied(),
            Err(i) if i >= self.beats.len() => self.beats.last().copied(),
            Err(i) => {
                let before = self.beats[i - 1];
                let after = self.beats[i];
                if frame - before <= after - frame {
                    Some(before)
                } else {
                    Some(after)
                }
            }
        }
    }

    /// Latest grid entry at or before `frame`
    pub fn beat_at_or_before(&self, frame: u64) -> Option<u64> {
        match self.beats.binary_search(&frame) {
            Ok(i) => Some(self.beats[i]),
            Err(0) => None,
            Err(i) => Some(self.beats[i - 1]),
        }
    }
}

/// Analyzer that builds a beat grid using spectral flux onset detection
pub struct BeatGridAnalyzer {
    sample_rate: u32,
    hop_size: usize,
    fft_size: usize,
    fft: Arc<dyn rustfft::Fft<f32>>,
    window: Vec<f32>,
}

impl BeatGridAnalyzer {
    const MIN_BPM: f64 = 60.0;
    const MAX_BPM: f64 = 200.0;
    /// Below this autocorrelation peak the grid is not trusted
    const MIN_CONFIDENCE: f32 = 0.25;
    /// Shortest buffer worth analysing
    const MIN_ANALYSIS_SECS: f32 = 4.0;

    /// Create a new beat grid analyzer
    pub fn new(sample_rate: u32) -> Self {
        let fft_size = 2048;
        let hop_size = 512; // ~11.6ms at 44.1kHz - good for transient detection
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);

        let window: Vec<f32> = (0..fft_size)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / fft_size as f32).cos()))
            .collect();

        Self {
            sample_rate: sample_rate.max(1),
            hop_size,
            fft_size,
            fft,
            window,
        }
    }

    /// Analyze a mono signal and build a beat grid.
    ///
    /// Never fails: when no reliable periodicity is found the default grid
    /// is returned instead.
    pub fn analyze(&self, mono: &[f32]) -> BeatGrid {
        let total_frames = mono.len() as u64;
        let fallback = || BeatGrid::default_for(total_frames, self.sample_rate);

        if (mono.len() as f32) < self.sample_rate as f32 * Self::MIN_ANALYSIS_SECS {
            debug!(frames = mono.len(), "too short for beat analysis, using default grid");
            return fallback();
        }

        let onset_fn = self.compute_onset_function(mono);
        let Some((lag, confidence)) = self.estimate_period(&onset_fn) else {
            debug!("no usable onset envelope, using default grid");
            return fallback();
        };

        if confidence < Self::MIN_CONFIDENCE {
            debug!(confidence, "weak periodicity, using default grid");
            return fallback();
        }

        let frames_per_second = self.frames_per_second();
        let lag = self.disambiguate_octave(&onset_fn, lag);
        let bpm = (60.0 * frames_per_second / lag) as f32;

        let onsets = self.find_onset_peaks(&onset_fn);
        let anchor = self.find_first_beat(&onsets, lag);

        debug!(bpm, confidence, anchor, "beat grid detected");
        BeatGrid::new(
            bpm,
            anchor,
            total_frames,
            self.sample_rate,
            confidence,
            GridSource::Detected,
        )
    }

    /// Onset function frames per second of audio
    fn frames_per_second(&self) -> f64 {
        self.sample_rate as f64 / self.hop_size as f64
    }

    /// Frame offset between an onset function index and the transient it
    /// reports. The rectified flux between two Hann-windowed frames peaks
    /// when the transient sits 5/8 of the way into the later frame.
    fn onset_latency(&self) -> f64 {
        (self.hop_size + self.fft_size * 5 / 8) as f64
    }

    /// Compute spectral flux onset detection function
    ///
    /// Spectral flux measures the change in magnitude spectrum between consecutive frames.
    /// Transients (kicks, snares) cause large positive flux values.
    fn compute_onset_function(&self, mono: &[f32]) -> Vec<f32> {
        let bins = self.fft_size / 2;
        let mut onset_fn = Vec::with_capacity(mono.len() / self.hop_size + 1);
        let mut buffer = vec![Complex::new(0.0f32, 0.0); self.fft_size];
        let mut spectrum = vec![0.0f32; bins];
        let mut prev_spectrum = vec![0.0f32; bins];
        let mut have_prev = false;

        let mut frame_start = 0;
        while frame_start + self.fft_size <= mono.len() {
            let frame = &mono[frame_start..frame_start + self.fft_size];
            for ((slot, s), w) in buffer.iter_mut().zip(frame).zip(&self.window) {
                *slot = Complex::new(s * w, 0.0);
            }

            self.fft.process(&mut buffer);

            for (mag, c) in spectrum.iter_mut().zip(&buffer[..bins]) {
                *mag = c.norm();
            }

            // Half-wave rectified difference: only increases indicate onsets
            if have_prev {
                let flux: f32 = spectrum
                    .iter()
                    .zip(prev_spectrum.iter())
                    .map(|(curr, prev)| (curr - prev).max(0.0))
                    .sum();
                onset_fn.push(flux);
            }

            std::mem::swap(&mut spectrum, &mut prev_spectrum);
            have_prev = true;
            frame_start += self.hop_size;
        }

        let max = onset_fn.iter().cloned().fold(0.0f32, f32::max);
        if max > 0.0 {
            for v in &mut onset_fn {
                *v /= max;
            }
        }

        onset_fn
    }

    /// Find peaks in the onset detection function
    fn find_onset_peaks(&self, onset_fn: &[f32]) -> Vec<usize> {
        if onset_fn.len() < 3 {
            return Vec::new();
        }

        // Adaptive threshold: mean + 0.5 * std_dev
        let mean: f32 = onset_fn.iter().sum::<f32>() / onset_fn.len() as f32;
        let variance: f32 =
            onset_fn.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / onset_fn.len() as f32;
        let threshold = (mean + 0.5 * variance.sqrt()).max(0.1);

        // Minimum distance between peaks: 50ms
        let min_distance = ((self.sample_rate as f32 * 0.05) as usize / self.hop_size).max(1);

        let mut peaks = Vec::new();
        let mut last_peak: Option<usize> = None;

        for i in 1..onset_fn.len() - 1 {
            let far_enough = last_peak.map_or(true, |p| i - p >= min_distance);
            if onset_fn[i] > threshold
                && onset_fn[i] > onset_fn[i - 1]
                && onset_fn[i] >= onset_fn[i + 1]
                && far_enough
            {
                peaks.push(i);
                last_peak = Some(i);
            }
        }

        peaks
    }

    /// Normalised correlation of the mean-removed envelope at `lag`
    fn correlation_at_lag(centered: &[f32], lag: usize) -> f32 {
        if lag == 0 || lag >= centered.len() {
            return 0.0;
        }

        let mut correlation = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for i in 0..(centered.len() - lag) {
            let a = centered[i];
            let b = centered[i + lag];
            correlation += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let norm = (norm_a * norm_b).sqrt();
        if norm > 0.0 {
            correlation / norm
        } else {
            0.0
        }
    }

    /// Remove the mean so steady noise floors don't read as periodicity
    fn centered(onset_fn: &[f32]) -> Vec<f32> {
        let mean = onset_fn.iter().sum::<f32>() / onset_fn.len().max(1) as f32;
        onset_fn.iter().map(|v| v - mean).collect()
    }

    /// Estimate the beat period (in onset frames, fractional) by autocorrelation
    ///
    /// Returns the refined lag and the correlation at the peak.
    fn estimate_period(&self, onset_fn: &[f32]) -> Option<(f64, f32)> {
        let frames_per_second = self.frames_per_second();
        let min_lag = ((frames_per_second * 60.0 / Self::MAX_BPM).floor() as usize).max(1);
        let max_lag = (frames_per_second * 60.0 / Self::MIN_BPM).ceil() as usize;

        if onset_fn.len() <= max_lag * 2 {
            return None;
        }

        let centered = Self::centered(onset_fn);
        let correlations: Vec<f32> = (min_lag..=max_lag)
            .map(|lag| Self::correlation_at_lag(&centered, lag))
            .collect();

        let mut best = 0;
        for (i, &c) in correlations.iter().enumerate() {
            if c > correlations[best] {
                best = i;
            }
        }
        let best_correlation = correlations[best];
        if best_correlation <= 0.0 {
            return Some((min_lag as f64, 0.0));
        }

        // Parabolic interpolation around the peak for sub-frame period
        let mut lag = (min_lag + best) as f64;
        if best > 0 && best + 1 < correlations.len() {
            let y0 = correlations[best - 1];
            let y1 = correlations[best];
            let y2 = correlations[best + 1];
            let denom = y0 - 2.0 * y1 + y2;
            if denom.abs() > f32::EPSILON {
                let delta = (0.5 * (y0 - y2) / denom).clamp(-0.5, 0.5);
                lag += delta as f64;
            }
        }

        Some((lag, best_correlation.clamp(0.0, 1.0)))
    }

    /// Disambiguate between octave-related periods (e.g., 77 vs 154 BPM)
    ///
    /// Very slow estimates are doubled, very fast ones halved; in the
    /// ambiguous bands the octave with comparable correlation wins.
    fn disambiguate_octave(&self, onset_fn: &[f32], lag: f64) -> f64 {
        let frames_per_second = self.frames_per_second();
        let bpm = 60.0 * frames_per_second / lag;

        if bpm < 65.0 {
            return lag / 2.0;
        }
        if bpm > 185.0 {
            return lag * 2.0;
        }

        let centered = Self::centered(onset_fn);
        let original_corr = Self::correlation_at_lag(&centered, lag.round() as usize);

        if (65.0..=95.0).contains(&bpm) {
            let doubled_corr = Self::correlation_at_lag(&centered, (lag / 2.0).round() as usize);
            let doubled_is_reasonable = (120.0..=180.0).contains(&(bpm * 2.0));
            if doubled_is_reasonable && doubled_corr / original_corr.max(0.001) > 0.7 {
                return lag / 2.0;
            }
        }

        if (170.0..=185.0).contains(&bpm) {
            let halved_corr = Self::correlation_at_lag(&centered, (lag * 2.0).round() as usize);
            // Only halve if the halved correlation is significantly stronger
            if halved_corr > original_corr * 1.2 {
                return lag * 2.0;
            }
        }

        lag
    }

    /// Find the grid anchor by aligning a beat grid to the strongest onsets
    ///
    /// Returns the anchor in audio frames.
    fn find_first_beat(&self, onsets: &[usize], lag: f64) -> f64 {
        if onsets.is_empty() || lag <= 0.0 {
            return 0.0;
        }

        let tolerance = (lag / 6.0).max(1.0); // ~16% of a beat
        let candidates = onsets.len().min(32);
        let mut best_onset = onsets[0];
        let mut best_score = 0.0f32;

        for &onset in &onsets[..candidates] {
            let mut score = 0.0;

            // Check alignment for the next 16 expected beats
            for beat_num in 0..16 {
                let expected = onset as f64 + beat_num as f64 * lag;
                let hit = onsets
                    .iter()
                    .any(|&actual| (actual as f64 - expected).abs() <= tolerance);
                if hit {
                    // Weight earlier beats more heavily
                    score += 1.0 / (beat_num as f32 + 1.0);
                }
            }

            if score > best_score {
                best_score = score;
                best_onset = onset;
            }
        }

        best_onset as f64 * self.hop_size as f64 + self.onset_latency()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 44100;

    /// Decaying 1kHz bursts every `period_secs`, first one at `offset_secs`
    fn click_track(secs: f32, period_secs: f32, offset_secs: f32) -> Vec<f32> {
        let total = (secs * SR as f32) as usize;
        let burst = (0.03 * SR as f32) as usize;
        let mut out = vec![0.0f32; total];
        let mut t = offset_secs;
        while t < secs {
            let start = (t * SR as f32) as usize;
            for i in 0..burst {
                if start + i >= total {
                    break;
                }
                let env = (-(i as f32) / (0.005 * SR as f32)).exp();
                let phase = 2.0 * PI * 1000.0 * i as f32 / SR as f32;
                out[start + i] = 0.8 * env * phase.sin();
            }
            t += period_secs;
        }
        out
    }

    #[test]
    fn test_detects_120_bpm_pulse() {
        let signal = click_track(20.0, 0.5, 0.25);
        let grid = BeatGridAnalyzer::new(SR).analyze(&signal);

        assert!(grid.is_detected());
        assert!((grid.bpm - 120.0).abs() < 1.0, "bpm = {}", grid.bpm);

        let spacing_secs = grid.frames_per_beat() / SR as f64;
        assert!((spacing_secs - 0.5).abs() < 0.005, "spacing = {}", spacing_secs);

        // Consecutive entries are one beat apart
        for pair in grid.beats().windows(2) {
            let gap = (pair[1] - pair[0]) as f64 / SR as f64;
            assert!((gap - 0.5).abs() < 0.006, "gap = {}", gap);
        }
    }

    #[test]
    fn test_grid_is_phase_aligned_to_clicks() {
        let signal = click_track(20.0, 0.5, 0.25);
        let grid = BeatGridAnalyzer::new(SR).analyze(&signal);

        let click = (2.25 * SR as f64) as u64;
        let nearest = grid.nearest_beat(click).unwrap();
        let error_secs = (nearest as f64 - click as f64).abs() / SR as f64;
        assert!(error_secs < 0.03, "grid off by {}s", error_secs);
    }

    #[test]
    fn test_silence_falls_back_to_default_grid() {
        let signal = vec![0.0f32; SR as usize * 10];
        let grid = BeatGridAnalyzer::new(SR).analyze(&signal);

        assert_eq!(grid.source, GridSource::Default);
        assert_eq!(grid.bpm, DEFAULT_BPM);
        assert_eq!(grid.beats()[0], 0);
    }

    #[test]
    fn test_short_input_falls_back_to_default_grid() {
        let signal = click_track(2.0, 0.5, 0.25);
        let grid = BeatGridAnalyzer::new(SR).analyze(&signal);
        assert!(!grid.is_detected());
    }

    #[test]
    fn test_grid_covers_buffer_and_increases() {
        let grid = BeatGrid::new(120.0, 30_000.0, SR as u64 * 10, SR, 1.0, GridSource::Detected);

        // Anchor is walked back to the first beat inside the buffer
        assert!(grid.first_beat() < grid.frames_per_beat());
        assert_eq!(grid.beats().len(), 20);
        assert!(grid.beats().windows(2).all(|w| w[0] < w[1]));
        assert!(*grid.beats().last().unwrap() < SR as u64 * 10);
    }

    #[test]
    fn test_nearest_beat() {
        let grid = BeatGrid::new(120.0, 0.0, SR as u64 * 4, SR, 1.0, GridSource::Detected);
        // Beats every 22050 frames
        assert_eq!(grid.nearest_beat(0), Some(0));
        assert_eq!(grid.nearest_beat(10_000), Some(0));
        assert_eq!(grid.nearest_beat(12_000), Some(22_050));
        assert_eq!(grid.nearest_beat(1_000_000), Some(154_350));
        assert_eq!(grid.beat_at_or_before(30_000), Some(22_050));
    }

    #[test]
    fn test_offset_grid_spacing() {
        let offset = 11025.0;
        let grid = BeatGrid::new(120.0, offset, SR as u64 * 4, SR, 1.0, GridSource::Detected);

        assert_eq!(grid.beats()[0], 11_025);
        assert_eq!(grid.beats()[2], 11_025 + 44_100);
        assert!((grid.frames_per_bar(4) - 88200.0).abs() < 1e-6);
    }
}

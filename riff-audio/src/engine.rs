//! Control-facing engine API
//!
//! The `Engine` lives on the control thread. Every setter publishes a new
//! snapshot for the renderer and returns immediately; range-sensitive
//! operations validate against the loaded track first.

use crate::analysis_worker::AnalysisWorker;
use crate::buffer::{AudioBuffer, Track, TrackId};
use crate::config::EngineConfig;
use crate::control::{
    ControlChannel, ControlSnapshot, LoopSettings, PlaybackParams, Reclaimer, SeekRequest,
};
use crate::effects::EqBand;
use crate::error::EngineError;
use crate::looping::{LoopRegion, LoopState};
use crate::renderer::Renderer;
use crate::telemetry::Telemetry;
use crate::watchdog::Watchdog;
use riff_analysis::{BeatGrid, DEFAULT_BPM};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What loop edits need to know about the loaded track
struct EditContext {
    total: u64,
    bar_frames: f64,
    min_len: u64,
    grid: Option<Arc<BeatGrid>>,
}

/// Control-side handle of the playback engine
pub struct Engine {
    config: EngineConfig,
    channel: ControlChannel,
    reclaimer: Reclaimer,
    telemetry: Arc<Telemetry>,
    watchdog: Watchdog,
    render_active: bool,
    next_track_id: u64,
    analysis: AnalysisWorker,
    beat_grid: Option<Arc<BeatGrid>>,
}

impl Engine {
    /// Create an engine and the renderer that feeds the audio callback
    pub fn new(config: EngineConfig) -> (Engine, Renderer) {
        let config = config.sanitized();
        let channel = ControlChannel::new(ControlSnapshot::default());
        let (reader, reclaimer) = channel.reader(config.retire_capacity);
        let telemetry = Arc::new(Telemetry::new());
        let renderer = Renderer::new(reader, Arc::clone(&telemetry), &config);

        let engine = Engine {
            watchdog: Watchdog::new(config.watchdog_interval),
            config,
            channel,
            reclaimer,
            telemetry,
            render_active: false,
            next_track_id: 1,
            analysis: AnalysisWorker::new(),
            beat_grid: None,
        };
        (engine, renderer)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn publish<F>(&mut self, update: F) -> Arc<ControlSnapshot>
    where
        F: FnMut(&mut ControlSnapshot),
    {
        self.reclaimer.reclaim();
        self.channel.publish(update)
    }

    // --- Transport ---

    /// Replace the active track. The previous track stays active if the
    /// samples are rejected.
    pub fn load_track(
        &mut self,
        samples: Vec<f32>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<TrackId, EngineError> {
        let buffer = match AudioBuffer::new(samples, sample_rate, channels) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!(error = %e, "rejected track");
                return Err(e);
            }
        };

        let id = TrackId(self.next_track_id);
        self.next_track_id += 1;
        let track = Arc::new(Track::new(id, buffer));
        self.install_track(Arc::clone(&track));

        info!(
            track = %id,
            sample_rate,
            channels,
            duration_secs = track.buffer().duration_secs(),
            "track loaded"
        );

        self.analysis.spawn(track);
        Ok(id)
    }

    /// Publish a prepared track with fresh transport and loop state
    pub(crate) fn install_track(&mut self, track: Arc<Track>) {
        self.beat_grid = None;
        self.publish(|s| {
            s.track = Some(Arc::clone(&track));
            s.params.playing = false;
            s.looping = LoopSettings::default();
            s.seek = SeekRequest {
                epoch: s.seek.epoch + 1,
                frame: 0,
            };
        });
    }

    pub fn play(&mut self) {
        if self.track().is_none() {
            debug!("play ignored, nothing loaded");
            return;
        }
        self.publish(|s| {
            s.params.playing = true;
            s.transport_epoch += 1;
        });
    }

    pub fn pause(&mut self) {
        self.publish(|s| s.params.playing = false);
    }

    pub fn toggle(&mut self) {
        if self.is_playing() {
            self.pause();
        } else {
            self.play();
        }
    }

    /// Move the playhead. Clamped to the track; leaving an enabled loop
    /// disables it.
    pub fn seek(&mut self, frame: u64) {
        let total = self.duration_frames();
        if total == 0 {
            return;
        }
        let frame = frame.min(total - 1);
        let leaves_loop = self
            .channel
            .latest()
            .looping
            .active_region()
            .map_or(false, |region| !region.contains(frame as f64));
        if leaves_loop {
            debug!(frame, "seek outside loop, disabling loop");
        }

        self.publish(|s| {
            if leaves_loop {
                s.looping.enabled = false;
            }
            s.seek = SeekRequest {
                epoch: s.seek.epoch + 1,
                frame,
            };
        });
    }

    /// Seek relative to the current position, in seconds
    pub fn seek_by_secs(&mut self, delta_secs: f64) {
        let Some(sample_rate) = self.sample_rate() else {
            return;
        };
        let target = self.current_position() as f64 + delta_secs * sample_rate as f64;
        self.seek(target.max(0.0) as u64);
    }

    // --- Parameters ---

    pub fn set_tempo(&mut self, ratio: f32) {
        if !ratio.is_finite() {
            return;
        }
        let ratio = PlaybackParams::clamp_tempo(ratio);
        self.publish(|s| s.params.tempo_ratio = ratio);
    }

    pub fn set_pitch(&mut self, semitones: i32) {
        let semitones = PlaybackParams::clamp_pitch(semitones);
        self.publish(|s| s.params.pitch_semitones = semitones);
    }

    pub fn set_volume(&mut self, level: f32) {
        if !level.is_finite() {
            return;
        }
        let level = PlaybackParams::clamp_volume(level);
        self.publish(|s| s.params.volume = level);
    }

    /// Set one EQ band's gain in dB
    pub fn set_eq(&mut self, band: EqBand, gain_db: f32) {
        if !gain_db.is_finite() {
            return;
        }
        self.publish(|s| s.params.eq = s.params.eq.with(band, gain_db));
    }

    // --- Looping ---

    /// Store a loop region. Rejected regions leave the previous one intact.
    pub fn set_loop(&mut self, start: u64, end: u64) -> Result<(), EngineError> {
        if self.track().is_none() {
            return Err(EngineError::NothingLoaded);
        }
        let region = LoopRegion::new(start, end, self.duration_frames()).map_err(|e| {
            debug!(error = %e, "loop region rejected");
            e
        })?;
        self.publish(|s| s.looping.region = Some(region));
        Ok(())
    }

    /// Turn the stored region on; false when there is none
    pub fn enable_loop(&mut self) -> bool {
        if self.loop_region().is_none() {
            return false;
        }
        self.publish(|s| s.looping.enabled = true);
        true
    }

    pub fn disable_loop(&mut self) {
        self.publish(|s| s.looping.enabled = false);
    }

    pub fn toggle_loop(&mut self) -> bool {
        if self.loop_settings().enabled {
            self.disable_loop();
            false
        } else {
            self.enable_loop()
        }
    }

    /// Forget the region entirely
    pub fn clear_loop(&mut self) {
        self.publish(|s| s.looping = LoopSettings::default());
    }

    fn edit_context(&self) -> Option<EditContext> {
        let track = self.track()?;
        let buffer = track.buffer();
        let grid = self.beat_grid.clone();
        // Without a grid a bar is four beats at the default tempo
        let bar_frames = match &grid {
            Some(grid) => grid.frames_per_bar(self.config.beats_per_bar),
            None => {
                60.0 / DEFAULT_BPM as f64
                    * buffer.sample_rate() as f64
                    * self.config.beats_per_bar as f64
            }
        };
        Some(EditContext {
            total: buffer.frames(),
            bar_frames,
            min_len: self.config.min_loop_frames(buffer.sample_rate()),
            grid,
        })
    }

    fn edit_loop<F>(&mut self, action: &str, edit: F) -> bool
    where
        F: FnOnce(LoopRegion, &EditContext) -> Option<LoopRegion>,
    {
        let (Some(region), Some(ctx)) = (self.loop_region(), self.edit_context()) else {
            debug!(action, "loop edit ignored, no loop region");
            return false;
        };
        match edit(region, &ctx) {
            Some(edited) => {
                debug!(
                    action,
                    start = edited.start(),
                    end = edited.end(),
                    "loop edited"
                );
                self.publish(|s| s.looping.region = Some(edited));
                true
            }
            None => {
                debug!(action, start = region.start(), end = region.end(), "loop edit rejected");
                false
            }
        }
    }

    pub fn halve_loop(&mut self) -> bool {
        self.edit_loop("halve", |r, ctx| r.halved(ctx.min_len))
    }

    pub fn double_loop(&mut self) -> bool {
        self.edit_loop("double", |r, ctx| r.doubled(ctx.total))
    }

    /// Move the whole region by whole bars
    pub fn nudge_loop(&mut self, bars: i32) -> bool {
        self.edit_loop("nudge", |r, ctx| {
            r.shifted_by_bars(bars, ctx.bar_frames, ctx.total)
        })
    }

    /// Move the loop end by whole bars
    pub fn resize_loop(&mut self, bars: i32) -> bool {
        self.edit_loop("resize", |r, ctx| {
            r.resized_by_bars(bars, ctx.bar_frames, ctx.min_len, ctx.total)
        })
    }

    /// Snap both boundaries to the detected beat grid. No-op without one.
    pub fn snap_loop_to_beat(&mut self) -> bool {
        self.edit_loop("snap", |r, ctx| {
            let grid = ctx.grid.as_deref().filter(|g| g.is_detected())?;
            r.snapped_to_grid(grid, ctx.min_len)
        })
    }

    /// Snap only the loop start to the detected beat grid
    pub fn snap_loop_start_to_beat(&mut self) -> bool {
        self.edit_loop("snap start", |r, ctx| {
            let grid = ctx.grid.as_deref().filter(|g| g.is_detected())?;
            r.start_snapped_to_grid(grid, ctx.min_len)
        })
    }

    /// Snap only the loop end to the detected beat grid
    pub fn snap_loop_end_to_beat(&mut self) -> bool {
        self.edit_loop("snap end", |r, ctx| {
            let grid = ctx.grid.as_deref().filter(|g| g.is_detected())?;
            r.end_snapped_to_grid(grid, ctx.min_len)
        })
    }

    /// Loop `bars` bars from the beat at or before the playhead, and enable it
    pub fn loop_from_here(&mut self, bars: u32) -> bool {
        let Some(ctx) = self.edit_context() else {
            return false;
        };
        let position = self.current_position();
        let grid = ctx.grid.as_deref().filter(|g| g.is_detected());
        match LoopRegion::from_beat(position, bars, ctx.bar_frames, grid, ctx.total) {
            Some(region) => {
                self.publish(|s| {
                    s.looping = LoopSettings {
                        region: Some(region),
                        enabled: true,
                    }
                });
                true
            }
            None => false,
        }
    }

    // --- Telemetry ---

    pub fn track(&self) -> Option<Arc<Track>> {
        self.channel.latest().track.clone()
    }

    pub fn track_id(&self) -> Option<TrackId> {
        self.channel.latest().track.as_ref().map(|t| t.id())
    }

    pub fn params(&self) -> PlaybackParams {
        self.channel.latest().params
    }

    pub fn duration_frames(&self) -> u64 {
        self.channel
            .latest()
            .track
            .as_ref()
            .map_or(0, |t| t.buffer().frames())
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.channel
            .latest()
            .track
            .as_ref()
            .map(|t| t.buffer().sample_rate())
    }

    /// Playhead as of the last rendered block
    pub fn current_position(&self) -> u64 {
        let latest = self.channel.latest();
        let Some(track) = latest.track.as_ref() else {
            return 0;
        };
        let telemetry = self.telemetry.snapshot();
        if telemetry.track_id == Some(track.id()) {
            telemetry.position.max(0.0) as u64
        } else {
            latest.seek.frame
        }
    }

    pub fn current_position_secs(&self) -> f64 {
        self.sample_rate()
            .map_or(0.0, |sr| self.current_position() as f64 / sr as f64)
    }

    /// Whether audio is currently advancing
    pub fn is_playing(&self) -> bool {
        let latest = self.channel.latest();
        let Some(track) = latest.track.as_ref() else {
            return false;
        };
        let telemetry = self.telemetry.snapshot();
        if telemetry.track_id == Some(track.id()) && latest.params.playing {
            telemetry.playing
        } else {
            latest.params.playing
        }
    }

    /// Detected tempo adjusted for the tempo ratio; 0.0 without a detected grid
    pub fn current_bpm(&self) -> f32 {
        self.track_bpm()
            .map_or(0.0, |bpm| bpm * self.params().tempo_ratio)
    }

    /// Detected tempo of the track itself
    pub fn track_bpm(&self) -> Option<f32> {
        self.beat_grid
            .as_ref()
            .filter(|g| g.is_detected())
            .map(|g| g.bpm)
    }

    pub fn beat_grid(&self) -> Option<Arc<BeatGrid>> {
        self.beat_grid.clone()
    }

    pub fn is_analyzing(&self) -> bool {
        self.analysis.is_busy()
    }

    /// Playhead is inside an engaged loop
    pub fn is_looping(&self) -> bool {
        self.loop_state().is_engaged()
    }

    pub fn loop_state(&self) -> LoopState {
        let telemetry = self.telemetry.snapshot();
        if telemetry.track_id.is_some() && telemetry.track_id == self.track_id() {
            telemetry.loop_state
        } else {
            LoopState::NoLoop
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        self.channel.latest().looping
    }

    pub fn loop_region(&self) -> Option<LoopRegion> {
        self.channel.latest().looping.region
    }

    // --- Housekeeping ---

    /// Reclaim released snapshots and apply finished analysis
    pub fn poll(&mut self) {
        self.reclaimer.reclaim();
        while let Some(result) = self.analysis.try_recv() {
            self.apply_analysis(result);
        }
    }

    /// Block up to `timeout` for the current track's beat grid
    pub fn wait_for_beat_grid(&mut self, timeout: Duration) -> Option<Arc<BeatGrid>> {
        let deadline = Instant::now() + timeout;
        while self.beat_grid.is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.analysis.recv_timeout(remaining) {
                Some(result) => self.apply_analysis(result),
                None => break,
            }
        }
        self.beat_grid.clone()
    }

    fn apply_analysis(&mut self, result: crate::analysis_worker::AnalysisResult) {
        if Some(result.track) != self.track_id() {
            debug!(track = %result.track, "discarding analysis for replaced track");
            return;
        }
        info!(
            track = %result.track,
            bpm = result.grid.bpm,
            confidence = result.grid.confidence,
            detected = result.grid.is_detected(),
            beats = result.grid.beats().len(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "beat grid ready"
        );
        self.beat_grid = Some(Arc::new(result.grid));
    }

    /// Tell the watchdog whether a device stream is pulling blocks
    pub fn set_render_active(&mut self, active: bool) {
        if active != self.render_active {
            self.render_active = active;
            self.watchdog
                .reset(self.telemetry.heartbeat(), Instant::now());
        }
    }

    /// Fails with `EngineStall` when playback is expected but the renderer
    /// has not completed a block within the watchdog interval
    pub fn check_health(&mut self, now: Instant) -> Result<(), EngineError> {
        let latest = self.channel.latest();
        let expected = self.render_active && latest.track.is_some() && latest.params.playing;
        let result = self
            .watchdog
            .check(self.telemetry.heartbeat(), expected, now);
        if let Err(e) = &result {
            error!(error = %e, "render pipeline stalled");
        }
        result
    }

    /// Hard reset: hand out a fresh renderer for a rebuilt stream. The
    /// playhead is carried over; in-flight grains are not.
    pub fn reset_render_pipeline(&mut self) -> Renderer {
        let position = self.current_position();
        self.publish(|s| {
            s.reset_epoch += 1;
            s.seek = SeekRequest {
                epoch: s.seek.epoch + 1,
                frame: position,
            };
        });

        let (reader, reclaimer) = self.channel.reader(self.config.retire_capacity);
        self.reclaimer = reclaimer;
        self.watchdog
            .reset(self.telemetry.heartbeat(), Instant::now());
        warn!(position, "render pipeline reset");

        Renderer::new(reader, Arc::clone(&self.telemetry), &self.config)
    }
}

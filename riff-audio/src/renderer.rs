//! Real-time render path
//!
//! `Renderer::render_block` is what the platform audio callback calls. It
//! reads one control snapshot per block, never blocks, never allocates and
//! never logs.

use crate::buffer::{Track, TrackId, MAX_CHANNELS};
use crate::config::EngineConfig;
use crate::control::{ControlSnapshot, PlaybackParams, SnapshotReader};
use crate::effects::{Effect, ThreeBandEq};
use crate::looping::LoopManager;
use crate::smoother::{GainRamp, ParameterSmoother};
use crate::stretch::StretchEngine;
use crate::telemetry::Telemetry;
use std::sync::Arc;

/// Volume smoothing time constant in frames
const VOLUME_SMOOTHING_FRAMES: f32 = 240.0;

/// Audio-thread state that persists across blocks for one loaded track
pub struct RenderContext {
    crossfade_ms: f32,
    track_id: Option<TrackId>,
    /// Logical playhead in source frames
    position: f64,
    stretch: StretchEngine,
    looper: LoopManager,
    seek_epoch: u64,
    transport_epoch: u64,
    reset_epoch: u64,
    /// Ran off the end; stays stopped until the next `play()`
    finished: bool,
    transport: GainRamp,
    volume: ParameterSmoother,
    eq: ThreeBandEq,
    frame: [f32; MAX_CHANNELS as usize],
}

impl RenderContext {
    fn new(config: &EngineConfig) -> Self {
        Self {
            crossfade_ms: config.crossfade_ms,
            track_id: None,
            position: 0.0,
            stretch: StretchEngine::new(
                config.grain_frames,
                config.search_radius,
                config.declick_frames,
            ),
            looper: LoopManager::new(0),
            seek_epoch: 0,
            transport_epoch: 0,
            reset_epoch: 0,
            finished: false,
            transport: GainRamp::new(config.declick_frames),
            volume: ParameterSmoother::new(1.0, VOLUME_SMOOTHING_FRAMES),
            eq: ThreeBandEq::new(44100.0),
            frame: [0.0; MAX_CHANNELS as usize],
        }
    }

    /// Drop everything tied to the current track
    fn clear(&mut self) {
        self.position = 0.0;
        self.finished = false;
        self.stretch.reset();
        self.looper.reset(0);
        self.transport.snap_to(0.0);
        self.eq.reset();
    }

    /// Back to the top once the end-of-track fade is silent
    fn rewind(&mut self) {
        self.position = 0.0;
        self.stretch.reset();
        self.looper.on_seek(0.0);
    }

    fn is_playing(&self) -> bool {
        self.track_id.is_some() && !self.finished && self.transport.value() > 0.0
    }

    /// Apply this block's snapshot
    fn sync(&mut self, snapshot: &ControlSnapshot) {
        if snapshot.reset_epoch != self.reset_epoch {
            self.reset_epoch = snapshot.reset_epoch;
            self.clear();
            self.track_id = None;
        }

        let track_id = snapshot.track.as_ref().map(|t| t.id());
        if track_id != self.track_id {
            self.track_id = track_id;
            self.clear();
            if let Some(track) = &snapshot.track {
                let sample_rate = track.buffer().sample_rate();
                let crossfade = (self.crossfade_ms as f64 * 0.001 * sample_rate as f64).round() as u64;
                self.looper.reset(crossfade);
                self.eq = ThreeBandEq::new(sample_rate as f32);
            }
            self.volume.snap_to(snapshot.params.volume);
        }

        if snapshot.seek.epoch != self.seek_epoch {
            self.seek_epoch = snapshot.seek.epoch;
            if let Some(track) = &snapshot.track {
                let last = track.buffer().frames().saturating_sub(1);
                self.position = snapshot.seek.frame.min(last) as f64;
                self.stretch.fade_out_all();
                self.looper.on_seek(self.position);
            }
        }

        if snapshot.transport_epoch != self.transport_epoch {
            self.transport_epoch = snapshot.transport_epoch;
            self.finished = false;
        }

        self.looper
            .sync(snapshot.looping.active_region(), self.position);

        let playing = snapshot.params.playing && snapshot.track.is_some() && !self.finished;
        self.transport.set_target(if playing { 1.0 } else { 0.0 });
        self.volume.set_target(snapshot.params.volume);
        self.eq.set_gains(snapshot.params.eq);
    }

    fn render(&mut self, track: &Track, params: &PlaybackParams, out: &mut [f32], channels: usize) {
        if self.transport.is_silent() {
            return;
        }

        let buffer = track.buffer();
        let source_channels = buffer.channels();
        let total = buffer.frames() as f64;
        let tempo = params.tempo_ratio as f64;
        let step = params.pitch_ratio();

        for out_frame in out.chunks_exact_mut(channels) {
            if self.stretch.grain_due() {
                let map = self.looper.map_for(self.position);
                self.stretch
                    .start_grain(buffer, self.position, tempo, step, map);
            }
            self.stretch
                .mix_frame(buffer, &mut self.frame[..source_channels]);

            let gain = self.transport.next() * self.volume.next();
            write_frame(&self.frame[..source_channels], out_frame, gain);

            self.position = self.looper.advance(self.position, tempo);

            if !self.finished && !self.looper.state().is_engaged() && self.position >= total {
                // End of track: let the grains ring out under the declick ramp
                self.finished = true;
                self.transport.set_target(0.0);
            }
            if self.transport.is_silent() {
                if self.finished {
                    self.rewind();
                }
                break;
            }
        }

        self.eq.process(out, channels);
    }
}

/// Map one source frame onto the output channel layout
#[inline]
fn write_frame(source: &[f32], out: &mut [f32], gain: f32) {
    if source.len() == out.len() {
        for (o, s) in out.iter_mut().zip(source) {
            *o = s * gain;
        }
    } else if source.len() == 1 {
        out.fill(source[0] * gain);
    } else if out.len() == 1 {
        out[0] = source.iter().sum::<f32>() / source.len() as f32 * gain;
    } else {
        for (c, o) in out.iter_mut().enumerate() {
            *o = source[c % source.len()] * gain;
        }
    }
}

/// Render-side handle, moved into the audio callback
pub struct Renderer {
    reader: SnapshotReader,
    telemetry: Arc<Telemetry>,
    ctx: RenderContext,
    output_channels: usize,
}

impl Renderer {
    pub(crate) fn new(reader: SnapshotReader, telemetry: Arc<Telemetry>, config: &EngineConfig) -> Self {
        Self {
            reader,
            telemetry,
            ctx: RenderContext::new(config),
            output_channels: config.output_channels,
        }
    }

    /// Interleaved channels written per frame
    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// Fill `frame_count` interleaved frames of `output`. Silence when
    /// nothing is loaded or playback is paused.
    pub fn render_block(&mut self, output: &mut [f32], frame_count: usize) {
        let channels = self.output_channels;
        let frames = frame_count.min(output.len() / channels);
        let out = &mut output[..frames * channels];
        out.fill(0.0);

        let snapshot = Arc::clone(self.reader.acquire());
        self.ctx.sync(&snapshot);
        if let Some(track) = snapshot.track.as_deref() {
            self.ctx.render(track, &snapshot.params, out, channels);
        }

        // The playhead overshoots the end while the last grains fade
        let position = match snapshot.track.as_deref() {
            Some(track) => self.ctx.position.min(track.buffer().frames() as f64),
            None => self.ctx.position,
        };
        self.telemetry.publish(
            position,
            self.ctx.looper.state(),
            self.ctx.is_playing(),
            self.ctx.track_id,
        );
    }
}

//! Render-to-control telemetry
//!
//! Last-write-wins atomics written once per block by the renderer and read
//! opportunistically for display and the watchdog.

use crate::buffer::TrackId;
use crate::looping::LoopState;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

#[derive(Debug, Default)]
pub struct Telemetry {
    position_bits: AtomicU64,
    /// Heartbeat; advances on every `render_block` call
    blocks_rendered: AtomicU64,
    loop_state: AtomicU8,
    playing: AtomicBool,
    /// Zero while nothing is loaded
    track_id: AtomicU64,
}

/// Plain copy of the latest telemetry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySnapshot {
    /// Playhead in source frames
    pub position: f64,
    pub blocks_rendered: u64,
    pub loop_state: LoopState,
    pub playing: bool,
    pub track_id: Option<TrackId>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish(
        &self,
        position: f64,
        loop_state: LoopState,
        playing: bool,
        track_id: Option<TrackId>,
    ) {
        self.position_bits.store(position.to_bits(), Ordering::Relaxed);
        self.loop_state.store(loop_state as u8, Ordering::Relaxed);
        self.playing.store(playing, Ordering::Relaxed);
        self.track_id
            .store(track_id.map_or(0, TrackId::get), Ordering::Relaxed);
        self.blocks_rendered.fetch_add(1, Ordering::Release);
    }

    pub fn heartbeat(&self) -> u64 {
        self.blocks_rendered.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let blocks_rendered = self.blocks_rendered.load(Ordering::Acquire);
        let track = self.track_id.load(Ordering::Relaxed);
        TelemetrySnapshot {
            position: f64::from_bits(self.position_bits.load(Ordering::Relaxed)),
            blocks_rendered,
            loop_state: LoopState::from_u8(self.loop_state.load(Ordering::Relaxed)),
            playing: self.playing.load(Ordering::Relaxed),
            track_id: (track != 0).then_some(TrackId(track)),
        }
    }
}

//! Lock-free control channel between the control and render contexts
//!
//! The control side publishes whole immutable snapshots through a single
//! `ArcSwap`. The render side loads the latest one at the start of each
//! block and keeps it for the whole block. Snapshots the renderer lets go of
//! travel back over an SPSC ring so their memory (including a replaced
//! track) is always freed on the control side.

use crate::buffer::Track;
use crate::effects::EqGains;
use crate::looping::LoopRegion;
use arc_swap::ArcSwap;
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::sync::Arc;

/// Slots kept by the renderer when the retire ring is full
const OVERFLOW_SLOTS: usize = 8;

/// User-facing playback parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackParams {
    /// Source frames consumed per output frame
    pub tempo_ratio: f32,
    pub pitch_semitones: i32,
    /// Output gain, 0.0 to 1.0
    pub volume: f32,
    pub playing: bool,
    pub eq: EqGains,
}

impl Default for PlaybackParams {
    fn default() -> Self {
        Self {
            tempo_ratio: 1.0,
            pitch_semitones: 0,
            volume: 1.0,
            playing: false,
            eq: EqGains::default(),
        }
    }
}

impl PlaybackParams {
    pub const MIN_TEMPO: f32 = 0.25;
    pub const MAX_TEMPO: f32 = 2.0;
    pub const MIN_PITCH: i32 = -12;
    pub const MAX_PITCH: i32 = 12;

    pub fn clamp_tempo(ratio: f32) -> f32 {
        ratio.clamp(Self::MIN_TEMPO, Self::MAX_TEMPO)
    }

    pub fn clamp_pitch(semitones: i32) -> i32 {
        semitones.clamp(Self::MIN_PITCH, Self::MAX_PITCH)
    }

    pub fn clamp_volume(volume: f32) -> f32 {
        volume.clamp(0.0, 1.0)
    }

    /// Source frames read per output frame inside a grain
    pub fn pitch_ratio(&self) -> f64 {
        2f64.powf(self.pitch_semitones as f64 / 12.0)
    }
}

/// Requested loop: the stored region and whether it is in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopSettings {
    pub region: Option<LoopRegion>,
    pub enabled: bool,
}

impl LoopSettings {
    /// Region the renderer should follow
    pub fn active_region(&self) -> Option<LoopRegion> {
        if self.enabled {
            self.region
        } else {
            None
        }
    }
}

/// Discontinuous playhead move, applied once per epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeekRequest {
    pub epoch: u64,
    pub frame: u64,
}

/// Everything the renderer needs for one block
#[derive(Debug, Clone, Default)]
pub struct ControlSnapshot {
    pub version: u64,
    pub track: Option<Arc<Track>>,
    pub params: PlaybackParams,
    pub looping: LoopSettings,
    /// Bumped by `play()`; re-arms playback after the track ran out
    pub transport_epoch: u64,
    pub seek: SeekRequest,
    /// Bumped by a hard pipeline reset
    pub reset_epoch: u64,
}

/// Control-side writer
pub struct ControlChannel {
    current: Arc<ArcSwap<ControlSnapshot>>,
}

impl ControlChannel {
    pub fn new(initial: ControlSnapshot) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// Render-side reader plus the matching control-side reclaimer
    pub fn reader(&self, retire_capacity: usize) -> (SnapshotReader, Reclaimer) {
        let (producer, consumer) = HeapRb::<Arc<ControlSnapshot>>::new(retire_capacity.max(1)).split();
        let held = self.current.load_full();
        (
            SnapshotReader {
                shared: Arc::clone(&self.current),
                held,
                retired: producer,
                overflow: Default::default(),
            },
            Reclaimer { retired: consumer },
        )
    }

    /// Publish a modified copy of the latest snapshot. Never fails; rapid
    /// writes coalesce and the renderer sees only the newest.
    pub fn publish<F>(&self, mut update: F) -> Arc<ControlSnapshot>
    where
        F: FnMut(&mut ControlSnapshot),
    {
        self.current.rcu(|old| {
            let mut next = ControlSnapshot::clone(old);
            update(&mut next);
            next.version = old.version + 1;
            next
        });
        self.current.load_full()
    }

    /// Latest published snapshot
    pub fn latest(&self) -> Arc<ControlSnapshot> {
        self.current.load_full()
    }
}

/// Render-side view of the channel
pub struct SnapshotReader {
    shared: Arc<ArcSwap<ControlSnapshot>>,
    held: Arc<ControlSnapshot>,
    retired: HeapProd<Arc<ControlSnapshot>>,
    overflow: [Option<Arc<ControlSnapshot>>; OVERFLOW_SLOTS],
}

impl SnapshotReader {
    /// Latest snapshot, held until the next call. Lock-free and
    /// allocation-free; the replaced snapshot is handed back for reclamation.
    pub fn acquire(&mut self) -> &Arc<ControlSnapshot> {
        self.flush_overflow();

        let latest = self.shared.load_full();
        if latest.version != self.held.version {
            let old = std::mem::replace(&mut self.held, latest);
            self.retire(old);
        }
        &self.held
    }

    pub fn held(&self) -> &Arc<ControlSnapshot> {
        &self.held
    }

    fn retire(&mut self, snapshot: Arc<ControlSnapshot>) {
        if let Err(snapshot) = self.retired.try_push(snapshot) {
            if let Some(slot) = self.overflow.iter_mut().find(|s| s.is_none()) {
                *slot = Some(snapshot);
            }
            // All slots taken: the control side stopped reclaiming and the
            // snapshot is released here
        }
    }

    fn flush_overflow(&mut self) {
        for slot in self.overflow.iter_mut() {
            if let Some(snapshot) = slot.take() {
                if let Err(snapshot) = self.retired.try_push(snapshot) {
                    *slot = Some(snapshot);
                    return;
                }
            }
        }
    }
}

/// Control-side end of the retire ring
pub struct Reclaimer {
    retired: HeapCons<Arc<ControlSnapshot>>,
}

impl Reclaimer {
    /// Drop every snapshot the renderer has released; returns how many
    pub fn reclaim(&mut self) -> usize {
        let mut count = 0;
        while self.retired.try_pop().is_some() {
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AudioBuffer, TrackId};

    fn track(id: u64) -> Arc<Track> {
        let buffer = AudioBuffer::new(vec![0.0; 64], 44100, 1).unwrap();
        Arc::new(Track::new(TrackId(id), buffer))
    }

    #[test]
    fn test_versions_increase_and_writes_coalesce() {
        let channel = ControlChannel::new(ControlSnapshot::default());
        let (mut reader, _reclaimer) = channel.reader(8);

        channel.publish(|s| s.params.tempo_ratio = 0.5);
        channel.publish(|s| s.params.tempo_ratio = 0.75);
        let last = channel.publish(|s| s.params.volume = 0.2);
        assert_eq!(last.version, 3);

        let seen = reader.acquire();
        assert_eq!(seen.version, 3);
        assert_eq!(seen.params.tempo_ratio, 0.75);
        assert_eq!(seen.params.volume, 0.2);
    }

    #[test]
    fn test_snapshot_is_stable_within_block() {
        let channel = ControlChannel::new(ControlSnapshot::default());
        let (mut reader, _reclaimer) = channel.reader(8);

        let held = Arc::clone(reader.acquire());
        channel.publish(|s| s.params.tempo_ratio = 2.0);
        assert_eq!(held.params.tempo_ratio, 1.0);
        assert_eq!(reader.held().params.tempo_ratio, 1.0);
        assert_eq!(reader.acquire().params.tempo_ratio, 2.0);
    }

    #[test]
    fn test_replaced_track_is_freed_by_reclaimer() {
        let channel = ControlChannel::new(ControlSnapshot::default());
        let (mut reader, mut reclaimer) = channel.reader(8);

        let first = track(1);
        let weak = Arc::downgrade(&first);
        channel.publish(|s| s.track = Some(Arc::clone(&first)));
        drop(first);
        reader.acquire();

        channel.publish(|s| s.track = Some(track(2)));
        reader.acquire();

        // Renderer released the old snapshot but it is still queued
        assert!(weak.upgrade().is_some());
        assert!(reclaimer.reclaim() >= 1);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_full_ring_spills_to_overflow() {
        let channel = ControlChannel::new(ControlSnapshot::default());
        let (mut reader, mut reclaimer) = channel.reader(1);

        for i in 0..4 {
            channel.publish(|s| s.params.pitch_semitones = i);
            reader.acquire();
        }
        // One in the ring, the rest parked; each acquire moves one more back
        assert_eq!(reclaimer.reclaim(), 1);
        reader.acquire();
        assert_eq!(reclaimer.reclaim(), 1);
    }
}

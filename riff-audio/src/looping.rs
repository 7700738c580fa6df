//! Loop regions, loop edits and the seam manager
//!
//! The manager keeps the playhead inside the active region and describes
//! the seam to the stretch engine as a [`LoopMap`]: a pure mapping from the
//! unrolled read position to one or two buffer taps. Grains capture the map
//! when they start, so a region edit never changes what an in-flight grain
//! reads.

use crate::error::EngineError;
use riff_analysis::BeatGrid;
use std::f64::consts::PI;

/// A `[start, end)` frame range inside a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopRegion {
    start: u64,
    end: u64,
}

impl LoopRegion {
    /// Validated region inside a buffer of `total` frames
    pub fn new(start: u64, end: u64, total: u64) -> Result<Self, EngineError> {
        if start >= end || end > total {
            return Err(EngineError::InvalidRange { start, end, total });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, position: f64) -> bool {
        position >= self.start as f64 && position < self.end as f64
    }

    /// Seam crossfade for this region: the configured length, capped at half
    /// the region
    pub fn crossfade_len(&self, crossfade_frames: u64) -> u64 {
        crossfade_frames.min(self.len() / 2)
    }

    /// First half of the region
    pub fn halved(&self, min_len: u64) -> Option<Self> {
        let len = self.len() / 2;
        (len >= min_len.max(1)).then_some(Self {
            start: self.start,
            end: self.start + len,
        })
    }

    /// Twice as long from the same start, if it still fits
    pub fn doubled(&self, total: u64) -> Option<Self> {
        let end = self.start.checked_add(self.len().checked_mul(2)?)?;
        (end <= total).then_some(Self {
            start: self.start,
            end,
        })
    }

    /// Whole region moved by `bars` bars, rejected if it would leave the track
    pub fn shifted_by_bars(&self, bars: i32, bar_frames: f64, total: u64) -> Option<Self> {
        let delta = (bars as f64 * bar_frames).round() as i64;
        if delta == 0 {
            return None;
        }
        let start = self.start as i64 + delta;
        let end = self.end as i64 + delta;
        if start < 0 || end > total as i64 {
            return None;
        }
        Some(Self {
            start: start as u64,
            end: end as u64,
        })
    }

    /// End moved by `bars` bars (negative shortens), clamped to the track
    pub fn resized_by_bars(
        &self,
        bars: i32,
        bar_frames: f64,
        min_len: u64,
        total: u64,
    ) -> Option<Self> {
        let delta = (bars as f64 * bar_frames).round() as i64;
        let end = (self.end as i64 + delta).min(total as i64);
        if end <= self.start as i64 || end == self.end as i64 {
            return None;
        }
        if ((end - self.start as i64) as u64) < min_len.max(1) {
            return None;
        }
        Some(Self {
            start: self.start,
            end: end as u64,
        })
    }

    /// Each boundary moved to its nearest beat. Rejected when the result
    /// would be empty, inverted or shorter than `min_len`.
    pub fn snapped_to_grid(&self, grid: &BeatGrid, min_len: u64) -> Option<Self> {
        let start = grid.nearest_beat(self.start)?;
        let end = grid.nearest_beat(self.end)?;
        Self::checked(start, end, min_len)
    }

    /// Only the start moved to its nearest beat
    pub fn start_snapped_to_grid(&self, grid: &BeatGrid, min_len: u64) -> Option<Self> {
        Self::checked(grid.nearest_beat(self.start)?, self.end, min_len)
    }

    /// Only the end moved to its nearest beat
    pub fn end_snapped_to_grid(&self, grid: &BeatGrid, min_len: u64) -> Option<Self> {
        Self::checked(self.start, grid.nearest_beat(self.end)?, min_len)
    }

    fn checked(start: u64, end: u64, min_len: u64) -> Option<Self> {
        if start >= end || end - start < min_len.max(1) {
            return None;
        }
        Some(Self { start, end })
    }

    /// `bars` bars starting at the beat at or before `position`
    pub fn from_beat(
        position: u64,
        bars: u32,
        bar_frames: f64,
        grid: Option<&BeatGrid>,
        total: u64,
    ) -> Option<Self> {
        let start = grid
            .and_then(|g| g.beat_at_or_before(position))
            .unwrap_or(position);
        let len = (bars.max(1) as f64 * bar_frames).round() as u64;
        let end = start.saturating_add(len).min(total);
        (end > start).then_some(Self { start, end })
    }
}

/// Where the playhead stands relative to the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum LoopState {
    #[default]
    NoLoop = 0,
    /// Region set, playhead not yet inside it
    LoopArmed = 1,
    Looping = 2,
    /// Inside the seam crossfade before the wrap
    Crossfading = 3,
}

impl LoopState {
    pub fn is_engaged(self) -> bool {
        matches!(self, LoopState::Looping | LoopState::Crossfading)
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => LoopState::LoopArmed,
            2 => LoopState::Looping,
            3 => LoopState::Crossfading,
            _ => LoopState::NoLoop,
        }
    }
}

/// Up to two buffer positions and the weight of the second
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Taps {
    pub primary: f64,
    pub secondary: f64,
    /// 0.0 reads only `primary`
    pub blend: f32,
}

impl Taps {
    fn single(position: f64) -> Self {
        Self {
            primary: position,
            secondary: position,
            blend: 0.0,
        }
    }
}

/// One wrap point: reads in `[zone_start, end)` blend toward `x - shift`,
/// reads at or past `end` continue at `x - shift`
#[derive(Debug, Clone, Copy, PartialEq)]
struct Seam {
    zone_start: f64,
    end: f64,
    shift: f64,
}

impl Seam {
    fn steady(region: LoopRegion, xfade: u64) -> Self {
        Self {
            zone_start: (region.end - xfade) as f64,
            end: region.end as f64,
            shift: (region.len() - xfade) as f64,
        }
    }

    /// Wrap from `from`'s end into `to`, landing `xfade` frames past `to`'s start
    fn transition(from: LoopRegion, to: LoopRegion, xfade: u64) -> Self {
        let zone_start = (from.end - xfade) as f64;
        Self {
            zone_start,
            end: from.end as f64,
            shift: zone_start - to.start as f64,
        }
    }

    #[inline]
    fn blend(&self, x: f64) -> Taps {
        let u = (x - self.zone_start) / (self.end - self.zone_start);
        Taps {
            primary: x,
            secondary: x - self.shift,
            blend: (0.5 - 0.5 * (PI * u).cos()) as f32,
        }
    }
}

/// Read mapping captured by a grain for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LoopMap {
    transition: Option<Seam>,
    steady: Option<Seam>,
}

impl LoopMap {
    /// Plain linear reads
    pub const IDENTITY: LoopMap = LoopMap {
        transition: None,
        steady: None,
    };

    pub fn is_identity(&self) -> bool {
        self.transition.is_none() && self.steady.is_none()
    }

    /// Resolve an unrolled read position to buffer taps
    #[inline]
    pub fn locate(&self, position: f64) -> Taps {
        let mut x = position;

        if let Some(t) = self.transition {
            if x < t.zone_start {
                return Taps::single(x);
            }
            if x < t.end {
                return t.blend(x);
            }
            x -= t.shift;
        }

        if let Some(s) = self.steady {
            if x >= s.end {
                let wraps = ((x - s.end) / s.shift).floor() + 1.0;
                x -= wraps * s.shift;
                if x >= s.end {
                    x -= s.shift;
                }
            }
            if x >= s.zone_start && x < s.end {
                return s.blend(x);
            }
        }

        Taps::single(x)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Transition {
    to: LoopRegion,
    xfade: u64,
}

/// Render-side loop state machine
#[derive(Debug, Clone)]
pub struct LoopManager {
    state: LoopState,
    active: Option<LoopRegion>,
    /// Edit waiting for the next wrap
    transition: Option<Transition>,
    crossfade_frames: u64,
    map: LoopMap,
}

impl LoopManager {
    pub fn new(crossfade_frames: u64) -> Self {
        Self {
            state: LoopState::NoLoop,
            active: None,
            transition: None,
            crossfade_frames,
            map: LoopMap::IDENTITY,
        }
    }

    /// Forget everything, e.g. on track change
    pub fn reset(&mut self, crossfade_frames: u64) {
        *self = Self::new(crossfade_frames);
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn active_region(&self) -> Option<LoopRegion> {
        self.active
    }

    /// Region playback will follow once any pending edit lands
    pub fn target_region(&self) -> Option<LoopRegion> {
        self.transition.map(|t| t.to).or(self.active)
    }

    fn xfade_for(&self, region: LoopRegion) -> u64 {
        region.crossfade_len(self.crossfade_frames)
    }

    /// Seam the playhead will cross next
    fn current_seam(&self, active: LoopRegion) -> Seam {
        match self.transition {
            Some(t) => Seam::transition(active, t.to, t.xfade),
            None => Seam::steady(active, self.xfade_for(active)),
        }
    }

    fn rebuild_map(&mut self) {
        self.map = match (self.active, self.transition) {
            (Some(active), Some(t)) => LoopMap {
                transition: Some(Seam::transition(active, t.to, t.xfade)),
                steady: Some(Seam::steady(t.to, self.xfade_for(t.to))),
            },
            (Some(active), None) => LoopMap {
                transition: None,
                steady: Some(Seam::steady(active, self.xfade_for(active))),
            },
            (None, _) => LoopMap::IDENTITY,
        };
    }

    fn engage_if_inside(&mut self, position: f64) {
        if let Some(active) = self.active {
            if active.contains(position) {
                self.state = LoopState::Looping;
            }
        }
    }

    /// Reconcile with the region requested for this block
    pub fn sync(&mut self, requested: Option<LoopRegion>, position: f64) {
        let Some(region) = requested else {
            if self.state != LoopState::NoLoop || self.active.is_some() {
                self.state = LoopState::NoLoop;
                self.active = None;
                self.transition = None;
                self.map = LoopMap::IDENTITY;
            }
            return;
        };

        if self.target_region() == Some(region) {
            return;
        }

        let engaged_inside = self.state.is_engaged()
            && self.active.map_or(false, |active| active.contains(position));

        match self.active {
            Some(active) if engaged_inside => {
                // The seam in progress keeps its mapping; retried after the wrap
                if self.state == LoopState::Crossfading {
                    return;
                }
                let xfade = self.xfade_for(active).min(self.xfade_for(region));
                self.transition = Some(Transition { to: region, xfade });
            }
            _ => {
                self.active = Some(region);
                self.transition = None;
                self.state = LoopState::LoopArmed;
                self.engage_if_inside(position);
            }
        }
        self.rebuild_map();
    }

    /// Playhead relocated by a seek; pending edits land immediately
    pub fn on_seek(&mut self, position: f64) {
        if let Some(t) = self.transition.take() {
            self.active = Some(t.to);
        }
        if self.active.is_some() {
            self.state = LoopState::LoopArmed;
            self.engage_if_inside(position);
        }
        self.rebuild_map();
    }

    /// Advance the playhead by `delta` source frames, wrapping at the seam
    #[inline]
    pub fn advance(&mut self, position: f64, delta: f64) -> f64 {
        let mut pos = position + delta;
        let Some(active) = self.active else {
            return pos;
        };

        match self.state {
            LoopState::NoLoop => pos,
            LoopState::LoopArmed => {
                self.engage_if_inside(pos);
                if self.state.is_engaged() {
                    self.update_zone(pos);
                }
                pos
            }
            LoopState::Looping | LoopState::Crossfading => {
                let seam = self.current_seam(active);
                if pos >= seam.end {
                    pos -= seam.shift;
                    if let Some(t) = self.transition.take() {
                        self.active = Some(t.to);
                        self.rebuild_map();
                    }
                    if let Some(now) = self.active {
                        let steady = Seam::steady(now, self.xfade_for(now));
                        while pos >= steady.end {
                            pos -= steady.shift;
                        }
                    }
                    self.state = LoopState::Looping;
                }
                self.update_zone(pos);
                pos
            }
        }
    }

    fn update_zone(&mut self, pos: f64) {
        if let Some(active) = self.active {
            let seam = self.current_seam(active);
            self.state = if pos >= seam.zone_start {
                LoopState::Crossfading
            } else {
                LoopState::Looping
            };
        }
    }

    /// Mapping for a grain starting at `position`
    pub fn map_for(&self, position: f64) -> LoopMap {
        match (self.state, self.active) {
            (LoopState::NoLoop, _) | (_, None) => LoopMap::IDENTITY,
            (LoopState::LoopArmed, Some(active)) if position >= active.end as f64 => {
                LoopMap::IDENTITY
            }
            _ => self.map,
        }
    }
}

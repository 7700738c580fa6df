//! Audio engine for riff - stretched playback of one track with seamless loops
//!
//! This module provides the playback pipeline:
//! - Engine: control-thread API publishing immutable snapshots
//! - Renderer: audio-callback side, one snapshot per block
//! - Stretch: grain-based time stretch with independent pitch
//! - Looping: region edits, loop state machine and seam crossfades
//! - Effects: three-band EQ
//! - Export: offline render of a processed range

mod analysis_worker;
mod buffer;
mod config;
mod control;
mod effects;
mod engine;
mod error;
mod export;
mod looping;
mod renderer;
mod smoother;
pub mod stretch;
mod telemetry;
mod watchdog;

pub use analysis_worker::{AnalysisResult, AnalysisWorker};
pub use buffer::{AudioBuffer, Track, TrackId, MAX_CHANNELS, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE};
pub use config::EngineConfig;
pub use control::{
    ControlChannel, ControlSnapshot, LoopSettings, PlaybackParams, Reclaimer, SeekRequest,
    SnapshotReader,
};
pub use effects::{Biquad, BiquadKind, Effect, EqBand, EqGains, ThreeBandEq};
pub use engine::Engine;
pub use error::EngineError;
pub use export::{ExportRange, ExportSettings, ExportedAudio};
pub use looping::{LoopManager, LoopMap, LoopRegion, LoopState, Taps};
pub use renderer::Renderer;
pub use smoother::{GainRamp, ParameterSmoother};
pub use stretch::StretchEngine;
pub use telemetry::{Telemetry, TelemetrySnapshot};
pub use watchdog::Watchdog;

//! Audio analysis module for riff
//!
//! Provides the offline beat grid estimator used to snap loop boundaries
//! to musical structure.

mod beatgrid;

pub use beatgrid::{BeatGrid, BeatGridAnalyzer, GridSource, DEFAULT_BPM};

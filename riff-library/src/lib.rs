//! Track loading for riff - decoding, resampling, and player settings

mod config;
mod loader;

pub use config::PlayerConfig;
pub use loader::{DecodedTrack, LoadError, TrackLoader, TrackMetadata};

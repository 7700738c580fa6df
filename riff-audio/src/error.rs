//! Engine error types

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the control-facing engine API
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Decoded samples don't agree with their claimed layout
    #[error("decoded audio is inconsistent: {reason}")]
    DecodeMismatch { reason: String },
    #[error("invalid range {start}..{end} for a buffer of {total} frames")]
    InvalidRange { start: u64, end: u64, total: u64 },
    /// The render context stopped advancing
    #[error("render pipeline stalled for {stalled_for:?}")]
    EngineStall { stalled_for: Duration },
    #[error("no track loaded")]
    NothingLoaded,
}

impl EngineError {
    pub(crate) fn mismatch(reason: impl Into<String>) -> Self {
        Self::DecodeMismatch {
            reason: reason.into(),
        }
    }
}

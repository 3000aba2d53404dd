// Module audio - Processing context, clock, automation and output

pub mod bus;
pub mod clock;
pub mod context;
pub mod dsp_utils;
pub mod metrics;
pub mod output;
pub mod parameters;
pub mod resources;

use crate::engine::FailureKind;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AudioError {
    #[error("No audio output device found")]
    NoDevice,

    #[error("Audio device configuration error: {0}")]
    Config(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Audio access denied: {0}")]
    PermissionDenied(String),

    /// Recorded failure from an earlier attempt; never retried
    #[error("Audio unavailable: {0}")]
    Unavailable(String),

    #[error("Audio context is closed")]
    Closed,

    #[error("Audio context is suspended")]
    Suspended,

    #[error("Context is rendered by its device, not by the host")]
    NotOffline,
}

impl AudioError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AudioError::PermissionDenied(_) => FailureKind::PermissionDenied,
            AudioError::NotOffline => FailureKind::InvalidParameter,
            _ => FailureKind::PlatformUnavailable,
        }
    }
}

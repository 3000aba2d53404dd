// Module MIDI - Hardware ports, message normalisation and pitch maths

pub mod device;
pub mod event;
pub mod input;
pub mod manager;
pub mod pitch;

use crate::engine::FailureKind;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MidiError {
    #[error("MIDI not supported on this platform: {0}")]
    Unsupported(String),

    #[error("MIDI access denied: {0}")]
    PermissionDenied(String),

    #[error("MIDI port unavailable: {0}")]
    PortUnavailable(String),

    #[error("MIDI connection failed: {0}")]
    Connect(String),

    #[error("MIDI send failed: {0}")]
    Send(String),

    #[error("MIDI is disabled for this session")]
    Inert,
}

impl MidiError {
    pub fn kind(&self) -> FailureKind {
        match self {
            MidiError::Unsupported(_) | MidiError::Inert => FailureKind::PlatformUnavailable,
            MidiError::PermissionDenied(_) => FailureKind::PermissionDenied,
            MidiError::PortUnavailable(_) | MidiError::Connect(_) | MidiError::Send(_) => {
                FailureKind::TransportFailure
            }
        }
    }
}

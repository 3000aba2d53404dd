// Module engine - The facade every note source goes through

pub mod export;
pub mod facade;

pub use facade::{SoundEngine, TickReport};

use crate::audio::AudioError;
use crate::config::ConfigError;
use crate::messaging::note::{InvalidParameter, NoteEvent, NoteId, StopReason};
use crate::messaging::notification::Notification;
use crate::midi::MidiError;
use crate::midi::device::DeviceChange;
use crate::peer::PeerError;
use crate::peer::session::PeerEvent;
use serde::Serialize;
use std::fmt;

/// Failure taxonomy shared by every subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// No audio/MIDI support; the feature stays off
    PlatformUnavailable,
    /// Hardware access declined; only an explicit user action retries
    PermissionDenied,
    /// Peer link failed; the peer is removed
    TransportFailure,
    /// A note's completion timer never fired; the idle sweep collects it
    SchedulingOverrun,
    /// Rejected at the facade boundary
    InvalidParameter,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::PlatformUnavailable => "platform unavailable",
            FailureKind::PermissionDenied => "permission denied",
            FailureKind::TransportFailure => "transport failure",
            FailureKind::SchedulingOverrun => "scheduling overrun",
            FailureKind::InvalidParameter => "invalid parameter",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Midi(#[from] MidiError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    InvalidParameter(#[from] InvalidParameter),

    #[error("Sound engine has been disposed")]
    Disposed,
}

impl EngineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::Audio(e) => e.kind(),
            EngineError::Midi(e) => e.kind(),
            EngineError::Peer(e) => e.kind(),
            EngineError::Config(_) | EngineError::InvalidParameter(_) => FailureKind::InvalidParameter,
            EngineError::Disposed => FailureKind::PlatformUnavailable,
        }
    }
}

/// What the facade publishes to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    NoteStarted { id: NoteId, event: NoteEvent },
    NoteStopped { id: NoteId, reason: StopReason },
    Device { change: DeviceChange },
    MidiControl { channel: u8, controller: u8, value: u8 },
    PitchBend { channel: u8, value: f32 },
    Peer { event: PeerEvent },
    Notification { notification: Notification },
}

/// Result of initialize(); None means the subsystem was never asked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Availability {
    pub audio: Option<bool>,
    pub midi: Option<bool>,
    pub peers: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let invalid = EngineError::from(InvalidParameter {
            field: "frequency",
            value: 0.0,
        });
        assert_eq!(invalid.kind(), FailureKind::InvalidParameter);
        assert_eq!(
            EngineError::from(AudioError::PermissionDenied("x".into())).kind(),
            FailureKind::PermissionDenied
        );
        assert_eq!(EngineError::from(AudioError::NoDevice).kind(), FailureKind::PlatformUnavailable);
        assert_eq!(
            EngineError::from(PeerError::ChannelClosed("notes".into())).kind(),
            FailureKind::TransportFailure
        );
        assert_eq!(EngineError::from(MidiError::Inert).kind(), FailureKind::PlatformUnavailable);
        assert_eq!(EngineError::Disposed.to_string(), "Sound engine has been disposed");
    }

    #[test]
    fn test_events_serialise_with_type_tag() {
        let event = EngineEvent::NoteStopped {
            id: NoteId::new(),
            reason: StopReason::Swept,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "note-stopped");
        assert_eq!(json["reason"], "swept");
    }
}

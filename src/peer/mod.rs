// Module peer - Jam sessions between engines over a reliable ordered channel

pub mod connection;
pub mod memory;
pub mod session;
pub mod signal;
pub mod transport;

use crate::engine::FailureKind;
use connection::PeerState;
use signal::SignalKind;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PeerError {
    #[error("Peer networking is disabled")]
    Disabled,

    #[error("Invalid peer id '{0}'")]
    InvalidPeer(String),

    #[error("Unknown peer '{0}'")]
    UnknownPeer(String),

    #[error("Signal addressed to '{to}', we are '{local}'")]
    Misaddressed { to: String, local: String },

    #[error("Unexpected {kind} from '{peer}'")]
    UnexpectedSignal { peer: String, kind: SignalKind },

    #[error("Peer '{peer}' cannot go from {from} to {to}")]
    InvalidTransition { peer: String, from: PeerState, to: PeerState },

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Signalling failed: {0}")]
    Signaling(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Data channel '{0}' is closed")]
    ChannelClosed(String),
}

impl PeerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PeerError::Disabled => FailureKind::PlatformUnavailable,
            PeerError::InvalidPeer(_)
            | PeerError::Misaddressed { .. }
            | PeerError::UnexpectedSignal { .. }
            | PeerError::InvalidTransition { .. }
            | PeerError::Malformed(_) => FailureKind::InvalidParameter,
            PeerError::UnknownPeer(_)
            | PeerError::Signaling(_)
            | PeerError::Transport(_)
            | PeerError::ChannelClosed(_) => FailureKind::TransportFailure,
        }
    }
}

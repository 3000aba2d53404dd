// Peer connection - Per-peer state machine and owned transport

use super::PeerError;
use super::transport::{DataChannel, PeerTransport};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerState {
    New,
    Offering,
    Answering,
    Connected,
    Disconnected,
    Failed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Failed)
    }

    /// New -> (Offering | Answering) -> Connected -> (Disconnected | Failed)
    ///
    /// Offering -> Answering happens when this side loses an offer collision.
    pub fn can_transition_to(self, next: PeerState) -> bool {
        use PeerState::*;
        match (self, next) {
            (New, Offering) | (New, Answering) => true,
            (Offering, Answering) => true,
            (Offering, Connected) | (Answering, Connected) => true,
            (state, Disconnected) | (state, Failed) => !state.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PeerState::New => "new",
            PeerState::Offering => "offering",
            PeerState::Answering => "answering",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Snapshot for the host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub state: PeerState,
    pub initiator: bool,
    pub has_channel: bool,
    pub media_stream: Option<String>,
}

pub struct PeerConnection {
    pub(crate) id: String,
    pub(crate) transport: Box<dyn PeerTransport>,
    pub(crate) channel: Option<Box<dyn DataChannel>>,
    pub(crate) media_stream: Option<String>,
    pub(crate) initiator: bool,
    state: PeerState,
    remote_description_set: bool,
    pending_candidates: Vec<Value>,
}

impl PeerConnection {
    pub fn new(id: impl Into<String>, transport: Box<dyn PeerTransport>, initiator: bool) -> Self {
        Self {
            id: id.into(),
            transport,
            channel: None,
            media_stream: None,
            initiator,
            state: PeerState::New,
            remote_description_set: false,
            pending_candidates: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn transition(&mut self, next: PeerState) -> Result<(), PeerError> {
        if !self.state.can_transition_to(next) {
            return Err(PeerError::InvalidTransition {
                peer: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(peer = %self.id, from = %self.state, to = %next, "Peer state");
        self.state = next;
        Ok(())
    }

    /// Apply a remote candidate now, or hold it until the remote description lands
    pub fn add_candidate(&mut self, candidate: Value) -> Result<(), PeerError> {
        if self.remote_description_set {
            self.transport.add_ice_candidate(&candidate)
        } else {
            self.pending_candidates.push(candidate);
            Ok(())
        }
    }

    pub fn take_pending_candidates(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.pending_candidates)
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Mark the remote description applied and flush queued candidates
    pub fn remote_description_applied(&mut self) -> Result<(), PeerError> {
        self.remote_description_set = true;
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.transport.add_ice_candidate(&candidate) {
                tracing::warn!(peer = %self.id, error = %e, "Dropping queued ICE candidate");
            }
        }
        Ok(())
    }

    pub fn has_open_channel(&self) -> bool {
        self.channel.as_ref().is_some_and(|channel| channel.is_open())
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            state: self.state,
            initiator: self.initiator,
            has_channel: self.has_open_channel(),
            media_stream: self.media_stream.clone(),
        }
    }

    /// Close the channel and transport; drops queued candidates
    pub fn close(&mut self) {
        if let Some(channel) = self.channel.as_mut() {
            channel.close();
        }
        self.channel = None;
        self.transport.close();
        self.pending_candidates.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::memory::MemoryNetwork;
    use crate::peer::transport::TransportFactory;
    use serde_json::json;

    #[test]
    fn test_state_machine_edges() {
        use PeerState::*;
        assert!(New.can_transition_to(Offering));
        assert!(New.can_transition_to(Answering));
        assert!(Offering.can_transition_to(Answering));
        assert!(Answering.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Failed));
        assert!(New.can_transition_to(Disconnected));

        assert!(!New.can_transition_to(Connected));
        assert!(!Answering.can_transition_to(Offering));
        assert!(!Connected.can_transition_to(Offering));
        assert!(!Failed.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Connected));
    }

    #[test]
    fn test_invalid_transition_is_reported() {
        let network = MemoryNetwork::new();
        let transport = network.factory().create("a", "b", true).unwrap();
        let mut peer = PeerConnection::new("b", transport, true);
        assert!(matches!(
            peer.transition(PeerState::Connected),
            Err(PeerError::InvalidTransition { .. })
        ));
        assert_eq!(peer.state(), PeerState::New);
    }

    #[test]
    fn test_candidates_queue_until_remote_description() {
        let network = MemoryNetwork::new();
        let mut factory = network.factory();
        let mut alice = factory.create("a", "b", true).unwrap();
        let offer = alice.create_offer().unwrap();

        let transport = factory.create("b", "a", false).unwrap();
        let mut peer = PeerConnection::new("a", transport, false);
        peer.add_candidate(json!({"candidate": "early"})).unwrap();
        peer.add_candidate(json!({"candidate": "early-2"})).unwrap();
        assert_eq!(peer.pending_candidates(), 2);

        peer.transport.accept_offer(&offer).unwrap();
        peer.remote_description_applied().unwrap();
        assert_eq!(peer.pending_candidates(), 0);
        assert!(peer.add_candidate(json!({"candidate": "late"})).is_ok());
    }
}

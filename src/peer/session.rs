// Peer session - Signalling, per-peer links and NoteEvent exchange
//
// Everything runs on the engine tick: signals are handled as they arrive,
// transports are polled in poll(). Delivery is ordered per peer only.

use super::PeerError;
use super::connection::{PeerConnection, PeerInfo, PeerState};
use super::signal::{SignalKind, SignalMessage, SignalingRelay};
use super::transport::{NOTES_CHANNEL, TransportEvent, TransportFactory};
use crate::config::PeerConfig;
use crate::connection::reconnect::{BackoffPolicy, RetrySchedule, RetryStep};
use crate::messaging::note::NoteEvent;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "kebab-case")]
pub enum RemovalReason {
    /// remove_peer / disable / dispose
    Local,
    /// Remote side closed
    Disconnected,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PeerEvent {
    StateChanged { peer: String, state: PeerState },
    Removed { peer: String, reason: RemovalReason },
}

pub struct PeerSession {
    local_id: String,
    config: PeerConfig,
    factory: Box<dyn TransportFactory>,
    relay: Box<dyn SignalingRelay>,
    peers: BTreeMap<String, PeerConnection>,
    events: Vec<PeerEvent>,
    reconnects: HashMap<String, RetrySchedule>,
    /// Back-off carried across attempts until the peer connects again
    backoff: HashMap<String, RetrySchedule>,
}

impl PeerSession {
    pub fn new(
        local_id: impl Into<String>,
        config: PeerConfig,
        factory: Box<dyn TransportFactory>,
        relay: Box<dyn SignalingRelay>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            config,
            factory,
            relay,
            peers: BTreeMap::new(),
            events: Vec::new(),
            reconnects: HashMap::new(),
            backoff: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.values().map(PeerConnection::info).collect()
    }

    pub fn peer_state(&self, peer_id: &str) -> Option<PeerState> {
        self.peers.get(peer_id).map(PeerConnection::state)
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|peer| peer.state() == PeerState::Connected)
            .count()
    }

    pub fn drain_events(&mut self) -> Vec<PeerEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn pending_reconnects(&self) -> usize {
        self.reconnects.len()
    }

    fn relay(&mut self, kind: SignalKind, to: &str, data: serde_json::Value) -> Result<(), PeerError> {
        let message = SignalMessage::new(kind, self.local_id.clone(), to, data);
        self.relay.send(message)
    }

    fn set_state(&mut self, peer_id: &str, state: PeerState) -> Result<(), PeerError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| PeerError::UnknownPeer(peer_id.to_string()))?;
        peer.transition(state)?;
        self.events.push(PeerEvent::StateChanged {
            peer: peer_id.to_string(),
            state,
        });
        Ok(())
    }

    /// Start a link as initiator; no-op when one is already live
    pub fn connect(&mut self, peer_id: &str) -> Result<(), PeerError> {
        if peer_id.is_empty() || peer_id == self.local_id {
            return Err(PeerError::InvalidPeer(peer_id.to_string()));
        }
        if let Some(existing) = self.peers.get(peer_id) {
            if !existing.state().is_terminal() {
                return Ok(());
            }
            self.peers.remove(peer_id);
        }
        self.reconnects.remove(peer_id);

        let mut transport = self.factory.create(&self.local_id, peer_id, true)?;
        let channel = transport.create_data_channel(NOTES_CHANNEL)?;
        let offer = transport.create_offer()?;

        let mut peer = PeerConnection::new(peer_id, transport, true);
        peer.channel = Some(channel);
        self.peers.insert(peer_id.to_string(), peer);
        self.set_state(peer_id, PeerState::Offering)?;

        if let Err(e) = self.relay(SignalKind::Offer, peer_id, offer) {
            self.remove_with_reason(peer_id, RemovalReason::Failed(e.to_string()));
            return Err(e);
        }
        tracing::info!(peer = %peer_id, "Offer sent");
        Ok(())
    }

    /// Consume one inbound signalling payload
    ///
    /// Payloads addressed to someone else, or that make no sense for the
    /// peer's current state, are rejected without touching the session.
    pub fn handle_signal(&mut self, message: SignalMessage) -> Result<(), PeerError> {
        if message.to != self.local_id {
            return Err(PeerError::Misaddressed {
                to: message.to,
                local: self.local_id.clone(),
            });
        }
        if message.from == self.local_id || message.from.is_empty() {
            return Err(PeerError::InvalidPeer(message.from));
        }

        match message.kind {
            SignalKind::Offer => self.handle_offer(&message),
            SignalKind::Answer => self.handle_answer(&message),
            SignalKind::IceCandidate => {
                let peer = self.peers.get_mut(&message.from).ok_or_else(|| PeerError::UnexpectedSignal {
                    peer: message.from.clone(),
                    kind: message.kind,
                })?;
                peer.add_candidate(message.data)
            }
        }
    }

    fn handle_offer(&mut self, message: &SignalMessage) -> Result<(), PeerError> {
        let from = message.from.as_str();
        if let Some(existing) = self.peers.get(from) {
            match existing.state() {
                PeerState::Offering if self.local_id.as_str() < from => {
                    // Both offered; the smaller id keeps the initiator role
                    tracing::debug!(peer = %from, "Offer collision, keeping our offer");
                    return Ok(());
                }
                PeerState::Offering => {
                    tracing::debug!(peer = %from, "Offer collision, yielding to remote offer");
                    if let Some(mut ours) = self.peers.remove(from) {
                        // Candidates the remote already sent target its own offer
                        let queued = ours.take_pending_candidates();
                        ours.close();
                        return self.answer_offer(from, &message.data, queued);
                    }
                }
                state if state.is_terminal() => {
                    self.peers.remove(from);
                }
                _ => {
                    return Err(PeerError::UnexpectedSignal {
                        peer: from.to_string(),
                        kind: message.kind,
                    });
                }
            }
        }
        self.answer_offer(from, &message.data, Vec::new())
    }

    fn answer_offer(
        &mut self,
        from: &str,
        offer: &serde_json::Value,
        queued: Vec<serde_json::Value>,
    ) -> Result<(), PeerError> {
        self.reconnects.remove(from);
        let mut transport = self.factory.create(&self.local_id, from, false)?;
        let answer = transport.accept_offer(offer)?;

        let mut peer = PeerConnection::new(from, transport, false);
        for candidate in queued {
            peer.add_candidate(candidate)?;
        }
        peer.remote_description_applied()?;
        self.peers.insert(from.to_string(), peer);
        self.set_state(from, PeerState::Answering)?;

        if let Err(e) = self.relay(SignalKind::Answer, from, answer) {
            self.remove_with_reason(from, RemovalReason::Failed(e.to_string()));
            return Err(e);
        }
        tracing::info!(peer = %from, "Answer sent");
        Ok(())
    }

    fn handle_answer(&mut self, message: &SignalMessage) -> Result<(), PeerError> {
        let peer = self
            .peers
            .get_mut(&message.from)
            .filter(|peer| peer.state() == PeerState::Offering)
            .ok_or_else(|| PeerError::UnexpectedSignal {
                peer: message.from.clone(),
                kind: message.kind,
            })?;
        peer.transport.accept_answer(&message.data)?;
        peer.remote_description_applied()
    }

    /// Drive transports; returns NoteEvents received since the last poll
    pub fn poll(&mut self) -> Vec<NoteEvent> {
        self.run_reconnects();

        let mut received = Vec::new();
        let mut outgoing = Vec::new();
        let mut connected = Vec::new();
        let mut ended: Vec<(String, RemovalReason)> = Vec::new();

        for (id, peer) in self.peers.iter_mut() {
            while let Some(event) = peer.transport.poll_event() {
                match event {
                    TransportEvent::Connected => connected.push(id.clone()),
                    TransportEvent::IceCandidate(candidate) => outgoing.push((id.clone(), candidate)),
                    TransportEvent::DataChannel(channel) => {
                        if channel.label() == NOTES_CHANNEL {
                            peer.channel = Some(channel);
                        } else {
                            tracing::debug!(peer = %id, label = channel.label(), "Ignoring unknown data channel");
                        }
                    }
                    TransportEvent::MediaStream(stream) => peer.media_stream = Some(stream),
                    TransportEvent::Disconnected => {
                        ended.push((id.clone(), RemovalReason::Disconnected));
                        break;
                    }
                    TransportEvent::Failed(reason) => {
                        ended.push((id.clone(), RemovalReason::Failed(reason)));
                        break;
                    }
                }
            }

            if let Some(channel) = peer.channel.as_mut() {
                while let Some(payload) = channel.try_recv() {
                    match NoteEvent::from_wire(&payload) {
                        Ok(event) => match event.validate() {
                            Ok(()) => received.push(event),
                            Err(e) => tracing::warn!(peer = %id, error = %e, "Dropping invalid remote note"),
                        },
                        Err(e) => tracing::warn!(peer = %id, error = %e, "Dropping malformed data channel payload"),
                    }
                }
            }
        }

        for (peer_id, candidate) in outgoing {
            if let Err(e) = self.relay(SignalKind::IceCandidate, &peer_id, candidate) {
                tracing::warn!(peer = %peer_id, error = %e, "Could not relay ICE candidate");
            }
        }
        for peer_id in connected {
            if self.set_state(&peer_id, PeerState::Connected).is_ok() {
                self.backoff.remove(&peer_id);
                tracing::info!(peer = %peer_id, "Peer connected");
            }
        }
        for (peer_id, reason) in ended {
            self.remove_with_reason(&peer_id, reason);
        }
        received
    }

    /// Send a locally originated note to every connected peer
    pub fn broadcast(&mut self, event: &NoteEvent) -> usize {
        if event.is_remote {
            return 0;
        }
        let payload = match event.to_wire() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Could not encode note for peers");
                return 0;
            }
        };

        let mut sent = 0;
        let mut failed = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            if peer.state() != PeerState::Connected {
                continue;
            }
            let Some(channel) = peer.channel.as_mut() else {
                continue;
            };
            match channel.send(&payload) {
                Ok(()) => sent += 1,
                Err(e) => failed.push((id.clone(), e)),
            }
        }
        for (peer_id, error) in failed {
            tracing::warn!(peer = %peer_id, error = %error, "Data channel send failed");
            self.remove_with_reason(&peer_id, RemovalReason::Failed(error.to_string()));
        }
        sent
    }

    /// Close and forget a peer; false when it was already gone
    pub fn remove_peer(&mut self, peer_id: &str) -> bool {
        self.reconnects.remove(peer_id);
        self.backoff.remove(peer_id);
        self.remove_with_reason(peer_id, RemovalReason::Local)
    }

    fn remove_with_reason(&mut self, peer_id: &str, reason: RemovalReason) -> bool {
        let Some(mut peer) = self.peers.remove(peer_id) else {
            return false;
        };
        let initiator = peer.is_initiator();
        peer.close();

        tracing::info!(peer = %peer_id, reason = ?reason, "Peer removed");
        if let RemovalReason::Failed(_) = &reason
            && initiator
            && self.config.auto_reconnect
        {
            let schedule = self
                .backoff
                .remove(peer_id)
                .unwrap_or_else(|| RetrySchedule::new(BackoffPolicy::peers(self.config.max_reconnect_attempts)));
            self.reconnects.insert(peer_id.to_string(), schedule);
        }
        self.events.push(PeerEvent::Removed {
            peer: peer_id.to_string(),
            reason,
        });
        true
    }

    fn run_reconnects(&mut self) {
        if self.reconnects.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut due = Vec::new();
        self.reconnects.retain(|peer_id, schedule| match schedule.poll(now) {
            RetryStep::Wait => true,
            RetryStep::Attempt(_) => {
                due.push((peer_id.clone(), schedule.clone()));
                false
            }
            RetryStep::Exhausted => {
                tracing::warn!(peer = %peer_id, attempts = schedule.attempts(), "Giving up reconnecting to peer");
                false
            }
        });

        for (peer_id, schedule) in due {
            tracing::info!(peer = %peer_id, attempt = schedule.attempts(), "Reconnecting to peer");
            match self.connect(&peer_id) {
                Ok(()) => {
                    self.backoff.insert(peer_id, schedule);
                }
                Err(e) => {
                    tracing::warn!(peer = %peer_id, error = %e, "Reconnect attempt failed");
                    self.reconnects.entry(peer_id).or_insert(schedule);
                }
            }
        }
    }

    /// Remove every peer; returns how many were removed
    pub fn close_all(&mut self) -> usize {
        self.reconnects.clear();
        self.backoff.clear();
        let ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.iter().filter(|id| self.remove_with_reason(id, RemovalReason::Local)).count()
    }
}

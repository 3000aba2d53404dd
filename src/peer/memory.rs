// In-memory transport - Peer links inside one process
//
// Used by tests and the demo binary. Each offer creates a link identified by
// a token carried in the offer/answer payloads; data channels are ring buffer
// pairs. `sever` simulates a network failure.

use super::PeerError;
use super::transport::{DataChannel, PeerTransport, TransportEvent, TransportFactory};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

const CHANNEL_CAPACITY: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct LinkState {
    connected: bool,
    severed: bool,
    closed_by: Option<String>,
    /// Channel ends waiting for their owner to poll them
    pending_channels: HashMap<String, Vec<MemoryChannel>>,
}

struct Link {
    token: String,
    endpoints: (String, String),
    state: Mutex<LinkState>,
}

impl Link {
    fn is_open(&self) -> bool {
        let state = lock(&self.state);
        state.connected && !state.severed && state.closed_by.is_none()
    }
}

pub struct MemoryChannel {
    label: String,
    tx: HeapProd<String>,
    rx: HeapCons<String>,
    link: Arc<Link>,
    closed: bool,
}

impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        !self.closed && self.link.is_open()
    }

    fn send(&mut self, payload: &str) -> Result<(), PeerError> {
        if !self.is_open() {
            return Err(PeerError::ChannelClosed(self.label.clone()));
        }
        self.tx
            .try_push(payload.to_string())
            .map_err(|_| PeerError::Transport(format!("channel '{}' is full", self.label)))
    }

    fn try_recv(&mut self) -> Option<String> {
        self.rx.try_pop()
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

fn channel_pair(label: &str, link: &Arc<Link>) -> (MemoryChannel, MemoryChannel) {
    let (tx_a, rx_b) = HeapRb::<String>::new(CHANNEL_CAPACITY).split();
    let (tx_b, rx_a) = HeapRb::<String>::new(CHANNEL_CAPACITY).split();
    let a = MemoryChannel {
        label: label.to_string(),
        tx: tx_a,
        rx: rx_a,
        link: Arc::clone(link),
        closed: false,
    };
    let b = MemoryChannel {
        label: label.to_string(),
        tx: tx_b,
        rx: rx_b,
        link: Arc::clone(link),
        closed: false,
    };
    (a, b)
}

/// Shared registry of live links; clones see the same network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    links: Arc<Mutex<HashMap<String, Arc<Link>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> MemoryTransportFactory {
        MemoryTransportFactory {
            network: self.clone(),
        }
    }

    fn open_link(&self, local: &str, remote: &str) -> Arc<Link> {
        let link = Arc::new(Link {
            token: uuid::Uuid::new_v4().to_string(),
            endpoints: (local.to_string(), remote.to_string()),
            state: Mutex::new(LinkState::default()),
        });
        lock(&self.links).insert(link.token.clone(), Arc::clone(&link));
        link
    }

    fn find_link(&self, token: &str) -> Option<Arc<Link>> {
        lock(&self.links).get(token).cloned()
    }

    fn forget_link(&self, token: &str) {
        lock(&self.links).remove(token);
    }

    /// Fail every link between two peers, as a dropped connection would
    pub fn sever(&self, a: &str, b: &str) -> usize {
        let links: Vec<Arc<Link>> = lock(&self.links)
            .values()
            .filter(|link| {
                let (x, y) = &link.endpoints;
                (x == a && y == b) || (x == b && y == a)
            })
            .cloned()
            .collect();
        for link in &links {
            lock(&link.state).severed = true;
        }
        links.len()
    }

    pub fn link_count(&self) -> usize {
        lock(&self.links).len()
    }
}

pub struct MemoryTransportFactory {
    network: MemoryNetwork,
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&mut self, local_id: &str, remote_id: &str, initiator: bool) -> Result<Box<dyn PeerTransport>, PeerError> {
        Ok(Box::new(MemoryTransport {
            network: self.network.clone(),
            local: local_id.to_string(),
            remote: remote_id.to_string(),
            initiator,
            link: None,
            remote_description: false,
            events: VecDeque::new(),
            reported_connected: false,
            reported_end: false,
            closed: false,
        }))
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    local: String,
    remote: String,
    initiator: bool,
    link: Option<Arc<Link>>,
    remote_description: bool,
    events: VecDeque<TransportEvent>,
    reported_connected: bool,
    reported_end: bool,
    closed: bool,
}

impl MemoryTransport {
    fn ensure_link(&mut self) -> Result<Arc<Link>, PeerError> {
        if self.closed {
            return Err(PeerError::Transport("transport closed".to_string()));
        }
        if let Some(link) = &self.link {
            return Ok(Arc::clone(link));
        }
        if !self.initiator {
            return Err(PeerError::Signaling("responder has no offer yet".to_string()));
        }
        let link = self.network.open_link(&self.local, &self.remote);
        self.link = Some(Arc::clone(&link));
        Ok(link)
    }

    fn queue_local_candidate(&mut self, token: &str) {
        self.events.push_back(TransportEvent::IceCandidate(json!({
            "candidate": format!("memory {} {}", self.local, token),
            "sdpMid": "0",
        })));
    }

    fn token_of(payload: &Value) -> Result<&str, PeerError> {
        payload
            .get("link")
            .and_then(Value::as_str)
            .ok_or_else(|| PeerError::Malformed("session description without link token".to_string()))
    }
}

impl PeerTransport for MemoryTransport {
    fn create_offer(&mut self) -> Result<Value, PeerError> {
        if !self.initiator {
            return Err(PeerError::Signaling("only the initiator offers".to_string()));
        }
        let link = self.ensure_link()?;
        self.queue_local_candidate(&link.token);
        Ok(json!({ "sdp": format!("memory-offer {}", self.local), "link": link.token }))
    }

    fn accept_offer(&mut self, offer: &Value) -> Result<Value, PeerError> {
        if self.closed {
            return Err(PeerError::Transport("transport closed".to_string()));
        }
        let token = Self::token_of(offer)?;
        let link = self
            .network
            .find_link(token)
            .ok_or_else(|| PeerError::Signaling(format!("offer for unknown link {}", token)))?;
        self.link = Some(Arc::clone(&link));
        self.remote_description = true;
        self.queue_local_candidate(&link.token);
        Ok(json!({ "sdp": format!("memory-answer {}", self.local), "link": link.token }))
    }

    fn accept_answer(&mut self, answer: &Value) -> Result<(), PeerError> {
        let token = Self::token_of(answer)?;
        let link = self
            .link
            .as_ref()
            .filter(|link| link.token == token)
            .ok_or_else(|| PeerError::Signaling("answer does not match our offer".to_string()))?;
        self.remote_description = true;
        lock(&link.state).connected = true;
        Ok(())
    }

    fn add_ice_candidate(&mut self, candidate: &Value) -> Result<(), PeerError> {
        if !self.remote_description {
            return Err(PeerError::Signaling("remote description not set".to_string()));
        }
        match candidate.get("candidate").and_then(Value::as_str) {
            Some(_) => Ok(()),
            None => Err(PeerError::Malformed("candidate without candidate line".to_string())),
        }
    }

    fn create_data_channel(&mut self, label: &str) -> Result<Box<dyn DataChannel>, PeerError> {
        let link = self.ensure_link()?;
        let (local, remote) = channel_pair(label, &link);
        lock(&link.state)
            .pending_channels
            .entry(self.remote.clone())
            .or_default()
            .push(remote);
        Ok(Box::new(local))
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        if self.closed || self.reported_end {
            return None;
        }
        let link = self.link.as_ref()?;
        let mut state = lock(&link.state);

        if state.severed {
            self.reported_end = true;
            return Some(TransportEvent::Failed("link severed".to_string()));
        }
        if state.closed_by.as_deref().is_some_and(|by| by != self.local) {
            self.reported_end = true;
            return Some(TransportEvent::Disconnected);
        }
        if state.connected && !self.reported_connected {
            self.reported_connected = true;
            return Some(TransportEvent::Connected);
        }
        if state.connected
            && let Some(pending) = state.pending_channels.get_mut(&self.local)
            && let Some(channel) = pending.pop()
        {
            return Some(TransportEvent::DataChannel(Box::new(channel)));
        }
        None
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(link) = self.link.take() {
            let mut state = lock(&link.state);
            if state.closed_by.is_none() {
                state.closed_by = Some(self.local.clone());
            }
            drop(state);
            self.network.forget_link(&link.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiate(network: &MemoryNetwork) -> (Box<dyn PeerTransport>, Box<dyn PeerTransport>, Box<dyn DataChannel>) {
        let mut factory = network.factory();
        let mut alice = factory.create("alice", "bob", true).unwrap();
        let mut bob = factory.create("bob", "alice", false).unwrap();

        let channel = alice.create_data_channel("notes").unwrap();
        let offer = alice.create_offer().unwrap();
        let answer = bob.accept_offer(&offer).unwrap();
        alice.accept_answer(&answer).unwrap();
        (alice, bob, channel)
    }

    fn drain(transport: &mut Box<dyn PeerTransport>) -> Vec<TransportEvent> {
        std::iter::from_fn(|| transport.poll_event()).collect()
    }

    #[test]
    fn test_negotiation_opens_channel() {
        let network = MemoryNetwork::new();
        let (mut alice, mut bob, mut alice_channel) = negotiate(&network);

        let alice_events = drain(&mut alice);
        assert!(matches!(alice_events[0], TransportEvent::IceCandidate(_)));
        assert!(alice_events.iter().any(|e| matches!(e, TransportEvent::Connected)));

        let bob_events = drain(&mut bob);
        let mut bob_channel = bob_events
            .into_iter()
            .find_map(|e| match e {
                TransportEvent::DataChannel(channel) => Some(channel),
                _ => None,
            })
            .unwrap();
        assert_eq!(bob_channel.label(), "notes");

        alice_channel.send("one").unwrap();
        alice_channel.send("two").unwrap();
        assert_eq!(bob_channel.try_recv().as_deref(), Some("one"));
        assert_eq!(bob_channel.try_recv().as_deref(), Some("two"));
        bob_channel.send("back").unwrap();
        assert_eq!(alice_channel.try_recv().as_deref(), Some("back"));
    }

    #[test]
    fn test_candidates_need_remote_description() {
        let network = MemoryNetwork::new();
        let mut factory = network.factory();
        let mut alice = factory.create("alice", "bob", true).unwrap();
        let candidate = json!({"candidate": "memory bob"});
        assert!(matches!(alice.add_ice_candidate(&candidate), Err(PeerError::Signaling(_))));

        let (mut alice, _bob, _channel) = negotiate(&network);
        assert!(alice.add_ice_candidate(&candidate).is_ok());
        assert!(matches!(alice.add_ice_candidate(&json!({})), Err(PeerError::Malformed(_))));
    }

    #[test]
    fn test_channel_closed_before_connect() {
        let network = MemoryNetwork::new();
        let mut alice = network.factory().create("alice", "bob", true).unwrap();
        let mut channel = alice.create_data_channel("notes").unwrap();
        assert!(!channel.is_open());
        assert!(matches!(channel.send("x"), Err(PeerError::ChannelClosed(_))));
    }

    #[test]
    fn test_close_notifies_remote() {
        let network = MemoryNetwork::new();
        let (mut alice, mut bob, _channel) = negotiate(&network);
        drain(&mut alice);
        drain(&mut bob);

        alice.close();
        assert!(matches!(bob.poll_event(), Some(TransportEvent::Disconnected)));
        assert!(bob.poll_event().is_none());
        assert_eq!(network.link_count(), 0);
    }

    #[test]
    fn test_sever_fails_both_sides() {
        let network = MemoryNetwork::new();
        let (mut alice, mut bob, mut channel) = negotiate(&network);
        drain(&mut alice);
        drain(&mut bob);

        assert_eq!(network.sever("bob", "alice"), 1);
        assert!(matches!(alice.poll_event(), Some(TransportEvent::Failed(_))));
        assert!(matches!(bob.poll_event(), Some(TransportEvent::Failed(_))));
        assert!(!channel.is_open());
    }

    #[test]
    fn test_offer_for_unknown_link() {
        let network = MemoryNetwork::new();
        let mut bob = network.factory().create("bob", "alice", false).unwrap();
        assert!(matches!(bob.accept_offer(&json!({"link": "nope"})), Err(PeerError::Signaling(_))));
        assert!(matches!(bob.accept_offer(&json!({})), Err(PeerError::Malformed(_))));
        assert!(bob.create_offer().is_err());
    }
}

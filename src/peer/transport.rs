// Transport contract - What a peer link must provide to the session layer
//
// A transport negotiates one peer link through opaque offer/answer/candidate
// payloads and exposes reliable, ordered data channels once connected.

use super::PeerError;
use serde_json::Value;

/// Label of the channel that carries NoteEvents
pub const NOTES_CHANNEL: &str = "notes";

pub trait DataChannel: Send {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    fn send(&mut self, payload: &str) -> Result<(), PeerError>;
    /// Next received payload, in send order
    fn try_recv(&mut self) -> Option<String>;
    fn close(&mut self);
}

pub enum TransportEvent {
    Connected,
    /// Remote side closed the link
    Disconnected,
    Failed(String),
    /// Local candidate to relay to the remote peer
    IceCandidate(Value),
    /// Channel opened by the remote peer
    DataChannel(Box<dyn DataChannel>),
    /// Remote media stream id
    MediaStream(String),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::Connected => f.write_str("Connected"),
            TransportEvent::Disconnected => f.write_str("Disconnected"),
            TransportEvent::Failed(reason) => write!(f, "Failed({})", reason),
            TransportEvent::IceCandidate(candidate) => write!(f, "IceCandidate({})", candidate),
            TransportEvent::DataChannel(channel) => write!(f, "DataChannel({})", channel.label()),
            TransportEvent::MediaStream(id) => write!(f, "MediaStream({})", id),
        }
    }
}

pub trait PeerTransport: Send {
    /// Initiator side: local description to send as an offer
    fn create_offer(&mut self) -> Result<Value, PeerError>;
    /// Responder side: apply the remote offer, return the answer
    fn accept_offer(&mut self, offer: &Value) -> Result<Value, PeerError>;
    /// Initiator side: apply the remote answer
    fn accept_answer(&mut self, answer: &Value) -> Result<(), PeerError>;
    /// Fails until a remote description is set
    fn add_ice_candidate(&mut self, candidate: &Value) -> Result<(), PeerError>;
    fn create_data_channel(&mut self, label: &str) -> Result<Box<dyn DataChannel>, PeerError>;
    fn poll_event(&mut self) -> Option<TransportEvent>;
    fn close(&mut self);
}

pub trait TransportFactory: Send {
    fn create(&mut self, local_id: &str, remote_id: &str, initiator: bool) -> Result<Box<dyn PeerTransport>, PeerError>;
}

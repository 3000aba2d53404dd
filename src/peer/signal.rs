// Signalling payloads - Offer/answer/ICE envelopes relayed by the host

use super::PeerError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        })
    }
}

/// `{type, from, to, data}`; `data` is opaque to this layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub data: Value,
}

impl SignalMessage {
    pub fn new(kind: SignalKind, from: impl Into<String>, to: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            from: from.into(),
            to: to.into(),
            data,
        }
    }

    pub fn to_json(&self) -> Result<String, PeerError> {
        serde_json::to_string(self).map_err(|e| PeerError::Malformed(e.to_string()))
    }

    pub fn from_json(payload: &str) -> Result<Self, PeerError> {
        let message: Self = serde_json::from_str(payload).map_err(|e| PeerError::Malformed(e.to_string()))?;
        if message.from.is_empty() || message.to.is_empty() {
            return Err(PeerError::Malformed("empty sender or recipient".to_string()));
        }
        Ok(message)
    }
}

/// Host-supplied channel that carries signalling to other peers
pub trait SignalingRelay: Send {
    fn send(&mut self, message: SignalMessage) -> Result<(), PeerError>;
}

impl<F> SignalingRelay for F
where
    F: FnMut(SignalMessage) -> Result<(), PeerError> + Send,
{
    fn send(&mut self, message: SignalMessage) -> Result<(), PeerError> {
        self(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let msg = SignalMessage::new(SignalKind::IceCandidate, "alice", "bob", json!({"candidate": "c1"}));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["from"], "alice");
        assert_eq!(value["to"], "bob");
        assert_eq!(value["data"]["candidate"], "c1");
    }

    #[test]
    fn test_parse() {
        let msg = SignalMessage::from_json(r#"{"type":"offer","from":"a","to":"b","data":{"sdp":"x"}}"#).unwrap();
        assert_eq!(msg.kind, SignalKind::Offer);
        assert_eq!(msg.data["sdp"], "x");

        let no_data = SignalMessage::from_json(r#"{"type":"answer","from":"a","to":"b"}"#).unwrap();
        assert_eq!(no_data.data, Value::Null);
    }

    #[test]
    fn test_malformed_is_rejected() {
        assert!(matches!(SignalMessage::from_json("not json"), Err(PeerError::Malformed(_))));
        assert!(matches!(
            SignalMessage::from_json(r#"{"type":"hello","from":"a","to":"b"}"#),
            Err(PeerError::Malformed(_))
        ));
        assert!(matches!(
            SignalMessage::from_json(r#"{"type":"offer","from":"","to":"b"}"#),
            Err(PeerError::Malformed(_))
        ));
    }

    #[test]
    fn test_closure_relay() {
        let mut sent = Vec::new();
        {
            let mut relay = |msg: SignalMessage| -> Result<(), PeerError> {
                sent.push(msg.kind);
                Ok(())
            };
            SignalingRelay::send(&mut relay, SignalMessage::new(SignalKind::Offer, "a", "b", Value::Null)).unwrap();
        }
        assert_eq!(sent, vec![SignalKind::Offer]);
    }
}

//! Peer link message types for the reference overlay node.
//!
//! Nodes talk to each other over TCP with the same 4-byte big-endian length
//! framing the pipes use; each frame body is one JSON [`MeshMessage`].

use crate::error::WireError;
use base64::Engine;
use courier_types::Envelope;
use serde::{Deserialize, Serialize};

/// Current peer link protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// A message exchanged between two overlay nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MeshMessage {
    /// First message on every link, in both directions.
    #[serde(rename = "hello")]
    Hello {
        /// The sender's overlay address (its public key hex).
        address: String,
        /// The sender's listening URI, so the receiver can gossip it.
        listen_uri: String,
        protocol_version: u32,
    },
    /// Other nodes the sender knows about.
    #[serde(rename = "peers")]
    Peers { uris: Vec<String> },
    /// An envelope for the receiving node's agent.
    #[serde(rename = "deliver")]
    Deliver {
        /// Base64 of the encoded envelope.
        envelope: String,
    },
    /// The sender is going away.
    #[serde(rename = "goodbye")]
    Goodbye,
}

impl MeshMessage {
    pub fn hello(address: impl Into<String>, listen_uri: impl Into<String>) -> Self {
        Self::Hello {
            address: address.into(),
            listen_uri: listen_uri.into(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn deliver(envelope: &Envelope) -> Self {
        Self::Deliver {
            envelope: base64::engine::general_purpose::STANDARD.encode(envelope.encode()),
        }
    }

    /// Decode the envelope carried by a `Deliver` message.
    pub fn envelope(&self) -> Result<Option<Envelope>, WireError> {
        match self {
            Self::Deliver { envelope } => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(envelope)
                    .map_err(|e| WireError::HandshakeFailed(format!("bad base64 envelope: {e}")))?;
                Ok(Some(Envelope::decode(&bytes)?))
            }
            _ => Ok(None),
        }
    }
}

/// Serialize a message into a frame body.
pub fn encode_message(msg: &MeshMessage) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(msg)
}

/// Parse a frame body.
pub fn decode_message(body: &[u8]) -> Result<MeshMessage, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::PublicId;

    #[test]
    fn test_hello_serialization() {
        let msg = MeshMessage::hello("ab12", "127.0.0.1:9000");
        let json = String::from_utf8(encode_message(&msg).unwrap()).unwrap();
        assert!(json.contains("\"type\":\"hello\""));
        assert!(json.contains("\"protocol_version\":1"));
        assert_eq!(decode_message(json.as_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_deliver_carries_envelope() {
        let protocol: PublicId = "courier/default:0.1.0".parse().unwrap();
        let env = Envelope::new("b", "a", protocol, vec![0, 159, 255]).unwrap();
        let msg = MeshMessage::deliver(&env);
        let decoded = decode_message(&encode_message(&msg).unwrap()).unwrap();
        assert_eq!(decoded.envelope().unwrap(), Some(env));
    }

    #[test]
    fn test_non_deliver_has_no_envelope() {
        assert_eq!(MeshMessage::Goodbye.envelope().unwrap(), None);
    }

    #[test]
    fn test_bad_deliver_payload() {
        let msg = MeshMessage::Deliver {
            envelope: "!!not base64!!".into(),
        };
        assert!(msg.envelope().is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(decode_message(br#"{"type":"ping"}"#).is_err());
    }
}

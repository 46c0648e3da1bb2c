//! Rendezvous wire protocol
//!
//! JSON text frames over a line-oriented bidirectional channel. The
//! service only relays: registration, peer presence, and the opaque
//! session-setup blobs exchanged while two nodes establish a direct
//! channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::NodeId;

/// A rendezvous frame, client-to-server or server-to-client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    Register {
        node_id: NodeId,
    },
    GetPeers {
        node_id: NodeId,
    },
    Offer {
        from: NodeId,
        to: NodeId,
        signal: Value,
    },
    Answer {
        from: NodeId,
        to: NodeId,
        signal: Value,
    },
    IceCandidate {
        from: NodeId,
        to: NodeId,
        signal: Value,
    },
    Ping,
    Pong {
        timestamp: i64,
    },
    PeerList {
        peers: Vec<NodeId>,
    },
    PeerJoined {
        node_id: NodeId,
        timestamp: i64,
    },
    PeerLeft {
        node_id: NodeId,
        timestamp: i64,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        original_message: Option<String>,
    },
}

impl SignalMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

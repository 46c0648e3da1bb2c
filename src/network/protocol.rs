//! Peer-to-peer wire protocol
//!
//! Every frame is a JSON object with a mandatory `type` field. The
//! underlying transport preserves message boundaries and ordering, so
//! one JSON text equals one frame.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::NodeId;
use crate::ledger::{Block, Transaction};

/// A peer-to-peer frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerMessage {
    Ping {
        timestamp: i64,
    },
    Pong {
        /// Echo of the originating ping's timestamp.
        timestamp: i64,
    },
    FileOffer {
        file_id: Uuid,
        name: String,
        size: u64,
        mime_type: String,
        sha256_hash: String,
    },
    FileUnavailable {
        file_id: Uuid,
    },
    FileRequest {
        file_id: Uuid,
        requester: NodeId,
    },
    FileMetadata {
        file_id: Uuid,
        name: String,
        size: u64,
        mime_type: String,
        total_chunks: u32,
        chunk_size: u32,
    },
    FileChunk {
        file_id: Uuid,
        chunk_index: u32,
        chunk_data_b64: String,
        is_last: bool,
    },
    FileError {
        file_id: Uuid,
        reason: String,
    },
    Transaction {
        transaction: Transaction,
    },
    BlockProposal {
        block: Block,
    },
    BlockVote {
        block_hash: String,
        voter: NodeId,
        approve: bool,
        timestamp: i64,
    },
    NewBlock {
        block: Block,
    },
    BlockchainSyncRequest {
        from_index: u64,
        request_id: Uuid,
    },
    BlockchainSyncResponse {
        request_id: Uuid,
        blocks: Vec<Block>,
        total_blocks: u64,
    },
    LeaderAnnouncement {
        leader: NodeId,
        block_height: u64,
        timestamp: i64,
    },
}

impl PeerMessage {
    /// Serialize to a wire frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a wire frame.
    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags_are_kebab_case() {
        let msg = PeerMessage::FileUnavailable { file_id: Uuid::new_v4() };
        let frame = msg.encode().unwrap();
        assert!(frame.contains("\"type\":\"file-unavailable\""));

        let msg = PeerMessage::BlockchainSyncRequest {
            from_index: 3,
            request_id: Uuid::new_v4(),
        };
        assert!(msg.encode().unwrap().contains("\"type\":\"blockchain-sync-request\""));
    }

    #[test]
    fn test_roundtrip_ping_pong() {
        let frame = PeerMessage::Ping { timestamp: 42 }.encode().unwrap();
        assert_eq!(PeerMessage::decode(&frame).unwrap(), PeerMessage::Ping { timestamp: 42 });
    }

    #[test]
    fn test_roundtrip_file_chunk() {
        let msg = PeerMessage::FileChunk {
            file_id: Uuid::new_v4(),
            chunk_index: 7,
            chunk_data_b64: "aGVsbG8=".into(),
            is_last: true,
        };
        let frame = msg.encode().unwrap();
        assert_eq!(PeerMessage::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(PeerMessage::decode("{\"type\":\"mystery\"}").is_err());
    }

    #[test]
    fn test_missing_type_rejected() {
        assert!(PeerMessage::decode("{\"timestamp\":1}").is_err());
    }
}

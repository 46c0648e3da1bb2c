//! p2p-ledger - Peer-to-peer file sharing with a permissioned ledger
//!
//! Each node is an autonomous participant that:
//! - Establishes direct encrypted peer sessions through a minimal
//!   rendezvous exchange, with heartbeat and half-open detection
//! - Shares and downloads files through a chunked, content-addressed
//!   transfer protocol with integrity verification
//! - Takes part in a permissioned, leader-rotated ledger that records
//!   signed transactions in a hash-chained sequence of blocks
//!
//! All node state lives behind a single driver task; the `Node` handle
//! and the `NodeEvent` stream are the only surfaces a front-end needs.

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod files;
pub mod ledger;
pub mod network;
pub mod node;
pub mod rendezvous;
pub mod util;

// Re-export commonly used types
pub use config::NodeConfig;
pub use crypto::{KeyDirectory, NodeId, NodeKeypair};
pub use node::{Node, NodeError, NodeEvent};

// Re-export the ledger model
pub use ledger::{Block, Blockchain, Mempool, Transaction};

// Re-export consensus types
pub use consensus::{ConsensusEngine, ConsensusPhase, Whitelist};

// Re-export file sharing types
pub use files::{DownloadFailure, FileEntry, FileOffer, TransferError};

// Re-export networking seams
pub use network::{Connector, MemoryFabric, PeerMessage, SessionState};
pub use rendezvous::{LocalRendezvous, SignalDialer, SignalMessage, TcpSignalDialer};

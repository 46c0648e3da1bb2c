//! Node configuration

use std::time::Duration;

use crate::crypto::NodeId;

/// Default rendezvous service endpoint.
pub const DEFAULT_RENDEZVOUS_ADDR: &str = "127.0.0.1:8080";

/// Default size of a transfer chunk in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 65_536;

/// Node configuration
#[derive(Clone)]
pub struct NodeConfig {
    /// Rendezvous service endpoint (host:port).
    pub rendezvous_addr: String,
    /// Nodes authorized to lead and vote, in scheduling order.
    pub whitelist: Vec<NodeId>,
    /// Public keys known out of band, as `(node_id, base64 key)` pairs.
    pub known_keys: Vec<(NodeId, String)>,
    /// Minimum approvals to commit a block, before the majority floor.
    pub min_votes: usize,
    /// Transactions taken from the mempool per proposed block.
    pub max_block_transactions: usize,
    /// Concurrent download limit.
    pub max_concurrent_downloads: usize,
    /// Concurrent upload limit; excess requests are refused.
    pub max_concurrent_uploads: usize,
    /// Chunk size used when serving files.
    pub chunk_size: usize,
    /// Heartbeat ping period.
    pub heartbeat_interval: Duration,
    /// Silence after which a session is considered dead.
    pub liveness_timeout: Duration,
    /// Leader rotation period; also the slot length of the schedule.
    pub rotation_interval: Duration,
    /// Block production period while leader.
    pub production_interval: Duration,
    /// Voting window after a proposal.
    pub vote_window: Duration,
    /// Delay between a whitelisted peer connecting and the catch-up
    /// sync request sent to it.
    pub sync_delay: Duration,
    /// Rendezvous channel open timeout at startup.
    pub connect_timeout: Duration,
    /// Initial delay before reconnecting a dropped rendezvous channel.
    pub reconnect_delay: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rendezvous_addr: DEFAULT_RENDEZVOUS_ADDR.to_string(),
            whitelist: Vec::new(),
            known_keys: Vec::new(),
            min_votes: 1,
            max_block_transactions: 10,
            max_concurrent_downloads: 3,
            max_concurrent_uploads: 8,
            chunk_size: DEFAULT_CHUNK_SIZE,
            heartbeat_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(90),
            rotation_interval: Duration::from_secs(30),
            production_interval: Duration::from_secs(10),
            vote_window: Duration::from_secs(5),
            sync_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

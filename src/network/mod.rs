//! Peer networking layer
//!
//! Typed JSON frames over an external, boundary-preserving transport:
//! - `protocol` defines the peer-to-peer frame types
//! - `transport` is the seam to the encrypted channel implementation
//! - `session` tracks one peer's connection state machine
//! - `registry` owns all sessions and performs sends

pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use protocol::PeerMessage;
pub use registry::PeerRegistry;
pub use session::{PeerSession, SessionState, SessionTrigger};
pub use transport::{ConnectError, Connector, MemoryFabric, PeerChannel};

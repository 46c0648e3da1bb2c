//! Rendezvous layer
//!
//! The only job of the rendezvous service is to introduce nodes: it
//! relays registration, peer presence, and opaque session-setup blobs.
//! Everything after the introduction flows over direct peer channels.

pub mod client;
pub mod hub;
pub mod link;
pub mod protocol;

pub use client::RendezvousClient;
pub use hub::{LocalRendezvous, LocalSignalDialer};
pub use link::{RendezvousError, SignalDialer, SignalLink, TcpSignalDialer};
pub use protocol::SignalMessage;

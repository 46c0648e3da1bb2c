//! Peer transport seam
//!
//! The encrypted datagram transport between peers is an external
//! collaborator; the core only assumes an ordered, reliable,
//! message-boundary-preserving channel per peer with authenticated
//! endpoints. `Connector` is that seam: it stages a connection on the
//! dialing side, turns a remote offer into a live channel on the
//! answering side, and shuttles opaque signal blobs in between.
//!
//! `MemoryFabric` is the in-process implementation used by tests and
//! local multi-node setups: channels are unbounded in-memory pipes and
//! the signal blob carries only a pairing token.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::crypto::NodeId;

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("No staged connection for {0}")]
    NoPending(NodeId),
    #[error("Malformed signal blob")]
    BadSignal,
    #[error("Transport error: {0}")]
    Transport(String),
}

/// One peer's end of an established channel. Frames are JSON texts.
pub struct PeerChannel {
    pub tx: mpsc::UnboundedSender<String>,
    pub rx: mpsc::UnboundedReceiver<String>,
}

impl PeerChannel {
    /// A connected pair of channel ends.
    pub fn pair() -> (PeerChannel, PeerChannel) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            PeerChannel { tx: a_tx, rx: b_rx },
            PeerChannel { tx: b_tx, rx: a_rx },
        )
    }
}

/// External transport driven through the rendezvous signal exchange.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Dialer side: stage a connection to `remote` and produce the
    /// offer signal blob to relay through the rendezvous service.
    async fn initiate(&self, local: &NodeId, remote: &NodeId) -> Result<Value, ConnectError>;

    /// Dialer side: consume the remote answer, yielding the channel.
    async fn complete(
        &self,
        local: &NodeId,
        remote: &NodeId,
        answer: &Value,
    ) -> Result<PeerChannel, ConnectError>;

    /// Answering side: accept a remote offer, yielding the channel and
    /// the answer blob to relay back.
    async fn respond(
        &self,
        local: &NodeId,
        remote: &NodeId,
        offer: &Value,
    ) -> Result<(PeerChannel, Value), ConnectError>;

    /// Trickled candidate for a connection still being established.
    async fn candidate(&self, local: &NodeId, remote: &NodeId, signal: &Value)
        -> Result<(), ConnectError>;

    /// Discard a staged connection (dial abandoned or lost the
    /// mutual-dial tie-break).
    async fn abandon(&self, local: &NodeId, remote: &NodeId);
}

#[derive(Default)]
struct FabricState {
    /// Answer-side channel ends parked until the remote responds.
    offers: HashMap<String, PeerChannel>,
    /// Dial-side channel ends parked until the answer arrives, with the
    /// pairing token for cleanup.
    staged: HashMap<(NodeId, NodeId), (String, PeerChannel)>,
}

/// In-process transport fabric shared by every node in one process.
#[derive(Default)]
pub struct MemoryFabric {
    state: Mutex<FabricState>,
}

impl MemoryFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn token_of(signal: &Value) -> Result<String, ConnectError> {
        signal
            .get("session")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(ConnectError::BadSignal)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FabricState> {
        // Held only for map operations; never across await points.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Connector for MemoryFabric {
    async fn initiate(&self, local: &NodeId, remote: &NodeId) -> Result<Value, ConnectError> {
        let token = Uuid::new_v4().to_string();
        let (dial_end, answer_end) = PeerChannel::pair();

        let mut state = self.lock();
        state.offers.insert(token.clone(), answer_end);
        state
            .staged
            .insert((local.clone(), remote.clone()), (token.clone(), dial_end));
        Ok(json!({ "session": token }))
    }

    async fn complete(
        &self,
        local: &NodeId,
        remote: &NodeId,
        _answer: &Value,
    ) -> Result<PeerChannel, ConnectError> {
        let mut state = self.lock();
        state
            .staged
            .remove(&(local.clone(), remote.clone()))
            .map(|(_, channel)| channel)
            .ok_or_else(|| ConnectError::NoPending(remote.clone()))
    }

    async fn respond(
        &self,
        _local: &NodeId,
        remote: &NodeId,
        offer: &Value,
    ) -> Result<(PeerChannel, Value), ConnectError> {
        let token = Self::token_of(offer)?;
        let mut state = self.lock();
        let channel = state
            .offers
            .remove(&token)
            .ok_or_else(|| ConnectError::NoPending(remote.clone()))?;
        Ok((channel, json!({ "session": token })))
    }

    async fn candidate(
        &self,
        _local: &NodeId,
        _remote: &NodeId,
        _signal: &Value,
    ) -> Result<(), ConnectError> {
        // The in-memory fabric pairs directly; nothing to trickle.
        Ok(())
    }

    async fn abandon(&self, local: &NodeId, remote: &NodeId) {
        let mut state = self.lock();
        if let Some((token, _)) = state.staged.remove(&(local.clone(), remote.clone())) {
            state.offers.remove(&token);
        }
    }
}

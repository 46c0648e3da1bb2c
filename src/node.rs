//! Node driver
//!
//! One `Node` per participant. All mutable state lives in a single
//! driver task; the public handle submits commands over a channel and
//! every subsystem event funnels back into the same task, so no state
//! is ever touched from two tasks at once. Observers consume the
//! `NodeEvent` stream returned by `start`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::consensus::{
    ConsensusEngine, FinalizeOutcome, NewBlockOutcome, ProposalOutcome, Whitelist,
};
use crate::crypto::{KeyDirectory, NodeId, NodeKeypair};
use crate::files::{
    chunk_count, chunks, ChunkOutcome, DownloadFailure, FileEntry, FileOffer, OfferBoard,
    OfferOutcome, SharedCatalog, TransferEngine, TransferError,
};
use crate::ledger::{Block, Transaction, TransactionError};
use crate::network::{Connector, PeerChannel, PeerMessage, PeerRegistry, SessionState, SessionTrigger};
use crate::rendezvous::{RendezvousClient, RendezvousError, SignalDialer, SignalMessage};
use crate::util::now_ms;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error("Node stopped")]
    Stopped,
}

/// Events emitted by the node for any front-end to consume.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerConnected {
        peer_id: NodeId,
    },
    PeerDisconnected {
        peer_id: NodeId,
    },
    TransactionSubmitted {
        id: Uuid,
    },
    TransactionReceived {
        id: Uuid,
        from: NodeId,
    },
    BlockAdded {
        block: Block,
    },
    LeaderChanged {
        leader: Option<NodeId>,
    },
    FileShared {
        file_id: Uuid,
        name: String,
        sha256_hash: String,
    },
    FileAvailable {
        offer: FileOffer,
    },
    FileUnavailable {
        file_id: Uuid,
    },
    DownloadProgress {
        file_id: Uuid,
        received: u32,
        total: u32,
    },
    DownloadCompleted {
        file_id: Uuid,
        name: String,
        bytes: Vec<u8>,
    },
    DownloadFailed {
        file_id: Uuid,
        reason: DownloadFailure,
    },
    Log {
        message: String,
    },
}

enum Command {
    Share {
        name: String,
        mime_type: String,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<Uuid, NodeError>>,
    },
    StopShare {
        file_id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    Download {
        file_id: Uuid,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    CancelDownload {
        file_id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    SubmitTransaction {
        to: String,
        data: String,
        amount: f64,
        reply: oneshot::Sender<Result<Uuid, NodeError>>,
    },
    Dial {
        peer: NodeId,
    },
    DropPeer {
        peer: NodeId,
    },
    WhitelistAdd {
        peer: NodeId,
        reply: oneshot::Sender<bool>,
    },
    WhitelistRemove {
        peer: NodeId,
        reply: oneshot::Sender<bool>,
    },
    Chain {
        reply: oneshot::Sender<Vec<Block>>,
    },
    MempoolSize {
        reply: oneshot::Sender<usize>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<HashSet<NodeId>>,
    },
    Offers {
        reply: oneshot::Sender<Vec<FileOffer>>,
    },
    SharedFiles {
        reply: oneshot::Sender<Vec<FileEntry>>,
    },
    CurrentLeader {
        reply: oneshot::Sender<Option<NodeId>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Internal {
    Frame { peer: NodeId, msg: PeerMessage },
    SessionClosed { peer: NodeId },
    SyncDue { peer: NodeId },
    UploadDone,
}

/// Handle to a running node.
#[derive(Clone)]
pub struct Node {
    node_id: NodeId,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Node {
    /// Start a node: open the rendezvous channel (fatal on failure),
    /// register, and spawn the driver task.
    pub async fn start(
        keypair: NodeKeypair,
        config: NodeConfig,
        connector: Arc<dyn Connector>,
        dialer: Arc<dyn SignalDialer>,
    ) -> Result<(Node, mpsc::UnboundedReceiver<NodeEvent>), NodeError> {
        let node_id = keypair.node_id().clone();

        let (sig_tx, sig_rx) = mpsc::unbounded_channel();
        let rdv = RendezvousClient::start(
            dialer,
            node_id.clone(),
            config.connect_timeout,
            config.reconnect_delay,
            sig_tx,
        )
        .await?;

        let mut keys = KeyDirectory::new();
        // Our own binding always holds.
        let _ = keys.learn(&node_id, keypair.public_key());
        for (id, key_b64) in &config.known_keys {
            if let Err(e) = keys.learn_b64(id, key_b64) {
                warn!(%id, error = %e, "Skipping preseeded key");
            }
        }

        let engine = ConsensusEngine::new(
            node_id.clone(),
            Whitelist::from_members(config.whitelist.clone()),
            config.min_votes,
            config.max_block_transactions,
            config.rotation_interval.as_millis() as u64,
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let driver = NodeDriver {
            registry: PeerRegistry::new(node_id.clone()),
            transfers: TransferEngine::new(
                config.max_concurrent_downloads,
                config.max_concurrent_uploads,
            ),
            config,
            keypair,
            keys,
            engine,
            shared: SharedCatalog::new(),
            offers: OfferBoard::new(),
            connector,
            rdv,
            events: event_tx,
            internal_tx,
            tasks: JoinSet::new(),
            vote_deadline: None,
            next_production: None,
            pending_syncs: HashSet::new(),
        };
        tokio::spawn(driver.run(cmd_rx, internal_rx, sig_rx));

        Ok((Node { node_id, cmd_tx }, event_rx))
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Share a file: hash it, record it, and announce it to all peers.
    pub async fn share(
        &self,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<Uuid, NodeError> {
        let (name, mime_type) = (name.into(), mime_type.into());
        self.request(|reply| Command::Share { name, mime_type, bytes, reply })
            .await?
    }

    /// Withdraw a shared file and announce its removal.
    pub async fn stop_share(&self, file_id: Uuid) -> Result<bool, NodeError> {
        self.request(|reply| Command::StopShare { file_id, reply }).await
    }

    /// Start downloading an offered file from its advertiser.
    pub async fn download(&self, file_id: Uuid) -> Result<(), NodeError> {
        self.request(|reply| Command::Download { file_id, reply }).await?
    }

    pub async fn cancel_download(&self, file_id: Uuid) -> Result<bool, NodeError> {
        self.request(|reply| Command::CancelDownload { file_id, reply }).await
    }

    /// Sign, pool, and broadcast a transaction from this node.
    pub async fn submit_transaction(
        &self,
        to: impl Into<String>,
        data: impl Into<String>,
        amount: f64,
    ) -> Result<Uuid, NodeError> {
        let (to, data) = (to.into(), data.into());
        self.request(|reply| Command::SubmitTransaction { to, data, amount, reply })
            .await?
    }

    /// Ask the node to dial a peer. No-op when a session exists.
    pub fn dial(&self, peer: NodeId) {
        let _ = self.cmd_tx.send(Command::Dial { peer });
    }

    /// Tear down the session with a peer.
    pub fn drop_peer(&self, peer: NodeId) {
        let _ = self.cmd_tx.send(Command::DropPeer { peer });
    }

    pub async fn whitelist_add(&self, peer: NodeId) -> Result<bool, NodeError> {
        self.request(|reply| Command::WhitelistAdd { peer, reply }).await
    }

    pub async fn whitelist_remove(&self, peer: NodeId) -> Result<bool, NodeError> {
        self.request(|reply| Command::WhitelistRemove { peer, reply }).await
    }

    pub async fn chain(&self) -> Result<Vec<Block>, NodeError> {
        self.request(|reply| Command::Chain { reply }).await
    }

    pub async fn mempool_size(&self) -> Result<usize, NodeError> {
        self.request(|reply| Command::MempoolSize { reply }).await
    }

    pub async fn connected_peers(&self) -> Result<HashSet<NodeId>, NodeError> {
        self.request(|reply| Command::ConnectedPeers { reply }).await
    }

    pub async fn offers(&self) -> Result<Vec<FileOffer>, NodeError> {
        self.request(|reply| Command::Offers { reply }).await
    }

    pub async fn shared_files(&self) -> Result<Vec<FileEntry>, NodeError> {
        self.request(|reply| Command::SharedFiles { reply }).await
    }

    pub async fn current_leader(&self) -> Result<Option<NodeId>, NodeError> {
        self.request(|reply| Command::CurrentLeader { reply }).await
    }

    /// Stop the driver: cancel timers, abort transfers, close sessions.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }
}

struct NodeDriver {
    config: NodeConfig,
    keypair: NodeKeypair,
    keys: KeyDirectory,
    registry: PeerRegistry,
    engine: ConsensusEngine,
    shared: SharedCatalog,
    offers: OfferBoard,
    transfers: TransferEngine,
    connector: Arc<dyn Connector>,
    rdv: RendezvousClient,
    events: mpsc::UnboundedSender<NodeEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    tasks: JoinSet<()>,
    /// Single-shot voting window for the pending proposal.
    vote_deadline: Option<Instant>,
    /// Next block-production fire; armed only while leader.
    next_production: Option<Instant>,
    pending_syncs: HashSet<Uuid>,
}

impl NodeDriver {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
        mut sig_rx: mpsc::UnboundedReceiver<SignalMessage>,
    ) {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rotation = interval(self.config.rotation_interval);
        rotation.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let vote_at = self.vote_deadline;
            let produce_at = self.next_production;
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        self.shutdown();
                        return;
                    }
                },
                Some(msg) = internal_rx.recv() => self.on_internal(msg).await,
                Some(sig) = sig_rx.recv() => self.on_signal(sig).await,
                _ = heartbeat.tick() => self.on_heartbeat(),
                _ = rotation.tick() => self.recompute_leader(),
                _ = sleep_until(vote_at.unwrap_or_else(Instant::now)), if vote_at.is_some() => {
                    self.on_vote_window();
                }
                _ = sleep_until(produce_at.unwrap_or_else(Instant::now)), if produce_at.is_some() => {
                    self.on_production();
                }
            }
        }
    }

    fn local_id(&self) -> &NodeId {
        self.keypair.node_id()
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Share { name, mime_type, bytes, reply } => {
                let entry = self.shared.share(name, mime_type, bytes);
                info!(file_id = %entry.id, name = %entry.name, size = entry.size, "Sharing file");
                self.registry.broadcast(&offer_message(&entry), None);
                self.emit(NodeEvent::FileShared {
                    file_id: entry.id,
                    name: entry.name.clone(),
                    sha256_hash: entry.sha256_hash.clone(),
                });
                let _ = reply.send(Ok(entry.id));
            }
            Command::StopShare { file_id, reply } => {
                let removed = self.shared.remove(&file_id).is_some();
                if removed {
                    self.registry
                        .broadcast(&PeerMessage::FileUnavailable { file_id }, None);
                }
                let _ = reply.send(removed);
            }
            Command::Download { file_id, reply } => {
                let _ = reply.send(self.start_download(file_id));
            }
            Command::CancelDownload { file_id, reply } => {
                let _ = reply.send(self.transfers.cancel(&file_id));
            }
            Command::SubmitTransaction { to, data, amount, reply } => {
                let tx = Transaction::new(self.local_id().clone(), to, data, amount);
                match self.engine.submit_local(tx, &self.keypair, &self.keys) {
                    Ok(tx) => {
                        self.registry
                            .broadcast(&PeerMessage::Transaction { transaction: tx.clone() }, None);
                        self.emit(NodeEvent::TransactionSubmitted { id: tx.id });
                        let _ = reply.send(Ok(tx.id));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            Command::Dial { peer } => self.dial(peer).await,
            Command::DropPeer { peer } => {
                if let Some(session) = self.registry.get_mut(&peer) {
                    session.apply(SessionTrigger::Teardown);
                }
                self.close_session(&peer, "local teardown");
            }
            Command::WhitelistAdd { peer, reply } => {
                let changed = self.engine.whitelist_add(peer);
                if changed {
                    self.recompute_leader();
                }
                let _ = reply.send(changed);
            }
            Command::WhitelistRemove { peer, reply } => {
                let changed = self.engine.whitelist_remove(&peer);
                if changed {
                    self.recompute_leader();
                }
                let _ = reply.send(changed);
            }
            Command::Chain { reply } => {
                let _ = reply.send(self.engine.chain().blocks().to_vec());
            }
            Command::MempoolSize { reply } => {
                let _ = reply.send(self.engine.mempool_len());
            }
            Command::ConnectedPeers { reply } => {
                let _ = reply.send(self.registry.connected_peers());
            }
            Command::Offers { reply } => {
                let _ = reply.send(self.offers.list());
            }
            Command::SharedFiles { reply } => {
                let _ = reply.send(self.shared.list());
            }
            Command::CurrentLeader { reply } => {
                let _ = reply.send(self.engine.current_leader().cloned());
            }
            Command::Shutdown { .. } => unreachable!("handled in run loop"),
        }
    }

    fn start_download(&mut self, file_id: Uuid) -> Result<(), NodeError> {
        let Some(offer) = self.offers.get(&file_id).cloned() else {
            return Err(TransferError::UnknownOffer(file_id).into());
        };
        if !self.registry.is_open(&offer.advertiser) {
            return Err(TransferError::SourceOffline(offer.advertiser).into());
        }
        self.transfers.begin_download(&offer)?;

        let request = PeerMessage::FileRequest {
            file_id,
            requester: self.local_id().clone(),
        };
        if !self.registry.send(&offer.advertiser, &request) {
            self.transfers.cancel(&file_id);
            return Err(TransferError::SourceOffline(offer.advertiser).into());
        }
        debug!(%file_id, advertiser = %offer.advertiser, "Download requested");
        Ok(())
    }

    async fn dial(&mut self, peer: NodeId) {
        if !self.registry.begin_dial(&peer) {
            return;
        }
        debug!(%peer, "Dialing");
        match self.connector.initiate(self.local_id(), &peer).await {
            Ok(transport) => {
                let signal = json!({
                    "transport": transport,
                    "publicKey": self.keypair.public_key_b64(),
                });
                let sent = self.rdv.send(SignalMessage::Offer {
                    from: self.local_id().clone(),
                    to: peer.clone(),
                    signal,
                });
                if !sent {
                    warn!(%peer, "Rendezvous client gone, abandoning dial");
                    self.abort_dial(&peer).await;
                }
            }
            Err(e) => {
                warn!(%peer, error = %e, "Failed to stage connection");
                self.abort_dial(&peer).await;
            }
        }
    }

    async fn abort_dial(&mut self, peer: &NodeId) {
        self.connector.abandon(self.local_id(), peer).await;
        self.registry.finish_dial(peer);
        self.registry.remove(peer);
    }

    async fn on_signal(&mut self, sig: SignalMessage) {
        match sig {
            SignalMessage::PeerList { peers } => {
                for peer in peers {
                    self.dial(peer).await;
                }
            }
            SignalMessage::PeerJoined { node_id, .. } => self.dial(node_id).await,
            SignalMessage::PeerLeft { node_id, .. } => {
                // Established sessions have their own liveness; only an
                // unfinished dial is pointless now.
                if self.registry.dialing(&node_id) {
                    self.abort_dial(&node_id).await;
                }
            }
            SignalMessage::Offer { from, to, signal } => self.on_offer(from, to, signal).await,
            SignalMessage::Answer { from, to, signal } => self.on_answer(from, to, signal).await,
            SignalMessage::IceCandidate { from, signal, .. } => {
                let transport = signal.get("transport").cloned().unwrap_or(signal);
                if let Err(e) = self
                    .connector
                    .candidate(self.local_id(), &from, &transport)
                    .await
                {
                    debug!(%from, error = %e, "Candidate rejected");
                }
            }
            SignalMessage::Error { message, .. } => {
                warn!(%message, "Rendezvous error");
                self.emit(NodeEvent::Log {
                    message: format!("rendezvous error: {message}"),
                });
            }
            SignalMessage::Pong { .. } => {}
            // Client-to-server frames never arrive here.
            SignalMessage::Register { .. }
            | SignalMessage::GetPeers { .. }
            | SignalMessage::Ping => {}
        }
    }

    async fn on_offer(&mut self, from: NodeId, to: NodeId, signal: Value) {
        if to != *self.local_id() {
            return;
        }
        if self.registry.is_open(&from) {
            debug!(%from, "Ignoring offer for already-open session");
            return;
        }
        if self.registry.dialing(&from) {
            if !self.registry.offer_wins_tie(&from) {
                debug!(%from, "Mutual dial: keeping local dial as initiator");
                return;
            }
            // The remote is the initiator; our staged dial is redundant.
            debug!(%from, "Mutual dial: yielding to remote initiator");
            self.abort_dial(&from).await;
        }

        let Some(key_b64) = signal.get("publicKey").and_then(Value::as_str) else {
            warn!(%from, "Offer without public key, refusing");
            return;
        };
        if let Err(e) = self.keys.learn_b64(&from, key_b64) {
            warn!(%from, error = %e, "Offer failed identity binding, refusing");
            return;
        }

        let transport = signal.get("transport").cloned().unwrap_or(Value::Null);
        match self.connector.respond(self.local_id(), &from, &transport).await {
            Ok((channel, answer)) => {
                let reply_signal = json!({
                    "transport": answer,
                    "publicKey": self.keypair.public_key_b64(),
                });
                self.rdv.send(SignalMessage::Answer {
                    from: self.local_id().clone(),
                    to: from.clone(),
                    signal: reply_signal,
                });
                self.attach_channel(from, channel, false);
            }
            Err(e) => warn!(%from, error = %e, "Failed to accept offer"),
        }
    }

    async fn on_answer(&mut self, from: NodeId, to: NodeId, signal: Value) {
        if to != *self.local_id() {
            return;
        }
        if !self.registry.dialing(&from) {
            debug!(%from, "Ignoring answer without a pending dial");
            return;
        }
        let Some(key_b64) = signal.get("publicKey").and_then(Value::as_str) else {
            warn!(%from, "Answer without public key, abandoning dial");
            self.abort_dial(&from).await;
            return;
        };
        if let Err(e) = self.keys.learn_b64(&from, key_b64) {
            warn!(%from, error = %e, "Answer failed identity binding, abandoning dial");
            self.abort_dial(&from).await;
            return;
        }

        let transport = signal.get("transport").cloned().unwrap_or(Value::Null);
        match self.connector.complete(self.local_id(), &from, &transport).await {
            Ok(channel) => {
                self.registry.finish_dial(&from);
                self.attach_channel(from, channel, true);
            }
            Err(e) => {
                warn!(%from, error = %e, "Failed to complete dial");
                self.abort_dial(&from).await;
            }
        }
    }

    /// Wire an established channel into a session and run the open
    /// sequence.
    fn attach_channel(&mut self, peer: NodeId, channel: PeerChannel, initiator: bool) {
        let PeerChannel { tx, mut rx } = channel;

        let internal = self.internal_tx.clone();
        let reader_peer = peer.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match PeerMessage::decode(&frame) {
                    Ok(msg) => {
                        if internal
                            .send(Internal::Frame { peer: reader_peer.clone(), msg })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => warn!(peer = %reader_peer, error = %e, "Dropping malformed frame"),
                }
            }
            let _ = internal.send(Internal::SessionClosed { peer: reader_peer });
        });

        if !initiator || self.registry.get(&peer).is_none() {
            self.registry.insert_answering(&peer);
        }
        if let Some(session) = self.registry.get_mut(&peer) {
            session.establish(tx, reader, now_ms());
        }
        self.on_session_open(peer);
    }

    fn on_session_open(&mut self, peer: NodeId) {
        info!(%peer, "Peer session open");
        self.emit(NodeEvent::PeerConnected { peer_id: peer.clone() });

        // Bring the new peer up to date on our catalog, one unicast per
        // entry.
        for entry in self.shared.list() {
            self.registry.send(&peer, &offer_message(&entry));
        }

        // Whitelisted peers get a delayed catch-up sync request.
        if self.engine.whitelist().contains(&peer) {
            let delay = self.config.sync_delay;
            let internal = self.internal_tx.clone();
            let target = peer.clone();
            self.tasks.spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = internal.send(Internal::SyncDue { peer: target });
            });
        }

        self.recompute_leader();
    }

    fn close_session(&mut self, peer: &NodeId, reason: &str) {
        // A session in Open or Closing has been established; anything
        // still Connecting never surfaced to observers.
        let was_connected = self
            .registry
            .get(peer)
            .map(|s| matches!(s.state(), SessionState::Open | SessionState::Closing))
            .unwrap_or(false);
        if self.registry.remove(peer).is_none() {
            return;
        }
        info!(%peer, reason, "Peer session closed");
        if !was_connected {
            return;
        }
        self.emit(NodeEvent::PeerDisconnected { peer_id: peer.clone() });

        for file_id in self.offers.drop_advertiser(peer) {
            self.emit(NodeEvent::FileUnavailable { file_id });
        }
        for file_id in self.transfers.on_peer_gone(peer) {
            self.emit(NodeEvent::DownloadFailed {
                file_id,
                reason: DownloadFailure::SourceLost,
            });
        }
        self.recompute_leader();
    }

    fn on_heartbeat(&mut self) {
        let now = now_ms();
        let timeout = self.config.liveness_timeout.as_millis() as i64;
        for peer in self.registry.stale_peers(now, timeout) {
            warn!(%peer, "Missed heartbeats, closing session");
            if let Some(session) = self.registry.get_mut(&peer) {
                session.apply(SessionTrigger::Teardown);
            }
            self.close_session(&peer, "heartbeat timeout");
        }
        for peer in self.registry.heartbeat(now) {
            self.registry.send(&peer, &PeerMessage::Ping { timestamp: now });
        }
    }

    async fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Frame { peer, msg } => self.on_frame(peer, msg),
            Internal::SessionClosed { peer } => {
                self.close_session(&peer, "transport closed");
            }
            Internal::SyncDue { peer } => {
                if self.registry.is_open(&peer) && self.engine.whitelist().contains(&peer) {
                    let request_id = Uuid::new_v4();
                    self.pending_syncs.insert(request_id);
                    self.registry.send(
                        &peer,
                        &PeerMessage::BlockchainSyncRequest {
                            from_index: self.engine.height(),
                            request_id,
                        },
                    );
                }
            }
            Internal::UploadDone => self.transfers.end_upload(),
        }
    }

    fn on_frame(&mut self, peer: NodeId, msg: PeerMessage) {
        match msg {
            PeerMessage::Ping { timestamp } => {
                self.registry.send(&peer, &PeerMessage::Pong { timestamp });
            }
            PeerMessage::Pong { .. } => {
                if let Some(session) = self.registry.get_mut(&peer) {
                    session.record_pong(now_ms());
                }
            }
            PeerMessage::FileOffer { file_id, name, size, mime_type, sha256_hash } => {
                let offer = FileOffer {
                    id: file_id,
                    name,
                    size,
                    mime_type,
                    sha256_hash,
                    advertiser: peer,
                    seen_at: now_ms(),
                };
                if self.offers.record(offer.clone()) == OfferOutcome::New {
                    self.emit(NodeEvent::FileAvailable { offer });
                }
            }
            PeerMessage::FileUnavailable { file_id } => {
                let withdrawn = self
                    .offers
                    .get(&file_id)
                    .map(|o| o.advertiser == peer)
                    .unwrap_or(false);
                if withdrawn {
                    self.offers.remove(&file_id);
                    self.emit(NodeEvent::FileUnavailable { file_id });
                }
            }
            PeerMessage::FileRequest { file_id, .. } => self.serve_file(peer, file_id),
            PeerMessage::FileMetadata { file_id, total_chunks, chunk_size, .. } => {
                let outcome = self.transfers.on_metadata(&file_id, total_chunks, chunk_size);
                self.apply_chunk_outcome(file_id, outcome);
            }
            PeerMessage::FileChunk { file_id, chunk_index, chunk_data_b64, .. } => {
                match BASE64.decode(chunk_data_b64.as_bytes()) {
                    Ok(bytes) => {
                        let outcome = self.transfers.on_chunk(&file_id, chunk_index, bytes);
                        self.apply_chunk_outcome(file_id, outcome);
                    }
                    Err(_) => {
                        warn!(%file_id, chunk_index, "Undecodable chunk payload");
                        if self.transfers.cancel(&file_id) {
                            self.emit(NodeEvent::DownloadFailed {
                                file_id,
                                reason: DownloadFailure::IntegrityFailure,
                            });
                        }
                    }
                }
            }
            PeerMessage::FileError { file_id, reason } => {
                if self.transfers.cancel(&file_id) {
                    self.emit(NodeEvent::DownloadFailed {
                        file_id,
                        reason: DownloadFailure::Refused(reason),
                    });
                }
            }
            PeerMessage::Transaction { transaction } => {
                let id = transaction.id;
                let from = transaction.from.clone();
                match self.engine.on_remote_transaction(transaction, &self.keys) {
                    Ok(true) => self.emit(NodeEvent::TransactionReceived { id, from }),
                    Ok(false) => {}
                    Err(e) => warn!(%peer, error = %e, "Dropping invalid transaction"),
                }
            }
            PeerMessage::BlockProposal { block } => {
                match self.engine.on_proposal(&peer, block, &self.keys) {
                    ProposalOutcome::Vote { block_hash, approve } => {
                        self.registry.broadcast(
                            &PeerMessage::BlockVote {
                                block_hash,
                                voter: self.local_id().clone(),
                                approve,
                                timestamp: now_ms(),
                            },
                            None,
                        );
                        if approve {
                            self.vote_deadline = Some(Instant::now() + self.config.vote_window);
                        }
                    }
                    ProposalOutcome::NotFromLeader => {}
                }
            }
            PeerMessage::BlockVote { block_hash, voter, approve, .. } => {
                self.engine.on_vote(voter, block_hash, approve);
            }
            PeerMessage::NewBlock { block } => {
                match self.engine.on_new_block(block, &self.keys) {
                    Ok(NewBlockOutcome::Committed(block)) => {
                        self.vote_deadline = None;
                        self.emit(NodeEvent::BlockAdded { block });
                        self.recompute_leader();
                    }
                    Ok(NewBlockOutcome::AlreadyKnown) => {}
                    Err(e) => warn!(%peer, error = %e, "Rejecting announced block"),
                }
            }
            PeerMessage::BlockchainSyncRequest { from_index, request_id } => {
                let (blocks, total_blocks) = self.engine.sync_response(from_index);
                self.registry.send(
                    &peer,
                    &PeerMessage::BlockchainSyncResponse { request_id, blocks, total_blocks },
                );
            }
            PeerMessage::BlockchainSyncResponse { request_id, blocks, .. } => {
                if !self.pending_syncs.remove(&request_id) {
                    debug!(%peer, %request_id, "Unsolicited sync response");
                    return;
                }
                let (applied, error) = self.engine.apply_sync(blocks, &self.keys);
                let caught_up = !applied.is_empty();
                for block in applied {
                    self.emit(NodeEvent::BlockAdded { block });
                }
                if let Some(e) = error {
                    warn!(%peer, error = %e, "Sync batch aborted");
                }
                if caught_up {
                    self.recompute_leader();
                }
            }
            PeerMessage::LeaderAnnouncement { leader, block_height, .. } => {
                if self.engine.on_leader_announcement(&peer, leader, block_height) {
                    if self.engine.is_leader() {
                        if self.next_production.is_none() {
                            self.next_production =
                                Some(Instant::now() + self.config.production_interval);
                        }
                    } else {
                        self.next_production = None;
                    }
                    self.emit(NodeEvent::LeaderChanged {
                        leader: self.engine.current_leader().cloned(),
                    });
                }
            }
        }
    }

    fn apply_chunk_outcome(&mut self, file_id: Uuid, outcome: ChunkOutcome) {
        match outcome {
            ChunkOutcome::Ignored => {}
            ChunkOutcome::Progress { received, total } => {
                self.emit(NodeEvent::DownloadProgress { file_id, received, total });
            }
            ChunkOutcome::Completed { name, bytes, total_chunks } => {
                self.emit(NodeEvent::DownloadProgress {
                    file_id,
                    received: total_chunks,
                    total: total_chunks,
                });
                info!(%file_id, %name, size = bytes.len(), "Download completed");
                self.emit(NodeEvent::DownloadCompleted { file_id, name, bytes });
            }
            ChunkOutcome::IntegrityFailure => {
                self.emit(NodeEvent::DownloadFailed {
                    file_id,
                    reason: DownloadFailure::IntegrityFailure,
                });
            }
        }
    }

    /// Answer a file request with a metadata frame and a paced chunk
    /// stream on a dedicated task.
    fn serve_file(&mut self, peer: NodeId, file_id: Uuid) {
        let Some(entry) = self.shared.get(&file_id).cloned() else {
            self.registry.send(
                &peer,
                &PeerMessage::FileError { file_id, reason: "file is not shared".into() },
            );
            return;
        };
        if self.transfers.begin_upload().is_err() {
            warn!(%peer, %file_id, "Upload slots exhausted, refusing request");
            self.registry.send(
                &peer,
                &PeerMessage::FileError { file_id, reason: "too many uploads".into() },
            );
            return;
        }
        let Some(sender) = self.registry.get(&peer).and_then(|s| s.raw_sender()) else {
            self.transfers.end_upload();
            return;
        };
        self.shared.record_download(&file_id);

        let metadata = PeerMessage::FileMetadata {
            file_id,
            name: entry.name.clone(),
            size: entry.size,
            mime_type: entry.mime_type.clone(),
            total_chunks: chunk_count(entry.size, self.config.chunk_size),
            chunk_size: self.config.chunk_size as u32,
        };
        let content = entry.content.clone();
        let chunk_size = self.config.chunk_size;
        let internal = self.internal_tx.clone();
        self.tasks.spawn(async move {
            stream_chunks(sender, metadata, content, chunk_size, file_id).await;
            let _ = internal.send(Internal::UploadDone);
        });
    }

    fn recompute_leader(&mut self) {
        let update = self.engine.recompute_leader(now_ms());
        if update.gained {
            self.next_production = Some(Instant::now() + self.config.production_interval);
            self.registry.broadcast(
                &PeerMessage::LeaderAnnouncement {
                    leader: self.local_id().clone(),
                    block_height: self.engine.height(),
                    timestamp: now_ms(),
                },
                None,
            );
        }
        if update.lost {
            self.next_production = None;
        }
        if update.changed {
            self.emit(NodeEvent::LeaderChanged { leader: update.leader });
        }
    }

    fn on_production(&mut self) {
        self.next_production = Some(Instant::now() + self.config.production_interval);
        if let Some(block) = self.engine.production_tick(&self.keypair) {
            self.registry
                .broadcast(&PeerMessage::BlockProposal { block }, None);
            self.vote_deadline = Some(Instant::now() + self.config.vote_window);
        }
    }

    fn on_vote_window(&mut self) {
        self.vote_deadline = None;
        match self.engine.finalize(&self.keys) {
            FinalizeOutcome::Committed(block) => {
                self.emit(NodeEvent::BlockAdded { block: block.clone() });
                self.registry.broadcast(&PeerMessage::NewBlock { block }, None);
                self.recompute_leader();
            }
            FinalizeOutcome::Dropped { approvals, required, .. } => {
                warn!(approvals, required, "Proposal dropped without quorum");
            }
            FinalizeOutcome::Abandoned { .. } | FinalizeOutcome::NoPending => {}
        }
    }

    fn shutdown(&mut self) {
        info!("Node shutting down");
        self.rdv.stop();
        self.tasks.abort_all();
        self.registry.close_all();
        self.vote_deadline = None;
        self.next_production = None;
    }
}

fn offer_message(entry: &FileEntry) -> PeerMessage {
    PeerMessage::FileOffer {
        file_id: entry.id,
        name: entry.name.clone(),
        size: entry.size,
        mime_type: entry.mime_type.clone(),
        sha256_hash: entry.sha256_hash.clone(),
    }
}

async fn stream_chunks(
    sender: mpsc::UnboundedSender<String>,
    metadata: PeerMessage,
    content: Arc<Vec<u8>>,
    chunk_size: usize,
    file_id: Uuid,
) {
    let Ok(frame) = metadata.encode() else { return };
    if sender.send(frame).is_err() {
        return;
    }
    let mut sent = 0u32;
    for (chunk_index, chunk, is_last) in chunks(&content, chunk_size) {
        let msg = PeerMessage::FileChunk {
            file_id,
            chunk_index,
            chunk_data_b64: BASE64.encode(chunk),
            is_last,
        };
        let Ok(frame) = msg.encode() else { return };
        if sender.send(frame).is_err() {
            return;
        }
        sent += 1;
        // Yield periodically to relieve backpressure on the channel.
        if sent % 10 == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

//! In-process rendezvous service
//!
//! Implements the server side of the rendezvous protocol for nodes
//! living in one process: registration, peer presence broadcasts, and
//! relay of directed session-setup blobs. Tests and local multi-node
//! fabrics connect to it through `LocalRendezvous::dialer()`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::link::{RendezvousError, SignalDialer, SignalLink};
use super::protocol::SignalMessage;
use crate::crypto::NodeId;
use crate::util::now_ms;

enum HubMsg {
    Attach {
        conn: u64,
        to_client: mpsc::UnboundedSender<SignalMessage>,
    },
    Frame {
        conn: u64,
        msg: SignalMessage,
    },
    Detach {
        conn: u64,
    },
}

/// Handle to a running in-process rendezvous service.
pub struct LocalRendezvous {
    cmd_tx: mpsc::UnboundedSender<HubMsg>,
    counter: Arc<AtomicU64>,
}

impl LocalRendezvous {
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(hub_task(cmd_rx));
        Self {
            cmd_tx,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A dialer that connects to this hub.
    pub fn dialer(&self) -> Arc<LocalSignalDialer> {
        Arc::new(LocalSignalDialer {
            cmd_tx: self.cmd_tx.clone(),
            counter: self.counter.clone(),
        })
    }
}

impl Default for LocalRendezvous {
    fn default() -> Self {
        Self::new()
    }
}

/// Dials the in-process hub.
pub struct LocalSignalDialer {
    cmd_tx: mpsc::UnboundedSender<HubMsg>,
    counter: Arc<AtomicU64>,
}

#[async_trait]
impl SignalDialer for LocalSignalDialer {
    async fn open(&self) -> Result<SignalLink, RendezvousError> {
        let conn = self.counter.fetch_add(1, Ordering::Relaxed);
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (from_client_tx, mut from_client_rx) = mpsc::unbounded_channel();

        self.cmd_tx
            .send(HubMsg::Attach { conn, to_client: to_client_tx })
            .map_err(|_| RendezvousError::Unavailable("hub stopped".into()))?;

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = from_client_rx.recv().await {
                if cmd_tx.send(HubMsg::Frame { conn, msg }).is_err() {
                    return;
                }
            }
            let _ = cmd_tx.send(HubMsg::Detach { conn });
        });

        Ok(SignalLink { tx: from_client_tx, rx: to_client_rx })
    }
}

struct HubState {
    conns: HashMap<u64, mpsc::UnboundedSender<SignalMessage>>,
    registered: HashMap<NodeId, u64>,
    by_conn: HashMap<u64, NodeId>,
}

impl HubState {
    fn send_to(&self, conn: u64, msg: SignalMessage) {
        if let Some(tx) = self.conns.get(&conn) {
            let _ = tx.send(msg);
        }
    }

    fn broadcast_except(&self, except: u64, msg: &SignalMessage) {
        for (conn, tx) in &self.conns {
            if *conn != except {
                let _ = tx.send(msg.clone());
            }
        }
    }

    fn peers_except(&self, node: &NodeId) -> Vec<NodeId> {
        self.registered.keys().filter(|n| *n != node).cloned().collect()
    }

    fn detach(&mut self, conn: u64) {
        self.conns.remove(&conn);
        if let Some(node) = self.by_conn.remove(&conn) {
            self.registered.remove(&node);
            let msg = SignalMessage::PeerLeft { node_id: node, timestamp: now_ms() };
            self.broadcast_except(conn, &msg);
        }
    }
}

async fn hub_task(mut cmd_rx: mpsc::UnboundedReceiver<HubMsg>) {
    let mut state = HubState {
        conns: HashMap::new(),
        registered: HashMap::new(),
        by_conn: HashMap::new(),
    };

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            HubMsg::Attach { conn, to_client } => {
                state.conns.insert(conn, to_client);
            }
            HubMsg::Detach { conn } => state.detach(conn),
            HubMsg::Frame { conn, msg } => handle_frame(&mut state, conn, msg),
        }
    }
}

fn handle_frame(state: &mut HubState, conn: u64, msg: SignalMessage) {
    match msg {
        SignalMessage::Register { node_id } => {
            debug!(%node_id, conn, "Rendezvous registration");
            // A reconnecting node displaces its stale registration.
            if let Some(old) = state.registered.insert(node_id.clone(), conn) {
                state.by_conn.remove(&old);
            }
            state.by_conn.insert(conn, node_id.clone());

            state.send_to(conn, SignalMessage::PeerList { peers: state.peers_except(&node_id) });
            let joined = SignalMessage::PeerJoined { node_id, timestamp: now_ms() };
            state.broadcast_except(conn, &joined);
        }
        SignalMessage::GetPeers { node_id } => {
            state.send_to(conn, SignalMessage::PeerList { peers: state.peers_except(&node_id) });
        }
        SignalMessage::Ping => {
            state.send_to(conn, SignalMessage::Pong { timestamp: now_ms() });
        }
        SignalMessage::Offer { ref to, .. }
        | SignalMessage::Answer { ref to, .. }
        | SignalMessage::IceCandidate { ref to, .. } => match state.registered.get(to) {
            Some(dest) => state.send_to(*dest, msg.clone()),
            None => {
                warn!(%to, "Relay target not registered");
                state.send_to(
                    conn,
                    SignalMessage::Error {
                        message: format!("peer {to} not registered"),
                        original_message: Some("signal relay".into()),
                    },
                );
            }
        },
        other => {
            state.send_to(
                conn,
                SignalMessage::Error {
                    message: "unexpected client frame".into(),
                    original_message: Some(format!("{other:?}")),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn registered_link(hub: &LocalRendezvous, id: &str) -> SignalLink {
        let mut link = hub.dialer().open().await.unwrap();
        link.tx
            .send(SignalMessage::Register { node_id: NodeId::new(id) })
            .unwrap();
        // Consume the initial peer list.
        match link.rx.recv().await.unwrap() {
            SignalMessage::PeerList { .. } => link,
            other => panic!("expected peer list, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_gets_peer_list_and_joins_broadcast() {
        let hub = LocalRendezvous::new();
        let mut a = registered_link(&hub, "aaaa").await;

        let mut b = hub.dialer().open().await.unwrap();
        b.tx.send(SignalMessage::Register { node_id: NodeId::new("bbbb") })
            .unwrap();

        match b.rx.recv().await.unwrap() {
            SignalMessage::PeerList { peers } => assert_eq!(peers, vec![NodeId::new("aaaa")]),
            other => panic!("expected peer list, got {other:?}"),
        }
        match a.rx.recv().await.unwrap() {
            SignalMessage::PeerJoined { node_id, .. } => assert_eq!(node_id, NodeId::new("bbbb")),
            other => panic!("expected peer joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offer_is_relayed_to_target() {
        let hub = LocalRendezvous::new();
        let a = registered_link(&hub, "aaaa").await;
        let mut b = registered_link(&hub, "bbbb").await;

        a.tx.send(SignalMessage::Offer {
            from: NodeId::new("aaaa"),
            to: NodeId::new("bbbb"),
            signal: json!({ "session": "t1" }),
        })
        .unwrap();

        match b.rx.recv().await.unwrap() {
            SignalMessage::Offer { from, signal, .. } => {
                assert_eq!(from, NodeId::new("aaaa"));
                assert_eq!(signal["session"], "t1");
            }
            other => panic!("expected offer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_relay_to_unknown_peer_errors_back() {
        let hub = LocalRendezvous::new();
        let mut a = registered_link(&hub, "aaaa").await;

        a.tx.send(SignalMessage::Offer {
            from: NodeId::new("aaaa"),
            to: NodeId::new("nope"),
            signal: json!({}),
        })
        .unwrap();

        assert!(matches!(a.rx.recv().await.unwrap(), SignalMessage::Error { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_broadcasts_peer_left() {
        let hub = LocalRendezvous::new();
        let mut a = registered_link(&hub, "aaaa").await;
        let b = registered_link(&hub, "bbbb").await;

        drop(b);
        match a.rx.recv().await.unwrap() {
            SignalMessage::PeerLeft { node_id, .. } => assert_eq!(node_id, NodeId::new("bbbb")),
            other => panic!("expected peer left, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let hub = LocalRendezvous::new();
        let mut a = registered_link(&hub, "aaaa").await;
        a.tx.send(SignalMessage::Ping).unwrap();
        assert!(matches!(a.rx.recv().await.unwrap(), SignalMessage::Pong { .. }));
    }
}

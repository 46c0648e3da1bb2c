//! Peer Registry Module
//!
//! Owns every peer session, enforces the one-session-per-peer rule and
//! the dial dedupe/tie-break policy, and performs unicast and broadcast
//! sends.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::protocol::PeerMessage;
use super::session::{PeerSession, SessionState};
use crate::crypto::NodeId;

pub struct PeerRegistry {
    local_id: NodeId,
    sessions: HashMap<NodeId, PeerSession>,
    /// Remote ends of dials currently in flight.
    dials_in_flight: HashSet<NodeId>,
}

impl PeerRegistry {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            sessions: HashMap::new(),
            dials_in_flight: HashSet::new(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Reserve a dial slot for `remote`. Returns false when a session
    /// already exists or a dial is already in flight.
    pub fn begin_dial(&mut self, remote: &NodeId) -> bool {
        if *remote == self.local_id {
            return false;
        }
        if let Some(session) = self.sessions.get(remote) {
            if session.state() != SessionState::Closed {
                return false;
            }
        }
        if !self.dials_in_flight.insert(remote.clone()) {
            return false;
        }
        self.sessions
            .insert(remote.clone(), PeerSession::connecting(remote.clone(), true));
        true
    }

    /// Clear the in-flight marker after success or transport error.
    pub fn finish_dial(&mut self, remote: &NodeId) {
        self.dials_in_flight.remove(remote);
    }

    pub fn dialing(&self, remote: &NodeId) -> bool {
        self.dials_in_flight.contains(remote)
    }

    /// Mutual-dial tie-break: the lexicographically larger id is the
    /// initiator. True when a remote offer from `remote` should win
    /// over our own in-flight dial.
    pub fn offer_wins_tie(&self, remote: &NodeId) -> bool {
        *remote > self.local_id
    }

    /// Insert a session answering a remote offer.
    pub fn insert_answering(&mut self, remote: &NodeId) -> &mut PeerSession {
        self.sessions
            .insert(remote.clone(), PeerSession::connecting(remote.clone(), false));
        self.sessions
            .get_mut(remote)
            .expect("session just inserted")
    }

    pub fn get(&self, peer: &NodeId) -> Option<&PeerSession> {
        self.sessions.get(peer)
    }

    pub fn get_mut(&mut self, peer: &NodeId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(peer)
    }

    pub fn is_open(&self, peer: &NodeId) -> bool {
        self.sessions
            .get(peer)
            .map(|s| s.state().is_open())
            .unwrap_or(false)
    }

    /// Remove and close a session, returning whether it was open.
    pub fn remove(&mut self, peer: &NodeId) -> Option<PeerSession> {
        self.dials_in_flight.remove(peer);
        let mut session = self.sessions.remove(peer)?;
        session.close();
        Some(session)
    }

    /// Unicast. False when the peer has no open session.
    pub fn send(&self, peer: &NodeId, msg: &PeerMessage) -> bool {
        match self.sessions.get(peer) {
            Some(session) => session.send(msg),
            None => {
                debug!(%peer, "Dropping send to unknown peer");
                false
            }
        }
    }

    /// Send to every open session except `exclude`. Returns the number
    /// of peers the frame was handed to.
    pub fn broadcast(&self, msg: &PeerMessage, exclude: Option<&NodeId>) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state().is_open())
            .filter(|s| Some(s.peer_id()) != exclude)
            .filter(|s| s.send(msg))
            .count()
    }

    /// Peers with open sessions.
    pub fn connected_peers(&self) -> HashSet<NodeId> {
        self.sessions
            .values()
            .filter(|s| s.state().is_open())
            .map(|s| s.peer_id().clone())
            .collect()
    }

    /// Open sessions whose pong is overdue.
    pub fn stale_peers(&self, now_ms: i64, timeout_ms: i64) -> Vec<NodeId> {
        self.sessions
            .values()
            .filter(|s| s.is_stale(now_ms, timeout_ms))
            .map(|s| s.peer_id().clone())
            .collect()
    }

    /// Peers to ping this heartbeat, with bookkeeping updated.
    pub fn heartbeat(&mut self, now_ms: i64) -> Vec<NodeId> {
        let mut peers = Vec::new();
        for session in self.sessions.values_mut() {
            if session.state().is_open() {
                session.record_ping(now_ms);
                peers.push(session.peer_id().clone());
            }
        }
        peers
    }

    /// Close every session (no farewell frames).
    pub fn close_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.close();
        }
        self.dials_in_flight.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn id(n: u8) -> NodeId {
        NodeId::new(format!("{n:016x}"))
    }

    fn open_session(registry: &mut PeerRegistry, peer: &NodeId) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.begin_dial(peer);
        let reader = tokio::spawn(async {});
        registry
            .get_mut(peer)
            .unwrap()
            .establish(tx, reader, 1_000);
        registry.finish_dial(peer);
        rx
    }

    #[test]
    fn test_dial_dedupe() {
        let mut registry = PeerRegistry::new(id(1));
        assert!(registry.begin_dial(&id(2)));
        assert!(!registry.begin_dial(&id(2)));
        registry.finish_dial(&id(2));
        // Session record still exists in Connecting; still deduped.
        assert!(!registry.begin_dial(&id(2)));
    }

    #[test]
    fn test_never_dial_self() {
        let mut registry = PeerRegistry::new(id(1));
        assert!(!registry.begin_dial(&id(1)));
    }

    #[test]
    fn test_tie_break_prefers_larger_id() {
        let registry = PeerRegistry::new(id(5));
        assert!(registry.offer_wins_tie(&id(9)));
        assert!(!registry.offer_wins_tie(&id(2)));
    }

    #[tokio::test]
    async fn test_send_and_broadcast() {
        let mut registry = PeerRegistry::new(id(1));
        let mut rx2 = open_session(&mut registry, &id(2));
        let mut rx3 = open_session(&mut registry, &id(3));

        assert!(registry.send(&id(2), &PeerMessage::Ping { timestamp: 1 }));
        assert!(!registry.send(&id(9), &PeerMessage::Ping { timestamp: 1 }));

        let sent = registry.broadcast(&PeerMessage::Ping { timestamp: 2 }, Some(&id(3)));
        assert_eq!(sent, 1);

        assert!(rx2.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
        // Excluded peer saw nothing.
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connected_peers_counts_open_only() {
        let mut registry = PeerRegistry::new(id(1));
        let _rx = open_session(&mut registry, &id(2));
        registry.begin_dial(&id(3)); // Connecting, not open

        let connected = registry.connected_peers();
        assert!(connected.contains(&id(2)));
        assert!(!connected.contains(&id(3)));
    }

    #[tokio::test]
    async fn test_remove_closes_session() {
        let mut registry = PeerRegistry::new(id(1));
        let _rx = open_session(&mut registry, &id(2));
        let removed = registry.remove(&id(2)).unwrap();
        assert_eq!(removed.state(), SessionState::Closed);
        assert!(!registry.is_open(&id(2)));
    }

    #[tokio::test]
    async fn test_heartbeat_targets_open_sessions() {
        let mut registry = PeerRegistry::new(id(1));
        let _rx = open_session(&mut registry, &id(2));
        registry.begin_dial(&id(3));

        let targets = registry.heartbeat(5_000);
        assert_eq!(targets, vec![id(2)]);
        assert_eq!(registry.get(&id(2)).unwrap().last_ping_sent, 5_000);
    }
}

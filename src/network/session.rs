//! Peer Session Module
//!
//! One session per remote node. A session owns the framed channel for
//! that peer, tracks the connection state machine, and keeps the
//! heartbeat bookkeeping used for half-open detection.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::protocol::PeerMessage;
use crate::crypto::NodeId;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Dial or answer in progress; no channel yet.
    Connecting,
    /// Channel established; frames flow.
    Open,
    /// Teardown requested or transport error seen.
    Closing,
    /// Channel gone.
    Closed,
}

/// What moved the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTrigger {
    /// Transport reports the channel established.
    Established,
    /// Local teardown requested, or a transport error surfaced.
    Teardown,
    /// Transport reports the channel closed.
    TransportClosed,
    /// Unrecoverable transport failure.
    TransportFailed,
}

impl SessionState {
    pub fn is_open(&self) -> bool {
        matches!(self, SessionState::Open)
    }

    /// Next state for a trigger; illegal combinations stay put except
    /// for failures, which always close.
    pub fn next(self, trigger: SessionTrigger) -> SessionState {
        use SessionState::*;
        use SessionTrigger::*;
        match (self, trigger) {
            (_, TransportFailed) => Closed,
            (Connecting, Established) => Open,
            (Connecting, Teardown) => Closing,
            (Open, Teardown) => Closing,
            (Closing, TransportClosed) => Closed,
            (Open, TransportClosed) => Closed,
            (Connecting, TransportClosed) => Closed,
            (state, _) => state,
        }
    }
}

/// Live state for one peer connection.
pub struct PeerSession {
    peer_id: NodeId,
    state: SessionState,
    /// True when the local node won the dial (or tie-break).
    initiator: bool,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader: Option<JoinHandle<()>>,
    pub last_ping_sent: i64,
    pub last_pong_received: i64,
}

impl PeerSession {
    /// A session staged by a local dial or an accepted offer.
    pub fn connecting(peer_id: NodeId, initiator: bool) -> Self {
        Self {
            peer_id,
            state: SessionState::Connecting,
            initiator,
            outbound: None,
            reader: None,
            last_ping_sent: 0,
            last_pong_received: 0,
        }
    }

    pub fn peer_id(&self) -> &NodeId {
        &self.peer_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn initiator(&self) -> bool {
        self.initiator
    }

    /// Attach the established channel and move to `Open`.
    pub fn establish(
        &mut self,
        outbound: mpsc::UnboundedSender<String>,
        reader: JoinHandle<()>,
        now_ms: i64,
    ) {
        self.outbound = Some(outbound);
        self.reader = Some(reader);
        self.state = self.state.next(SessionTrigger::Established);
        self.last_pong_received = now_ms;
    }

    pub fn apply(&mut self, trigger: SessionTrigger) {
        let next = self.state.next(trigger);
        if next != self.state {
            debug!(peer = %self.peer_id, from = ?self.state, to = ?next, ?trigger, "Session transition");
            self.state = next;
        }
    }

    /// Send a frame. Returns false when the session is not open or the
    /// channel is gone; such frames are silently dropped.
    pub fn send(&self, msg: &PeerMessage) -> bool {
        if !self.state.is_open() {
            return false;
        }
        let Ok(frame) = msg.encode() else {
            return false;
        };
        match &self.outbound {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Clone of the raw outbound sender, for upload tasks that stream
    /// chunks without going through the registry.
    pub fn raw_sender(&self) -> Option<mpsc::UnboundedSender<String>> {
        if !self.state.is_open() {
            return None;
        }
        self.outbound.clone()
    }

    pub fn record_ping(&mut self, now_ms: i64) {
        self.last_ping_sent = now_ms;
    }

    pub fn record_pong(&mut self, now_ms: i64) {
        self.last_pong_received = now_ms;
    }

    /// True when no pong has been seen for `timeout_ms` on an open
    /// session (three missed heartbeats).
    pub fn is_stale(&self, now_ms: i64, timeout_ms: i64) -> bool {
        self.state.is_open() && now_ms.saturating_sub(self.last_pong_received) > timeout_ms
    }

    /// Drop the channel and abort the reader task.
    pub fn close(&mut self) {
        self.outbound = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.state = SessionState::Closed;
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_table() {
        use SessionState::*;
        use SessionTrigger::*;

        assert_eq!(Connecting.next(Established), Open);
        assert_eq!(Open.next(Teardown), Closing);
        assert_eq!(Closing.next(TransportClosed), Closed);
        assert_eq!(Open.next(TransportFailed), Closed);
        assert_eq!(Connecting.next(TransportFailed), Closed);
        // Established after open is a no-op.
        assert_eq!(Open.next(Established), Open);
        assert_eq!(Closed.next(Established), Closed);
    }

    #[test]
    fn test_send_before_open_is_dropped() {
        let session = PeerSession::connecting(NodeId::new("aaaaaaaaaaaaaaaa"), true);
        assert!(!session.send(&PeerMessage::Ping { timestamp: 1 }));
    }

    #[tokio::test]
    async fn test_send_after_establish() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async {});
        let mut session = PeerSession::connecting(NodeId::new("aaaaaaaaaaaaaaaa"), false);
        session.establish(tx, reader, 1_000);

        assert!(session.state().is_open());
        assert!(session.send(&PeerMessage::Ping { timestamp: 7 }));
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("\"type\":\"ping\""));
    }

    #[tokio::test]
    async fn test_send_after_close_is_dropped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async {});
        let mut session = PeerSession::connecting(NodeId::new("aaaaaaaaaaaaaaaa"), false);
        session.establish(tx, reader, 1_000);
        session.close();

        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.send(&PeerMessage::Ping { timestamp: 7 }));
    }

    #[test]
    fn test_staleness_threshold() {
        let mut session = PeerSession::connecting(NodeId::new("aaaaaaaaaaaaaaaa"), true);
        // Not open yet: never stale.
        assert!(!session.is_stale(1_000_000, 90_000));

        session.state = SessionState::Open;
        session.last_pong_received = 1_000_000;
        assert!(!session.is_stale(1_090_000, 90_000));
        assert!(session.is_stale(1_090_001, 90_000));
    }
}

//! Rendezvous Client Module
//!
//! Registers the node with the rendezvous service and shuttles signal
//! frames between the service and the node driver. Failure to open the
//! channel at startup is fatal; a channel lost later is re-dialed with
//! a doubling delay starting at the configured reconnect interval.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::link::{RendezvousError, SignalDialer, SignalLink};
use super::protocol::SignalMessage;
use crate::crypto::NodeId;

/// Cap for the reconnect backoff.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// A running rendezvous client.
pub struct RendezvousClient {
    out_tx: mpsc::UnboundedSender<SignalMessage>,
    task: JoinHandle<()>,
}

impl RendezvousClient {
    /// Open the channel (bounded by `connect_timeout`), register, and
    /// start the relay task. Inbound frames are forwarded to `inbound`.
    pub async fn start(
        dialer: Arc<dyn SignalDialer>,
        node_id: NodeId,
        connect_timeout: Duration,
        reconnect_delay: Duration,
        inbound: mpsc::UnboundedSender<SignalMessage>,
    ) -> Result<Self, RendezvousError> {
        let link = tokio::time::timeout(connect_timeout, dialer.open())
            .await
            .map_err(|_| RendezvousError::Timeout)??;
        link.tx
            .send(SignalMessage::Register { node_id: node_id.clone() })
            .map_err(|_| RendezvousError::Closed)?;
        info!(%node_id, "Registered with rendezvous service");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(relay(dialer, node_id, reconnect_delay, link, out_rx, inbound));
        Ok(Self { out_tx, task })
    }

    /// Queue a frame for the service. False once the client stopped.
    pub fn send(&self, msg: SignalMessage) -> bool {
        self.out_tx.send(msg).is_ok()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for RendezvousClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn relay(
    dialer: Arc<dyn SignalDialer>,
    node_id: NodeId,
    initial_delay: Duration,
    mut link: SignalLink,
    mut out_rx: mpsc::UnboundedReceiver<SignalMessage>,
    inbound: mpsc::UnboundedSender<SignalMessage>,
) {
    loop {
        tokio::select! {
            out = out_rx.recv() => match out {
                Some(msg) => {
                    if link.tx.send(msg).is_err() {
                        link = reconnect(&dialer, &node_id, initial_delay).await;
                    }
                }
                // Node driver gone.
                None => return,
            },
            frame = link.rx.recv() => match frame {
                Some(msg) => {
                    if inbound.send(msg).is_err() {
                        return;
                    }
                }
                None => {
                    warn!("Rendezvous channel lost, reconnecting");
                    link = reconnect(&dialer, &node_id, initial_delay).await;
                }
            },
        }
    }
}

/// Re-dial until a channel opens, doubling the delay up to the cap.
async fn reconnect(
    dialer: &Arc<dyn SignalDialer>,
    node_id: &NodeId,
    initial_delay: Duration,
) -> SignalLink {
    let mut delay = initial_delay;
    loop {
        tokio::time::sleep(delay).await;
        match dialer.open().await {
            Ok(link) => {
                if link
                    .tx
                    .send(SignalMessage::Register { node_id: node_id.clone() })
                    .is_ok()
                {
                    info!(%node_id, "Rendezvous channel re-established");
                    return link;
                }
            }
            Err(e) => warn!(error = %e, "Rendezvous reconnect failed"),
        }
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::hub::LocalRendezvous;

    #[tokio::test]
    async fn test_start_registers_and_forwards() {
        let hub = LocalRendezvous::new();
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();

        let _client = RendezvousClient::start(
            hub.dialer(),
            NodeId::new("aaaaaaaaaaaaaaaa"),
            Duration::from_secs(10),
            Duration::from_secs(5),
            in_tx,
        )
        .await
        .unwrap();

        // The hub answers registration with the (empty) peer list.
        match in_rx.recv().await.unwrap() {
            SignalMessage::PeerList { peers } => assert!(peers.is_empty()),
            other => panic!("expected peer list, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_service_is_fatal() {
        struct NeverDialer;
        #[async_trait::async_trait]
        impl SignalDialer for NeverDialer {
            async fn open(&self) -> Result<SignalLink, RendezvousError> {
                Err(RendezvousError::Unavailable("refused".into()))
            }
        }

        let (in_tx, _in_rx) = mpsc::unbounded_channel();
        let result = RendezvousClient::start(
            Arc::new(NeverDialer),
            NodeId::new("aaaaaaaaaaaaaaaa"),
            Duration::from_secs(1),
            Duration::from_secs(5),
            in_tx,
        )
        .await;
        assert!(matches!(result, Err(RendezvousError::Unavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout_is_fatal() {
        struct HangingDialer;
        #[async_trait::async_trait]
        impl SignalDialer for HangingDialer {
            async fn open(&self) -> Result<SignalLink, RendezvousError> {
                std::future::pending().await
            }
        }

        let (in_tx, _in_rx) = mpsc::unbounded_channel();
        let result = RendezvousClient::start(
            Arc::new(HangingDialer),
            NodeId::new("aaaaaaaaaaaaaaaa"),
            Duration::from_secs(10),
            Duration::from_secs(5),
            in_tx,
        )
        .await;
        assert!(matches!(result, Err(RendezvousError::Timeout)));
    }
}

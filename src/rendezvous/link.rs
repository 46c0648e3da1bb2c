//! Rendezvous channel plumbing
//!
//! A `SignalLink` is one open channel to the rendezvous service,
//! already framed into typed messages. `SignalDialer` knows how to open
//! one; the TCP implementation speaks newline-delimited JSON.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};

use super::protocol::SignalMessage;

/// Upper bound for one rendezvous frame.
const MAX_LINE_LEN: usize = 256 * 1024;

#[derive(Error, Debug)]
pub enum RendezvousError {
    #[error("Rendezvous unavailable: {0}")]
    Unavailable(String),
    #[error("Rendezvous open timed out")]
    Timeout,
    #[error("Rendezvous channel closed")]
    Closed,
}

/// One framed, bidirectional channel to the rendezvous service.
pub struct SignalLink {
    pub tx: mpsc::UnboundedSender<SignalMessage>,
    pub rx: mpsc::UnboundedReceiver<SignalMessage>,
}

impl SignalLink {
    /// Two directly connected link ends, for in-process services.
    pub fn pair() -> (SignalLink, SignalLink) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            SignalLink { tx: a_tx, rx: b_rx },
            SignalLink { tx: b_tx, rx: a_rx },
        )
    }
}

/// Opens rendezvous channels; reused across reconnects.
#[async_trait]
pub trait SignalDialer: Send + Sync + 'static {
    async fn open(&self) -> Result<SignalLink, RendezvousError>;
}

/// Dials the rendezvous service over TCP, one JSON frame per line.
pub struct TcpSignalDialer {
    addr: String,
}

impl TcpSignalDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl SignalDialer for TcpSignalDialer {
    async fn open(&self) -> Result<SignalLink, RendezvousError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| RendezvousError::Unavailable(e.to_string()))?;
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LEN));
        let (mut sink, mut frames) = framed.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SignalMessage>();

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let Ok(line) = msg.encode() else { continue };
                if sink.send(line).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(item) = frames.next().await {
                match item {
                    Ok(line) => match SignalMessage::decode(&line) {
                        Ok(msg) => {
                            if in_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Dropping malformed rendezvous frame"),
                    },
                    Err(e) => {
                        debug!(error = %e, "Rendezvous stream ended");
                        break;
                    }
                }
            }
        });

        Ok(SignalLink { tx: out_tx, rx: in_rx })
    }
}

//! In-process transport for tests and embedding.
//!
//! Frames travel over unbounded `flume` channels. Dropping one side's sink
//! ends the other side's stream.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tracing::debug;
use url::Url;

use super::{Channel, Connector, Frame, TransportError};

/// Two channels wired to each other.
#[must_use]
pub fn pair() -> (Channel, Channel) {
    let (left_tx, left_rx) = flume::unbounded::<Frame>();
    let (right_tx, right_rx) = flume::unbounded::<Frame>();

    let left = Channel::new(
        left_tx.into_sink().sink_map_err(|_| TransportError::Closed),
        right_rx.into_stream().map(Ok),
    )
    .with_peer("memory:left");
    let right = Channel::new(
        right_tx.into_sink().sink_map_err(|_| TransportError::Closed),
        left_rx.into_stream().map(Ok),
    )
    .with_peer("memory:right");

    (left, right)
}

/// A connector and the listener it dials.
#[must_use]
pub fn listener() -> (MemoryConnector, MemoryListener) {
    let (incoming_tx, incoming_rx) = flume::unbounded();
    (
        MemoryConnector { incoming_tx },
        MemoryListener { incoming_rx },
    )
}

/// Dials a [`MemoryListener`]. Handles the `memory` scheme.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    incoming_tx: flume::Sender<Channel>,
}

#[async_trait]
impl Connector for MemoryConnector {
    fn schemes(&self) -> &[&'static str] {
        &["memory"]
    }

    async fn connect(&self, address: &Url) -> Result<Channel, TransportError> {
        if address.scheme() != "memory" {
            return Err(TransportError::InvalidAddress(address.to_string()));
        }

        let (local, remote) = pair();
        self.incoming_tx
            .send_async(remote)
            .await
            .map_err(|_| TransportError::ConnectionFailed("listener closed".to_string()))?;

        debug!("Memory connection established to {}", address);
        Ok(local)
    }
}

/// Receives channels dialed through the matching [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryListener {
    incoming_rx: flume::Receiver<Channel>,
}

impl MemoryListener {
    /// Wait for the next incoming channel. `None` once every connector is gone.
    pub async fn accept(&self) -> Option<Channel> {
        self.incoming_rx.recv_async().await.ok()
    }
}

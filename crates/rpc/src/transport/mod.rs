//! Frame transport boundary.
//!
//! A [`Connection`](crate::Connection) runs over any [`Channel`]: a sink and a
//! stream of [`Frame`]s. Bindings only have to produce channels, either by
//! dialing out through a [`Connector`] or by handing accepted channels to the
//! server side.

pub mod memory;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, Stream};
use thiserror::Error;
use url::Url;

/// One transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text frame, carrying JSON.
    Text(String),
    /// A binary frame, carrying CBOR or raw data.
    Binary(Bytes),
    /// Ping, pong and other informational frames.
    Control,
    /// The peer is closing the stream.
    Close,
}

/// Errors raised by transport bindings.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not reach the peer.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The address is not usable by this binding.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The stream was already closed.
    #[error("Transport closed")]
    Closed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else reported by the binding.
    #[error("{0}")]
    Other(String),
}

/// Outgoing half of a channel.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

/// Incoming half of a channel. The end of the stream is the end of the connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// An established duplex frame stream.
pub struct Channel {
    /// Frames to the peer.
    pub sink: FrameSink,
    /// Frames from the peer.
    pub stream: FrameStream,
    /// Human readable peer address, if known.
    pub peer: Option<String>,
}

impl Channel {
    /// Wrap a sink and a stream.
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<Frame, Error = TransportError> + Send + 'static,
        R: Stream<Item = Result<Frame, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
            peer: None,
        }
    }

    /// Record the peer address.
    #[must_use]
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Client side of a transport binding.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// URL schemes this binding can dial.
    fn schemes(&self) -> &[&'static str];

    /// Dial `address` and return the established channel.
    async fn connect(&self, address: &Url) -> Result<Channel, TransportError>;
}

/// Pick the first connector that handles the scheme of `address`.
#[must_use]
pub fn find_connector<'a>(
    connectors: &'a [Arc<dyn Connector>],
    address: &Url,
) -> Option<&'a Arc<dyn Connector>> {
    connectors
        .iter()
        .find(|connector| connector.schemes().contains(&address.scheme()))
}

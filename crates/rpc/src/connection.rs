//! One physical frame stream and the two pumps that drive it.

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{ConnectionError, ProtocolError, Result};
use crate::protocol::codec::{self, WireFormat};
use crate::protocol::exception::RemoteException;
use crate::protocol::message::{Message, Response};
use crate::session::Session;
use crate::transport::{Channel, Connector, Frame, FrameSink, FrameStream};

/// Configuration for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Encoding for outbound messages.
    pub outbound_format: WireFormat,
    /// Largest inbound frame accepted.
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_format: WireFormat::Binary,
            max_frame_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet connected.
    Idle,
    /// Dialing the peer.
    Connecting,
    /// Established; ready to run.
    Connected,
    /// `run` has finished; waiting for `close`.
    Closing,
    /// Stream released.
    Closed,
}

impl ConnectionState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// An item queued for the outbound pump.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Encoded with the connection's [`WireFormat`].
    Message(Message),
    /// Already serialized text, sent as a text frame.
    Text(String),
    /// Raw bytes, sent as a binary frame.
    Binary(Bytes),
}

impl From<Message> for Outbound {
    fn from(message: Message) -> Self {
        Self::Message(message)
    }
}

impl From<String> for Outbound {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Bytes> for Outbound {
    fn from(data: Bytes) -> Self {
        Self::Binary(data)
    }
}

/// Cloneable enqueue side of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub(crate) const fn new(id: Uuid, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id, tx }
    }

    /// Id of the connection this handle feeds.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Queue an item. Never waits for the write.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] if the connection is gone.
    pub fn send(&self, item: impl Into<Outbound>) -> Result<()> {
        self.tx
            .send(item.into())
            .map_err(|_| ConnectionError::Closed.into())
    }
}

/// One physical connection bound to a [`Session`].
pub struct Connection {
    id: Uuid,
    session: Arc<Session>,
    config: ConnectionConfig,
    state: ConnectionState,
    peer: Option<String>,
    sink: Option<FrameSink>,
    stream: Option<FrameStream>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
}

impl Connection {
    /// Create an idle connection for `session`.
    #[must_use]
    pub fn new(session: Arc<Session>, config: ConnectionConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            id: Uuid::new_v4(),
            session,
            config,
            state: ConnectionState::Idle,
            peer: None,
            sink: None,
            stream: None,
            outbound_tx,
            outbound_rx,
        }
    }

    /// Connection id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Peer address reported by the transport.
    #[must_use]
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// The session this connection feeds.
    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// A handle for queueing outbound items.
    #[must_use]
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::new(self.id, self.outbound_tx.clone())
    }

    /// Queue an item. Never waits for the write.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] if the queue is gone.
    pub fn send(&self, item: impl Into<Outbound>) -> Result<()> {
        self.outbound_tx
            .send(item.into())
            .map_err(|_| ConnectionError::Closed.into())
    }

    /// Dial `address` and bind the session.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::ConnectFailed`] if the transport cannot reach
    /// the peer; the connection is then closed.
    pub async fn connect(&mut self, connector: &dyn Connector, address: &Url) -> Result<()> {
        self.expect_state(ConnectionState::Idle)?;
        self.state = ConnectionState::Connecting;
        debug!("Connecting to {}", address);

        match connector.connect(address).await {
            Ok(channel) => {
                self.bind(channel);
                Ok(())
            }
            Err(source) => {
                self.state = ConnectionState::Closed;
                Err(ConnectionError::ConnectFailed {
                    address: address.clone(),
                    source,
                }
                .into())
            }
        }
    }

    /// Bind an already accepted channel.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidState`] unless the connection is idle.
    pub fn accept(&mut self, channel: Channel) -> Result<()> {
        self.expect_state(ConnectionState::Idle)?;
        self.bind(channel);
        Ok(())
    }

    /// Run both pumps until the stream ends.
    ///
    /// Returns `Ok(())` when the peer closes the stream. The session is
    /// unbound either way.
    ///
    /// # Errors
    ///
    /// Returns a connection error for transport failures, and a protocol or
    /// codec error for inbound data that breaks the message contract.
    pub async fn run(&mut self) -> Result<()> {
        self.expect_state(ConnectionState::Connected)?;
        let (Some(mut sink), Some(mut stream)) = (self.sink.take(), self.stream.take()) else {
            return Err(ConnectionError::Closed.into());
        };

        let span = info_span!("connection", id = %self.id);
        let result = tokio::select! {
            result = pump_outbound(&mut sink, &mut self.outbound_rx, &self.session, &self.config)
                .instrument(span.clone()) => result,
            result = pump_inbound(&mut stream, &self.session, &self.config)
                .instrument(span) => result,
        };

        self.sink = Some(sink);
        self.state = ConnectionState::Closing;
        self.session.on_disconnect(self.id);

        match &result {
            Ok(()) => info!("Connection {} ended", self.id),
            Err(e) => info!("Connection {} failed: {}", self.id, e),
        }
        result
    }

    /// Release the stream. Safe to call more than once and after a failed `run`.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }

        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.send(Frame::Close).await {
                trace!("Close frame not sent: {}", e);
            }
            if let Err(e) = sink.close().await {
                trace!("Sink close failed: {}", e);
            }
        }
        self.stream = None;

        if self.state == ConnectionState::Connected {
            self.session.on_disconnect(self.id);
        }
        self.state = ConnectionState::Closed;
        debug!("Connection {} closed", self.id);
    }

    fn bind(&mut self, channel: Channel) {
        let Channel { sink, stream, peer } = channel;
        self.sink = Some(sink);
        self.stream = Some(stream);
        self.peer = peer;
        self.state = ConnectionState::Connected;

        info!(
            "Connection {} established with {}",
            self.id,
            self.peer.as_deref().unwrap_or("unknown peer")
        );
        self.session.on_connect(self.handle());
    }

    fn expect_state(&self, expected: ConnectionState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ConnectionError::InvalidState {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            }
            .into())
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Drain the outbound queue into the sink, in order.
async fn pump_outbound(
    sink: &mut FrameSink,
    queue: &mut mpsc::UnboundedReceiver<Outbound>,
    session: &Session,
    config: &ConnectionConfig,
) -> Result<()> {
    while let Some(item) = queue.recv().await {
        let frame = match item {
            Outbound::Text(text) => Frame::Text(text),
            Outbound::Binary(data) => Frame::Binary(data),
            Outbound::Message(message) => match encode(&message, config.outbound_format) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Failed to encode message {}: {}", message.id(), e);
                    unsendable(session, &message, &e.to_string());
                    continue;
                }
            },
        };

        trace!("Sending {:?}", frame);
        sink.send(frame).await.map_err(ConnectionError::Transport)?;
    }

    Ok(())
}

/// Read frames until the stream ends, resolving responses inline and spawning
/// a task per request.
async fn pump_inbound(
    stream: &mut FrameStream,
    session: &Arc<Session>,
    config: &ConnectionConfig,
) -> Result<()> {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to send reply: {}", e),
                    Err(e) => error!("Request task failed: {}", e),
                }
            }
            frame = stream.next() => {
                let message = match frame {
                    None => {
                        debug!("Stream ended");
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(ConnectionError::Transport(e).into()),
                    Some(Ok(Frame::Close)) => {
                        debug!("Peer closed the stream");
                        return Ok(());
                    }
                    Some(Ok(Frame::Control)) => continue,
                    Some(Ok(Frame::Text(text))) => {
                        check_size(text.len(), config)?;
                        trace!("Received text frame: {}", text);
                        codec::decode_text(&text)?
                    }
                    Some(Ok(Frame::Binary(data))) => {
                        check_size(data.len(), config)?;
                        trace!("Received binary frame of {} bytes", data.len());
                        codec::decode_binary(&data)?
                    }
                };

                match message {
                    Message::Request(request) => {
                        handlers.spawn(Arc::clone(session).dispatch(request));
                    }
                    Message::Response(response) => session.resolve(response)?,
                }
            }
        }
    }
}

fn encode(message: &Message, format: WireFormat) -> Result<Frame> {
    match format {
        WireFormat::Text => codec::encode_text(message).map(Frame::Text),
        WireFormat::Binary => codec::encode_binary(message).map(Frame::Binary),
    }
}

/// Settle a message that could not be encoded so nobody waits on it forever.
fn unsendable(session: &Session, message: &Message, reason: &str) {
    let exception = RemoteException::internal(format!("message could not be encoded: {reason}"));
    match message {
        // Fail the local waiter.
        Message::Request(request) => {
            if let Err(e) = session.resolve(Response::error(request.id, exception)) {
                warn!("Could not fail request {}: {}", request.id, e);
            }
        }
        // Tell the peer its call failed.
        Message::Response(response) if response.payload.is_ok() => {
            if let Err(e) = session.send(Response::error(response.id, exception).into()) {
                warn!("Could not report encoding failure for {}: {}", response.id, e);
            }
        }
        Message::Response(_) => {}
    }
}

fn check_size(size: usize, config: &ConnectionConfig) -> Result<()> {
    if size > config.max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: config.max_frame_size,
        }
        .into());
    }
    Ok(())
}

//! WebSocket binding for launchpad RPC sessions.
//!
//! - For connecting: [`WebSocketConnector`] dials `ws://` and `wss://` URLs
//!   with tokio-tungstenite
//! - For listening: [`WebSocketListener`] provides an Axum handler that can be
//!   mounted into an existing server; upgraded sockets come out of
//!   [`WebSocketListener::accept`]
//!
//! Text and binary WebSocket messages map one to one onto
//! [`Frame::Text`] and [`Frame::Binary`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{self, WebSocket};
use axum::extract::{Path, WebSocketUpgrade};
use bytes::Bytes;
use futures::{SinkExt, StreamExt, future};
use launchpad_rpc::{Channel, Connector, Frame, TransportError};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};
use url::Url;

/// Dials WebSocket servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a new connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    fn schemes(&self) -> &[&'static str] {
        &["ws", "wss"]
    }

    async fn connect(&self, address: &Url) -> Result<Channel, TransportError> {
        if !self.schemes().contains(&address.scheme()) {
            return Err(TransportError::InvalidAddress(format!(
                "unsupported scheme in {address}"
            )));
        }

        debug!("Connecting to WebSocket at {}", address);

        let (ws_stream, _) = connect_async(address.as_str()).await.map_err(|e| {
            TransportError::ConnectionFailed(format!("WebSocket connect failed: {e}"))
        })?;
        let (sink, stream) = ws_stream.split();

        let sink = sink
            .sink_map_err(|e| TransportError::Other(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(client_message(frame))));
        let stream = stream.map(|message| {
            message
                .map(client_frame)
                .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))
        });

        info!("WebSocket connection established to {}", address);
        Ok(Channel::new(sink, stream).with_peer(address.to_string()))
    }
}

fn client_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Control => Message::Ping(Bytes::new()),
        Frame::Close => Message::Close(None),
    }
}

fn client_frame(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Binary(data) => Frame::Binary(data),
        Message::Close(_) => Frame::Close,
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Frame::Control,
    }
}

/// Wrap an upgraded server-side socket.
pub fn channel_from_socket(socket: WebSocket) -> Channel {
    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(|e| TransportError::Other(e.to_string()))
        .with(|frame: Frame| future::ready(Ok::<_, TransportError>(server_message(frame))));
    let stream = stream.map(|message| {
        message
            .map(server_frame)
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))
    });

    Channel::new(sink, stream)
}

fn server_message(frame: Frame) -> ws::Message {
    match frame {
        Frame::Text(text) => ws::Message::Text(text.into()),
        Frame::Binary(data) => ws::Message::Binary(data),
        Frame::Control => ws::Message::Ping(Bytes::new()),
        Frame::Close => ws::Message::Close(None),
    }
}

fn server_frame(message: ws::Message) -> Frame {
    match message {
        ws::Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        ws::Message::Binary(data) => Frame::Binary(data),
        ws::Message::Close(_) => Frame::Close,
        ws::Message::Ping(_) | ws::Message::Pong(_) => Frame::Control,
    }
}

/// A socket upgraded by a [`WebSocketListener`] route.
#[derive(Debug)]
pub struct Accepted {
    /// The `{client_id}` path segment the peer connected on.
    pub client_id: String,
    /// The upgraded socket.
    pub channel: Channel,
}

/// Hands out sockets upgraded by its Axum route.
#[derive(Debug)]
pub struct WebSocketListener {
    incoming_tx: mpsc::Sender<Accepted>,
    incoming_rx: Mutex<mpsc::Receiver<Accepted>>,
}

impl WebSocketListener {
    /// Create a listener with no route mounted yet.
    #[must_use]
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(100);
        Self {
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
        }
    }

    /// Mount the upgrade handler at `path`, which must capture `{client_id}`,
    /// e.g. `/transport/ws/{client_id}`.
    pub fn mount_into_router<S>(&self, router: Router<S>, path: &str) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let incoming_tx = self.incoming_tx.clone();

        let handler = move |Path(client_id): Path<String>, upgrade: WebSocketUpgrade| {
            let incoming_tx = incoming_tx.clone();

            async move {
                upgrade.on_upgrade(move |socket| async move {
                    debug!("Upgraded WebSocket for client {}", client_id);
                    let channel = channel_from_socket(socket).with_peer(client_id.clone());
                    if incoming_tx
                        .send(Accepted { client_id, channel })
                        .await
                        .is_err()
                    {
                        error!("Failed to hand connection to listener");
                    }
                })
            }
        };

        router.route(path, axum::routing::get(handler))
    }

    /// Wait for the next upgraded socket.
    pub async fn accept(&self) -> Option<Accepted> {
        self.incoming_rx.lock().await.recv().await
    }
}

impl Default for WebSocketListener {
    fn default() -> Self {
        Self::new()
    }
}

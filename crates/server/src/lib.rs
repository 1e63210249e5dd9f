//! Reference launchpad server.
//!
//! Clients dial `ws://<listen>/transport/ws/{client_id}`. Each accepted socket
//! gets its own [`Session`], kept in a [`SessionRegistry`] under the client id
//! for as long as the connection lives. A client that reconnects under the
//! same id closes its previous connection. A small JSON API lets operators list
//! connected clients and call their methods:
//!
//! - `GET /clients` returns the connected client ids
//! - `POST /clients/{client_id}/call` with `{method, params?, timeout_ms?}`
//!   invokes a method on that client
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod api;
mod error;

pub use error::Error;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use dashmap::DashMap;
use launchpad_rpc::{Connection, ConnectionConfig, MethodTable, Session, SessionRegistry, Value};
use launchpad_transport_ws::{Accepted, WebSocketListener};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::api::ApiState;

/// Route clients dial, with the client id as the last segment.
pub const DEFAULT_WS_PATH: &str = "/transport/ws/{client_id}";

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP listener binds.
    pub listen_addr: SocketAddr,
    /// Route of the WebSocket upgrade; must capture `{client_id}`.
    pub ws_path: String,
    /// Timeout of API calls that do not set `timeout_ms`.
    pub call_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            ws_path: DEFAULT_WS_PATH.to_string(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Accepts client sessions and serves the control API.
#[derive(Debug)]
pub struct LaunchpadServer {
    config: ServerConfig,
    registry: SessionRegistry,
    live: LiveConnections,
    listener: Arc<WebSocketListener>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl LaunchpadServer {
    /// Create a server that is not listening yet.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: SessionRegistry::new(),
            live: LiveConnections::default(),
            listener: Arc::new(WebSocketListener::new()),
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Sessions of the connected clients.
    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Methods every client session exposes to its client.
    #[must_use]
    pub fn methods() -> MethodTable {
        let mut methods = MethodTable::new();
        methods.register("server.greet", |_session, _params| async {
            Ok(Value::Text("Howdy".to_string()))
        });
        methods
    }

    /// The WebSocket route plus the control API.
    pub fn router(&self) -> Router {
        let state = ApiState {
            registry: self.registry.clone(),
            call_timeout: self.config.call_timeout,
        };

        let api = Router::new()
            .route("/clients", get(api::list_clients))
            .route("/clients/{client_id}/call", post(api::call_client))
            .with_state(state);

        self.listener.mount_into_router(api, &self.config.ws_path)
    }

    /// Bind the listen address and start serving in the background.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// it asks for port 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second call, or
    /// [`Error::Bind`] if the address is unavailable.
    pub async fn start(&self) -> Result<SocketAddr, Error> {
        if self.task_tracker.is_closed() {
            return Err(Error::AlreadyStarted);
        }

        let addr = self.config.listen_addr;
        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = tcp
            .local_addr()
            .map_err(|source| Error::Bind { addr, source })?;

        let router = self.router();
        let shutdown_token = self.shutdown_token.clone();
        self.task_tracker.spawn(async move {
            tokio::select! {
                e = axum::serve(tcp, router).into_future() => {
                    info!("http server exited {:?}", e);
                }
                () = shutdown_token.cancelled() => {}
            }
        });

        self.task_tracker.spawn(accept_clients(
            Arc::clone(&self.listener),
            self.registry.clone(),
            self.live.clone(),
            self.task_tracker.clone(),
            self.shutdown_token.clone(),
        ));

        self.task_tracker.close();
        info!("Listening on {}", local_addr);

        Ok(local_addr)
    }

    /// Stop serving, drop every client and wait for their tasks.
    pub async fn shutdown(&self) {
        info!("server shutting down...");

        self.shutdown_token.cancel();
        self.task_tracker.wait().await;

        info!("server shutdown");
    }
}

/// Cancellation of each client's current connection, keyed by client id.
#[derive(Debug, Clone, Default)]
struct LiveConnections {
    tokens: Arc<DashMap<String, (Uuid, CancellationToken)>>,
}

impl LiveConnections {
    /// Record `connection_id` as the client's connection, cancelling the one
    /// it replaces.
    fn claim(&self, client_id: &str, connection_id: Uuid, token: CancellationToken) {
        if let Some((previous, superseded)) = self
            .tokens
            .insert(client_id.to_string(), (connection_id, token))
        {
            debug!("Closing connection {} superseded by {}", previous, connection_id);
            superseded.cancel();
        }
    }

    /// Forget `connection_id` unless a newer connection already replaced it.
    fn release(&self, client_id: &str, connection_id: Uuid) {
        self.tokens
            .remove_if(client_id, |_, (current, _)| *current == connection_id);
    }
}

async fn accept_clients(
    listener: Arc<WebSocketListener>,
    registry: SessionRegistry,
    live: LiveConnections,
    task_tracker: TaskTracker,
    shutdown_token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = shutdown_token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let Some(accepted) = accepted else {
            break;
        };

        task_tracker.spawn(serve_client(
            accepted,
            registry.clone(),
            live.clone(),
            shutdown_token.child_token(),
        ));
    }
    debug!("Accept loop stopped");
}

async fn serve_client(
    accepted: Accepted,
    registry: SessionRegistry,
    live: LiveConnections,
    client_token: CancellationToken,
) {
    let Accepted { client_id, channel } = accepted;

    let session = Session::new(LaunchpadServer::methods());
    let mut connection = Connection::new(Arc::clone(&session), ConnectionConfig::default());
    if let Err(e) = connection.accept(channel) {
        error!("Failed to bind client {}: {}", client_id, e);
        return;
    }

    if registry
        .insert(client_id.clone(), Arc::clone(&session))
        .is_some()
    {
        info!("Client {} reconnected", client_id);
    } else {
        info!("Client {} connected", client_id);
    }
    live.claim(&client_id, connection.id(), client_token.clone());

    tokio::select! {
        result = connection.run() => {
            if let Err(e) = result {
                debug!("Client {} connection failed: {}", client_id, e);
            }
        }
        () = client_token.cancelled() => {}
    }
    connection.close().await;

    live.release(&client_id, connection.id());
    if !registry.remove_if_same(&client_id, &session) {
        debug!("Client {} already superseded", client_id);
    }
    info!("Client {} disconnected", client_id);
}

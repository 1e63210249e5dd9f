//! RPC endpoint: call correlation and inbound dispatch.
//!
//! A [`Session`] outlives the connections it is bound to. Outgoing calls are
//! tracked in a pending table keyed by request id; each waiter parks on its
//! own [`Notify`] and is woken directly when the matching response arrives.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use ciborium::Value;
use futures::FutureExt;
use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::connection::{ConnectionHandle, Outbound};
use crate::error::{ConnectionError, Error, ProtocolError, Result};
use crate::handler::RpcHandler;
use crate::protocol::exception::{ExceptionKind, RemoteException};
use crate::protocol::message::{Message, Params, Request, RequestId, Response};

/// Largest id handed out by [`Session::call`]. Fits a JSON number exactly.
pub const MAX_REQUEST_ID: RequestId = (1 << 53) - 1;

const DEFAULT_COMPLETED_HISTORY: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wait budget for [`Session::call`]. `None` waits indefinitely.
    pub default_timeout: Option<Duration>,
    /// How many consumed ids to remember for duplicate detection.
    pub completed_history: NonZeroUsize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout: Some(Duration::from_secs(30)),
            completed_history: DEFAULT_COMPLETED_HISTORY,
        }
    }
}

enum CallState {
    Awaiting,
    Resolved(Response),
    Abandoned,
}

struct PendingCall {
    state: CallState,
    wake: Arc<Notify>,
}

struct PendingCalls {
    calls: HashMap<RequestId, PendingCall>,
    completed: LruCache<RequestId, ()>,
}

/// One RPC endpoint, bound to at most one connection at a time.
pub struct Session {
    handler: Arc<dyn RpcHandler>,
    config: SessionConfig,
    pending: Mutex<PendingCalls>,
    connection: Mutex<Option<ConnectionHandle>>,
}

impl Session {
    /// Create a session dispatching inbound requests to `handler`.
    pub fn new(handler: impl RpcHandler) -> Arc<Self> {
        Self::with_config(handler, SessionConfig::default())
    }

    /// Create a session with explicit configuration.
    pub fn with_config(handler: impl RpcHandler, config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            handler: Arc::new(handler),
            pending: Mutex::new(PendingCalls {
                calls: HashMap::new(),
                completed: LruCache::new(config.completed_history),
            }),
            connection: Mutex::new(None),
            config,
        })
    }

    /// Session configuration.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether a connection is currently bound.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }

    /// Id of the bound connection.
    #[must_use]
    pub fn connection_id(&self) -> Option<Uuid> {
        self.connection.lock().as_ref().map(ConnectionHandle::id)
    }

    /// Number of calls still tracked in the pending table.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().calls.len()
    }

    /// Bind a freshly connected connection.
    ///
    /// Calls still waiting on a previous connection are abandoned.
    pub fn on_connect(&self, handle: ConnectionHandle) {
        let abandoned = {
            let mut pending = self.pending.lock();
            let mut abandoned = 0;
            for call in pending.calls.values_mut() {
                if matches!(call.state, CallState::Awaiting) {
                    call.state = CallState::Abandoned;
                    call.wake.notify_one();
                    abandoned += 1;
                }
            }
            abandoned
        };
        if abandoned > 0 {
            debug!("Abandoned {} calls from the previous connection", abandoned);
        }

        info!("Session bound to connection {}", handle.id());
        *self.connection.lock() = Some(handle);
    }

    /// Unbind `connection_id` if it is still the bound connection.
    ///
    /// Pending calls are left alone; they time out or are abandoned by the
    /// next [`Session::on_connect`].
    pub fn on_disconnect(&self, connection_id: Uuid) {
        let mut connection = self.connection.lock();
        if connection.as_ref().map(ConnectionHandle::id) == Some(connection_id) {
            *connection = None;
            info!("Session unbound from connection {}", connection_id);
        }
    }

    /// Handle one decoded inbound message.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for a duplicate response, which is fatal to the
    /// connection, or a connection error if a reply could not be queued.
    pub async fn on_recv(self: &Arc<Self>, message: Message) -> Result<()> {
        match message {
            Message::Request(request) => Arc::clone(self).dispatch(request).await,
            Message::Response(response) => self.resolve(response),
        }
    }

    /// Run the local handler for `request` and send back its response.
    ///
    /// Handler failures and panics become error responses.
    ///
    /// # Errors
    ///
    /// Returns an error if the response could not be queued.
    pub async fn dispatch(self: Arc<Self>, request: Request) -> Result<()> {
        let Request { id, method, params } = request;
        debug!("Dispatching {} (id {})", method, id);

        let outcome = AssertUnwindSafe(self.handler.handle(Arc::clone(&self), &method, params))
            .catch_unwind()
            .await;

        let payload = match outcome {
            Ok(payload) => payload,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Handler for {} panicked: {}", method, reason);
                Err(RemoteException::new(ExceptionKind::HandlerPanicked, reason)
                    .with_attribute("method", Value::Text(method.clone())))
            }
        };

        if let Err(exception) = &payload {
            debug!("Call {} (id {}) failed: {}", method, id, exception);
        }

        self.send(Response { id, payload }.into())
    }

    /// Deliver an inbound response to its waiter.
    ///
    /// Responses for ids this side no longer tracks are logged and dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::DuplicateResponse`] if the id was already resolved.
    pub fn resolve(&self, response: Response) -> Result<()> {
        let id = response.id;
        let mut pending = self.pending.lock();

        if let Some(call) = pending.calls.get_mut(&id) {
            match call.state {
                CallState::Awaiting => {
                    trace!("Resolved call {}", id);
                    call.state = CallState::Resolved(response);
                    call.wake.notify_one();
                    Ok(())
                }
                CallState::Resolved(_) => Err(ProtocolError::DuplicateResponse(id).into()),
                CallState::Abandoned => {
                    debug!("Dropping response for abandoned call {}", id);
                    Ok(())
                }
            }
        } else if pending.completed.contains(&id) {
            Err(ProtocolError::DuplicateResponse(id).into())
        } else {
            warn!("Discarding response for unknown request id {}", id);
            Ok(())
        }
    }

    /// Queue a message on the bound connection.
    ///
    /// A request's id is registered as pending before the message is queued,
    /// so a fast reply can never miss its waiter.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] without a bound connection, or
    /// a protocol error if a request reuses an id that is still pending.
    pub fn send(&self, message: Message) -> Result<()> {
        let request_id = match &message {
            Message::Request(request) => {
                self.register(request.id)?;
                Some(request.id)
            }
            Message::Response(_) => None,
        };

        let handle = self.connection.lock().clone();
        let queued = match handle {
            Some(handle) => handle.send(Outbound::Message(message)),
            None => Err(ConnectionError::NotConnected.into()),
        };

        if let (Err(_), Some(id)) = (&queued, request_id) {
            self.forget(id);
        }
        queued
    }

    /// Wait for the response to a pending call.
    ///
    /// Returns `Ok(None)` once `timeout` elapses; the call is then forgotten
    /// and a late reply is discarded. The call is also forgotten if this
    /// future is dropped before it completes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Abandoned`] if the call was dropped because the session
    /// moved to a new connection, or if `id` is not pending.
    pub async fn recv(&self, id: RequestId, timeout: Option<Duration>) -> Result<Option<Response>> {
        let wake = {
            let pending = self.pending.lock();
            match pending.calls.get(&id) {
                Some(call) => Arc::clone(&call.wake),
                None => return Err(Error::Abandoned(id)),
            }
        };
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        // Dropping this future mid-wait must not leave the entry behind.
        let mut guard = PendingGuard {
            session: self,
            id,
            armed: true,
        };
        let outcome = self.wait_for(id, &wake, deadline).await;
        guard.armed = false;
        outcome
    }

    async fn wait_for(
        &self,
        id: RequestId,
        wake: &Notify,
        deadline: Option<Instant>,
    ) -> Result<Option<Response>> {
        loop {
            if let Some(response) = self.take_resolved(id)? {
                return Ok(Some(response));
            }

            let notified = wake.notified();
            match deadline {
                Some(deadline) => {
                    if time::timeout_at(deadline, notified).await.is_err() {
                        if let Some(response) = self.take_resolved(id)? {
                            return Ok(Some(response));
                        }
                        self.forget(id);
                        debug!("Call {} timed out", id);
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Call `method` on the peer with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the peer's handler failed,
    /// [`Error::Timeout`] if no response arrived in time, or a connection error.
    pub async fn call(&self, method: impl Into<String>, params: impl Into<Params>) -> Result<Value> {
        self.call_with_timeout(method, params, self.config.default_timeout)
            .await
    }

    /// Call `method` on the peer, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// See [`Session::call`].
    pub async fn call_with_timeout(
        &self,
        method: impl Into<String>,
        params: impl Into<Params>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = self.fresh_id();
        let request = Request::new(id, method, params);
        trace!("Calling {} (id {})", request.method, id);

        self.send(request.into())?;

        match self.recv(id, timeout).await? {
            Some(response) => response.payload.map_err(Error::Remote),
            None => Err(Error::Timeout {
                id,
                timeout: timeout.unwrap_or_default(),
            }),
        }
    }

    /// Proxy for methods under `namespace` on the peer.
    #[must_use]
    pub fn remote(self: &Arc<Self>, namespace: impl Into<String>) -> RemoteProxy {
        RemoteProxy {
            session: Arc::clone(self),
            namespace: namespace.into(),
        }
    }

    fn fresh_id(&self) -> RequestId {
        let pending = self.pending.lock();
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(1..=MAX_REQUEST_ID);
            if !pending.calls.contains_key(&id) {
                return id;
            }
        }
    }

    fn register(&self, id: RequestId) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.calls.contains_key(&id) {
            return Err(ProtocolError::InvalidField {
                field: "id",
                reason: format!("request {id} is already pending"),
            }
            .into());
        }
        pending.calls.insert(
            id,
            PendingCall {
                state: CallState::Awaiting,
                wake: Arc::new(Notify::new()),
            },
        );
        Ok(())
    }

    fn forget(&self, id: RequestId) {
        self.pending.lock().calls.remove(&id);
    }

    fn take_resolved(&self, id: RequestId) -> Result<Option<Response>> {
        let mut pending = self.pending.lock();
        let Some(call) = pending.calls.get(&id) else {
            return Err(Error::Abandoned(id));
        };
        if matches!(call.state, CallState::Awaiting) {
            return Ok(None);
        }

        match pending.calls.remove(&id).map(|call| call.state) {
            Some(CallState::Resolved(response)) => {
                pending.completed.put(id, ());
                Ok(Some(response))
            }
            _ => Err(Error::Abandoned(id)),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection", &self.connection_id())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

/// Drops a call's pending entry when its caller goes away mid-wait.
struct PendingGuard<'a> {
    session: &'a Session,
    id: RequestId,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            trace!("Call {} cancelled by its caller", self.id);
            self.session.forget(self.id);
        }
    }
}

/// Forwards calls to `namespace.method` on the peer.
#[derive(Debug, Clone)]
pub struct RemoteProxy {
    session: Arc<Session>,
    namespace: String,
}

impl RemoteProxy {
    /// Nested namespace, e.g. `fs` then `meta` for `fs.meta.*`.
    #[must_use]
    pub fn namespace(&self, name: &str) -> Self {
        Self {
            session: Arc::clone(&self.session),
            namespace: self.qualify(name),
        }
    }

    /// Call `namespace.method` on the peer.
    ///
    /// # Errors
    ///
    /// See [`Session::call`].
    pub async fn call(&self, method: &str, params: impl Into<Params>) -> Result<Value> {
        self.session.call(self.qualify(method), params).await
    }

    /// Call `namespace.method` on the peer, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// See [`Session::call`].
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: impl Into<Params>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.session
            .call_with_timeout(self.qualify(method), params, timeout)
            .await
    }

    fn qualify(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.namespace)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MethodTable;
    use tokio::sync::mpsc;

    fn bound_session(
        methods: MethodTable,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<Outbound>) {
        let session = Session::new(methods);
        let (tx, rx) = mpsc::unbounded_channel();
        session.on_connect(ConnectionHandle::new(Uuid::new_v4(), tx));
        (session, rx)
    }

    fn explode() -> crate::handler::MethodResult {
        panic!("kaboom")
    }

    fn request(id: RequestId) -> Message {
        Request::new(id, "peer.method", Params::none()).into()
    }

    #[tokio::test]
    async fn test_send_registers_before_queueing() {
        let (session, mut rx) = bound_session(MethodTable::new());

        session.send(request(5)).unwrap();
        assert_eq!(session.pending_count(), 1);
        assert!(matches!(rx.recv().await, Some(Outbound::Message(m)) if m.id() == 5));

        session.resolve(Response::result(5, Value::Integer(1.into()))).unwrap();
        let response = session.recv(5, None).await.unwrap().unwrap();
        assert_eq!(response.payload, Ok(Value::Integer(1.into())));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let session = Session::new(MethodTable::new());

        let err = session.send(request(1)).unwrap_err();
        assert!(matches!(err, Error::Connection(ConnectionError::NotConnected)));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_response_is_discarded() {
        let (session, _rx) = bound_session(MethodTable::new());
        session.send(request(1)).unwrap();

        session.resolve(Response::result(999, Value::Null)).unwrap();

        assert_eq!(session.pending_count(), 1);
        assert!(session.take_resolved(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_response_is_protocol_error() {
        let (session, _rx) = bound_session(MethodTable::new());
        session.send(request(7)).unwrap();

        session.resolve(Response::result(7, Value::Null)).unwrap();
        let err = session.resolve(Response::result(7, Value::Null)).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::DuplicateResponse(7))));

        // Still a duplicate after the waiter consumed the first response.
        session.recv(7, None).await.unwrap().unwrap();
        let err = session.resolve(Response::result(7, Value::Null)).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::DuplicateResponse(7))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_purges_entry() {
        let (session, _rx) = bound_session(MethodTable::new());
        session.send(request(3)).unwrap();

        let outcome = session.recv(3, Some(Duration::from_millis(100))).await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(session.pending_count(), 0);

        // A late reply is dropped without error.
        session.resolve(Response::result(3, Value::Null)).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let (session, _rx) = bound_session(MethodTable::new());

        let err = session
            .call_with_timeout("peer.slow", Params::none(), Some(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { timeout, .. } if timeout == Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_dropped_waiter_forgets_call() {
        let (session, _rx) = bound_session(MethodTable::new());
        session.send(request(9)).unwrap();

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.recv(9, None).await })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(session.pending_count(), 0);

        // A late reply is dropped, and a reconnect has nothing to abandon.
        session.resolve(Response::result(9, Value::Null)).unwrap();
        let (tx, _rx2) = mpsc::unbounded_channel();
        session.on_connect(ConnectionHandle::new(Uuid::new_v4(), tx));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_abandons_pending_calls() {
        let (session, _rx) = bound_session(MethodTable::new());
        session.send(request(11)).unwrap();

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.recv(11, None).await })
        };
        tokio::task::yield_now().await;

        let (tx, _rx2) = mpsc::unbounded_channel();
        session.on_connect(ConnectionHandle::new(Uuid::new_v4(), tx));

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Abandoned(11)));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_disconnect_keeps_binding() {
        let (session, _rx) = bound_session(MethodTable::new());
        let bound = session.connection_id().unwrap();

        session.on_disconnect(Uuid::new_v4());
        assert!(session.is_connected());

        session.on_disconnect(bound);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_dispatch_replies_with_result_or_error() {
        let mut methods = MethodTable::new();
        methods.register("client.ping", |_session, _params| async {
            Ok(Value::Text("pong".to_string()))
        });
        methods.register("client.explode", |_session, _params| async { explode() });
        let (session, mut rx) = bound_session(methods);

        for (id, method) in [(1, "client.ping"), (2, "client.explode"), (3, "client.nope")] {
            Arc::clone(&session)
                .dispatch(Request::new(id, method, Params::none()))
                .await
                .unwrap();
        }

        let mut replies = Vec::new();
        while let Ok(Outbound::Message(Message::Response(response))) = rx.try_recv() {
            replies.push(response);
        }

        assert_eq!(replies[0].payload, Ok(Value::Text("pong".to_string())));
        let panicked = replies[1].payload.as_ref().unwrap_err();
        assert_eq!(panicked.kind(), ExceptionKind::HandlerPanicked);
        assert_eq!(panicked.message(), "kaboom");
        let missing = replies[2].payload.as_ref().unwrap_err();
        assert_eq!(missing.kind(), ExceptionKind::MethodNotFound);
        // Replies are never tracked as pending calls.
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn test_proxy_qualifies_names() {
        let session = Session::new(MethodTable::new());
        let fs = session.remote("fs");
        assert_eq!(fs.qualify("enumerate_directory"), "fs.enumerate_directory");
        assert_eq!(fs.namespace("meta").qualify("stat"), "fs.meta.stat");
        assert_eq!(session.remote("").qualify("ping"), "ping");
    }
}

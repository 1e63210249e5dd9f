//! Local method dispatch.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use ciborium::Value;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;

use crate::protocol::exception::RemoteException;
use crate::protocol::message::Params;
use crate::session::Session;

/// Outcome of a locally handled call.
pub type MethodResult = std::result::Result<Value, RemoteException>;

/// Trait for handling inbound RPC requests.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Handle a call to `method`.
    ///
    /// `session` is the session the request arrived on, so a handler can call
    /// back into the peer while it works.
    async fn handle(&self, session: Arc<Session>, method: &str, params: Params) -> MethodResult;
}

type BoxedMethod = Box<dyn Fn(Arc<Session>, Params) -> BoxFuture<'static, MethodResult> + Send + Sync>;

/// Table of named async methods.
///
/// Names are resolved once, at registration; a call to any other name fails
/// with a `MethodNotFound` exception.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<String, BoxedMethod>,
}

impl MethodTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `method` under `name`, replacing any earlier registration.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, method: F) -> &mut Self
    where
        F: Fn(Arc<Session>, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let name = name.into();
        debug!("Registering method {}", name);
        self.methods
            .insert(name, Box::new(move |session, params| method(session, params).boxed()));
        self
    }

    /// Move every method of `table` into this one under `namespace.`.
    pub fn mount(&mut self, namespace: &str, table: Self) -> &mut Self {
        for (name, method) in table.methods {
            let name = format!("{namespace}.{name}");
            debug!("Registering method {}", name);
            self.methods.insert(name, method);
        }
        self
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.names())
            .finish()
    }
}

#[async_trait]
impl RpcHandler for MethodTable {
    async fn handle(&self, session: Arc<Session>, method: &str, params: Params) -> MethodResult {
        match self.methods.get(method) {
            Some(handler) => handler(session, params).await,
            None => Err(RemoteException::method_not_found(method)),
        }
    }
}

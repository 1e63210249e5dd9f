//! Live sessions keyed by peer identity.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::session::Session;

/// Concurrent map from client id to its live session.
///
/// Entries are inserted when a peer is accepted and removed when its
/// connection ends. Cloning shares the same map.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` under `id`, returning the session it displaced.
    pub fn insert(&self, id: impl Into<String>, session: Arc<Session>) -> Option<Arc<Session>> {
        let id = id.into();
        debug!("Registering session for {}", id);
        self.sessions.insert(id, session)
    }

    /// Remove `id` only if it still maps to `session`.
    ///
    /// A peer that reconnected under the same id keeps its newer entry.
    pub fn remove_if_same(&self, id: &str, session: &Arc<Session>) -> bool {
        let removed = self
            .sessions
            .remove_if(id, |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if removed {
            debug!("Removed session for {}", id);
        }
        removed
    }

    /// Look up the session for `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Registered ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

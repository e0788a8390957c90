//! Registry of live sessions

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use sm_core::error::SessionError;

use super::handle::Session;

/// Owns every registered session, keyed by its caller-chosen id
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; fails without touching the map if the id is taken
    pub fn insert(&self, session: Arc<Session>) -> Result<(), SessionError> {
        match self.sessions.entry(session.id().to_string()) {
            Entry::Occupied(entry) => Err(SessionError::AlreadyExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|r| Arc::clone(&r))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Remove `session`, but only if its id still maps to that same session
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    /// All sessions, oldest first
    pub fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|r| Arc::clone(&r)).collect();
        sessions.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        sessions
    }

    pub fn ids(&self) -> Vec<String> {
        self.list().iter().map(|s| s.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

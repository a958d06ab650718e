//! Concurrent registry of live connection sessions, keyed by session id

use dashmap::DashMap;
use std::fmt::Debug;

/// A registry entry that belongs to a saved server and has a status
pub trait TrackedSession {
    type Status: Copy + PartialEq + Debug;

    fn server_id(&self) -> &str;
    fn status(&self) -> Self::Status;
}

/// Outcome of [`ConnectionRegistry::claim`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// A live session for the server already exists
    Existing(String),
    /// A new entry was inserted under this id
    Created(String),
}

pub struct ConnectionRegistry<S> {
    sessions: DashMap<String, S>,
    /// Serializes find-then-insert in `claim`
    claim_lock: parking_lot::Mutex<()>,
}

impl<S: TrackedSession> Default for ConnectionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: TrackedSession> ConnectionRegistry<S> {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            claim_lock: parking_lot::Mutex::new(()),
        }
    }

    pub fn put(&self, id: String, session: S) {
        self.sessions.insert(id, session);
    }

    /// Read an entry under its shard guard
    pub fn get<R>(&self, id: &str, f: impl FnOnce(&S) -> R) -> Option<R> {
        self.sessions.get(id).map(|entry| f(entry.value()))
    }

    /// Mutate an entry under its shard guard.
    ///
    /// Returns `None` when the entry is gone; a removed session is never
    /// brought back.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        self.sessions.get_mut(id).map(|mut entry| f(entry.value_mut()))
    }

    /// Remove an entry. Only one caller ever receives `Some` for a given id.
    pub fn remove(&self, id: &str) -> Option<S> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// First session for `server_id` whose status is one of `live`
    pub fn find_active_for(&self, server_id: &str, live: &[S::Status]) -> Option<(String, S::Status)> {
        self.sessions.iter().find_map(|entry| {
            let session = entry.value();
            let status = session.status();
            (session.server_id() == server_id && live.contains(&status))
                .then(|| (entry.key().clone(), status))
        })
    }

    /// Return the live session for `server_id`, or insert the one `create`
    /// builds. Lookup and insert are atomic with respect to other claims.
    pub fn claim(&self, server_id: &str, live: &[S::Status], create: impl FnOnce() -> (String, S)) -> Claim {
        let _guard = self.claim_lock.lock();

        if let Some((id, _)) = self.find_active_for(server_id, live) {
            return Claim::Existing(id);
        }

        let (id, session) = create();
        self.sessions.insert(id.clone(), session);
        Claim::Created(id)
    }

    /// Map every entry through `f`
    pub fn snapshot<R>(&self, f: impl Fn(&str, &S) -> R) -> Vec<R> {
        self.sessions
            .iter()
            .map(|entry| f(entry.key(), entry.value()))
            .collect()
    }
}

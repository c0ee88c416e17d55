use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Session, SessionId};

#[derive(Default)]
struct Entries {
    sessions: HashMap<SessionId, Arc<Session>>,
    /// Client-chosen connection name -> session currently serving it.
    connections: HashMap<String, SessionId>,
}

impl Entries {
    /// Drop the connection index entry if it still points at `session`.
    fn unlink(&mut self, session: &Session) {
        if let Some(connection) = session.connection_id() {
            if self.connections.get(connection) == Some(session.id()) {
                self.connections.remove(connection);
            }
        }
    }
}

/// Thread-safe map of live sessions, keyed by [`SessionId`].
///
/// Client-chosen connection names live in their own index, so a client can
/// only ever reach sessions it named itself. Every operation is a single
/// critical section under one `parking_lot::Mutex`. The registry is cheap
/// to clone; clones share the same map.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    entries: Arc<Mutex<Entries>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session`.
    ///
    /// Returns the session it displaces: one registered under the same ID,
    /// or else the one that served the same connection name until now. A
    /// session displaced by connection name stays registered until its own
    /// teardown removes it.
    pub fn add(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let id = session.id().clone();
        let mut entries = self.entries.lock();
        let mut displaced = entries.sessions.insert(id.clone(), session.clone());

        if let Some(connection) = session.connection_id() {
            let previous = entries.connections.insert(connection.to_string(), id.clone());
            if let Some(previous) = previous.filter(|previous| *previous != id) {
                displaced = displaced.or_else(|| entries.sessions.get(&previous).cloned());
            }
        }

        tracing::debug!(
            session_id = %id,
            total_sessions = entries.sessions.len(),
            "session registered"
        );
        displaced
    }

    /// Remove by ID. Removing an absent ID is a no-op.
    pub fn remove(&self, id: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(session) = entries.sessions.remove(id) else {
            return false;
        };
        entries.unlink(&session);
        tracing::debug!(
            session_id = %id,
            total_sessions = entries.sessions.len(),
            "session removed"
        );
        true
    }

    /// Remove `session` only if it is the entry registered under its ID.
    ///
    /// A session that was replaced never evicts its successor, neither
    /// from the session map nor from the connection index.
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut entries = self.entries.lock();
        match entries.sessions.get(session.id().as_str()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                entries.sessions.remove(session.id().as_str());
                entries.unlink(session);
                tracing::debug!(
                    session_id = %session.id(),
                    total_sessions = entries.sessions.len(),
                    "session removed"
                );
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.entries.lock().sessions.get(id).cloned()
    }

    /// Session currently serving the client-chosen `connection` name.
    pub fn lookup_connection(&self, connection: &str) -> Option<Arc<Session>> {
        let entries = self.entries.lock();
        let id = entries.connections.get(connection)?;
        entries.sessions.get(id).cloned()
    }

    /// All registered sessions at one instant.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.entries.lock().sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().sessions.is_empty()
    }

    /// Drop every entry, returning how many sessions there were.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.sessions.len();
        entries.sessions.clear();
        entries.connections.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockPeer;

    fn session(id: &str) -> Arc<Session> {
        Arc::new(Session::new(id.into(), "rtsp://cam", Arc::new(MockPeer::default())))
    }

    fn named(connection: &str) -> Arc<Session> {
        let peer = Arc::new(MockPeer::default());
        let session = Session::new(SessionId::generate(), "rtsp://cam", peer)
            .with_connection_id(Some(connection.to_string()));
        Arc::new(session)
    }

    #[test]
    fn add_lookup_remove() {
        let registry = SessionRegistry::new();
        let s = session("a");
        assert!(registry.add(s.clone()).is_none());

        assert!(Arc::ptr_eq(&registry.lookup("a").unwrap(), &s));
        assert!(registry.lookup("b").is_none());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_session_spares_successor() {
        let registry = SessionRegistry::new();
        let old = session("cam-tab");
        let new = session("cam-tab");

        registry.add(old.clone());
        let displaced = registry.add(new.clone()).unwrap();
        assert!(Arc::ptr_eq(&displaced, &old));

        assert!(!registry.remove_session(&old));
        assert!(Arc::ptr_eq(&registry.lookup("cam-tab").unwrap(), &new));
        assert!(registry.remove_session(&new));
        assert!(registry.is_empty());
    }

    #[test]
    fn connection_names_index_their_own_sessions() {
        let registry = SessionRegistry::new();
        let old = named("tab-1");
        let new = named("tab-1");

        assert!(registry.add(old.clone()).is_none());
        assert!(Arc::ptr_eq(&registry.lookup_connection("tab-1").unwrap(), &old));

        let displaced = registry.add(new.clone()).unwrap();
        assert!(Arc::ptr_eq(&displaced, &old));
        assert_eq!(registry.len(), 2);

        // the replaced session leaves without taking the name with it
        assert!(registry.remove_session(&old));
        assert!(Arc::ptr_eq(&registry.lookup_connection("tab-1").unwrap(), &new));

        assert!(registry.remove(new.id().as_str()));
        assert!(registry.lookup_connection("tab-1").is_none());
    }

    #[test]
    fn connection_name_never_resolves_a_session_id() {
        let registry = SessionRegistry::new();
        let generated = session("0000000000000000");
        registry.add(generated.clone());

        assert!(registry.lookup_connection(generated.id().as_str()).is_none());
        assert!(registry.add(named(generated.id().as_str())).is_none());
        assert!(Arc::ptr_eq(&registry.lookup("0000000000000000").unwrap(), &generated));
    }

    #[test]
    fn snapshot_is_detached() {
        let registry = SessionRegistry::new();
        registry.add(session("a"));
        registry.add(named("tab"));

        let snapshot = registry.snapshot();
        registry.remove("a");

        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.clear(), 1);
        assert!(registry.lookup_connection("tab").is_none());
        assert_eq!(registry.clear(), 0);
    }

    #[test]
    fn clones_share_state() {
        let registry = SessionRegistry::new();
        let clone = registry.clone();
        registry.add(session("a"));
        assert!(clone.lookup("a").is_some());
    }

    #[test]
    fn concurrent_adds_and_removes() {
        let registry = SessionRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("{t}-{i}");
                        registry.add(session(&id));
                        if i % 2 == 0 {
                            assert!(registry.remove(&id));
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.len(), 8 * 25);
    }
}

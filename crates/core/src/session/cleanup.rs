//! Session teardown.
//!
//! Teardown runs at most once per session no matter how many triggers fire
//! (transport state change, explicit stop, shutdown drain). Steps run in a
//! fixed order and each one is allowed to fail on its own:
//!
//! | Step | Action |
//! |------|--------|
//! | `close_media` | dispose the relay and close the source binding |
//! | `stop_tracks` | stop outbound and inbound tracks |
//! | `close_connection` | close the transport connection |
//! | `unregister` | drop the session from the registry |
//!
//! The session is then marked `Closed`.

use std::sync::Arc;

use tokio::task::JoinSet;

use super::{Session, SessionRegistry};
use crate::error::BridgeError;

/// Outcome of one [`Cleanup::close`] call.
#[derive(Debug, Default)]
pub struct Teardown {
    /// `false` when another caller already owned the teardown.
    pub performed: bool,
    /// Steps that failed, in execution order.
    pub failures: Vec<BridgeError>,
}

impl Teardown {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone)]
pub struct Cleanup {
    registry: SessionRegistry,
}

impl Cleanup {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    /// Tear `session` down. Later and concurrent calls return immediately.
    pub async fn close(&self, session: &Arc<Session>) -> Teardown {
        if !session.begin_close() {
            tracing::trace!(session_id = %session.id(), "teardown already claimed");
            return Teardown::default();
        }

        let id = session.id().clone();
        tracing::debug!(session_id = %id, "closing session");

        let mut failures = Vec::new();
        let mut fail = |step: &'static str, e: BridgeError| {
            tracing::warn!(session_id = %id, step, error = %e, "teardown step failed");
            failures.push(BridgeError::Cleanup {
                step,
                reason: e.to_string(),
            });
        };

        if let Some(media) = session.take_media() {
            // closes the binding as well
            if let Err(e) = media.relay.close().await {
                fail("close_media", e);
            }
        }

        if let Err(e) = session.peer().stop_tracks().await {
            fail("stop_tracks", e);
        }

        if let Err(e) = session.peer().close().await {
            fail("close_connection", e);
        }

        if !self.registry.remove_session(session) {
            tracing::debug!(session_id = %id, "session was not registered");
        }

        session.mark_closed();
        tracing::info!(session_id = %id, failed_steps = failures.len(), "session closed");

        Teardown {
            performed: true,
            failures,
        }
    }

    /// Close every registered session concurrently and wait for all of them.
    ///
    /// Returns the number of sessions that were registered.
    pub async fn close_all(&self) -> usize {
        let sessions = self.registry.snapshot();
        let count = sessions.len();

        let mut tasks = JoinSet::new();
        for session in sessions {
            let cleanup = self.clone();
            tasks.spawn(async move {
                cleanup.close(&session).await;
                // another trigger may own the teardown; wait for it either way
                session.wait_closed().await;
            });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "teardown task failed");
            }
        }

        self.registry.clear();
        if count > 0 {
            tracing::info!(count, "all sessions closed");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::media::{FrameRelay, MediaSourceBinding, RelayConfig, SourceOptions};
    use crate::session::{SessionId, SessionState};
    use crate::testutil::{MockPeer, Probe, ScriptedFactory, Step};

    struct Fixture {
        session: Arc<Session>,
        peer: Arc<MockPeer>,
        probe: Arc<Probe>,
    }

    async fn registered(registry: &SessionRegistry, peer: MockPeer) -> Fixture {
        let factory = ScriptedFactory::new(vec![Step::Hang]);
        let probe = factory.probe.clone();
        let binding = Arc::new(
            MediaSourceBinding::open(&factory, "rtsp://cam", &SourceOptions::default())
                .await
                .unwrap(),
        );
        let relay = Arc::new(FrameRelay::new(binding.clone(), RelayConfig::default()));

        let peer = Arc::new(peer);
        let session = Arc::new(Session::new(SessionId::generate(), "rtsp://cam", peer.clone()));
        assert!(session.attach_media(binding, relay));
        registry.add(session.clone());
        Fixture {
            session,
            peer,
            probe,
        }
    }

    #[tokio::test]
    async fn teardown_runs_every_step() {
        let registry = SessionRegistry::new();
        let cleanup = Cleanup::new(registry.clone());
        let f = registered(&registry, MockPeer::default()).await;

        let report = cleanup.close(&f.session).await;

        assert!(report.performed);
        assert!(report.is_clean());
        assert_eq!(f.probe.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(f.peer.stop_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.peer.close_calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
        assert!(!f.session.has_media());
        assert_eq!(f.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn concurrent_closes_tear_down_once() {
        let registry = SessionRegistry::new();
        let cleanup = Cleanup::new(registry.clone());
        let f = registered(&registry, MockPeer::default()).await;

        let mut tasks = JoinSet::new();
        for _ in 0..8 {
            let cleanup = cleanup.clone();
            let session = f.session.clone();
            tasks.spawn(async move { cleanup.close(&session).await.performed });
        }
        let mut performed = 0;
        while let Some(result) = tasks.join_next().await {
            performed += result.unwrap() as usize;
        }

        assert_eq!(performed, 1);
        assert!(!cleanup.close(&f.session).await.performed);
        assert_eq!(f.probe.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(f.peer.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_step_does_not_abort_later_steps() {
        let registry = SessionRegistry::new();
        let cleanup = Cleanup::new(registry.clone());
        let f = registered(&registry, MockPeer::failing_stop_tracks()).await;

        let report = cleanup.close(&f.session).await;

        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0],
            BridgeError::Cleanup {
                step: "stop_tracks",
                ..
            }
        ));
        assert_eq!(f.peer.close_calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
        assert!(f.session.is_closed());
    }

    #[tokio::test]
    async fn closing_subset_leaves_others_untouched() {
        let registry = SessionRegistry::new();
        let cleanup = Cleanup::new(registry.clone());
        let a = registered(&registry, MockPeer::default()).await;
        let b = registered(&registry, MockPeer::default()).await;
        let c = registered(&registry, MockPeer::default()).await;

        cleanup.close(&b.session).await;

        assert_eq!(registry.len(), 2);
        for kept in [&a, &c] {
            assert!(registry.lookup(kept.session.id().as_str()).is_some());
            assert!(kept.session.has_media());
            assert_eq!(kept.session.state(), SessionState::Negotiating);
            assert_eq!(kept.probe.shutdowns.load(Ordering::SeqCst), 0);
            assert_eq!(kept.peer.close_calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn close_all_drains_every_session() {
        let registry = SessionRegistry::new();
        let cleanup = Cleanup::new(registry.clone());
        let mut fixtures = Vec::new();
        for _ in 0..5 {
            fixtures.push(registered(&registry, MockPeer::default()).await);
        }

        assert_eq!(cleanup.close_all().await, 5);

        assert!(registry.is_empty());
        for f in &fixtures {
            assert!(f.session.is_closed());
            assert_eq!(f.probe.shutdowns.load(Ordering::SeqCst), 1);
            assert_eq!(f.peer.close_calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn stuck_teardown_does_not_hold_up_the_rest() {
        let registry = SessionRegistry::new();
        let cleanup = Cleanup::new(registry.clone());
        let stuck = registered(&registry, MockPeer::default()).await;
        stuck.peer.hang_close.store(true, Ordering::SeqCst);
        let mut others = Vec::new();
        for _ in 0..3 {
            others.push(registered(&registry, MockPeer::default()).await);
        }

        let drain = tokio::spawn({
            let cleanup = cleanup.clone();
            async move { cleanup.close_all().await }
        });

        for f in &others {
            tokio::time::timeout(Duration::from_secs(2), f.session.wait_closed())
                .await
                .unwrap();
            assert!(registry.lookup(f.session.id().as_str()).is_none());
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(stuck.session.state(), SessionState::Closing);
        assert_eq!(stuck.peer.close_calls.load(Ordering::SeqCst), 1);
        assert!(!drain.is_finished());
        drain.abort();
    }

    #[tokio::test]
    async fn close_all_on_empty_registry() {
        let cleanup = Cleanup::new(SessionRegistry::new());
        assert_eq!(cleanup.close_all().await, 0);
    }
}

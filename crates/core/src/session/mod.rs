//! Bridge session management.
//!
//! A session pairs one browser connection with one media source. It is
//! created when an offer arrives and destroyed by [`Cleanup`] exactly once,
//! whichever of these comes first:
//!
//! - the transport reports `failed` or `closed`,
//! - the client stops the session explicitly,
//! - the process shuts down.
//!
//! ## Session lifecycle
//!
//! ```text
//! offer received          -> Negotiating
//! answer returned         -> Active
//! connect/negotiate error -> Closing     (from Negotiating)
//! terminal state / stop   -> Closing     (from Negotiating or Active)
//! teardown finished       -> Closed      (from Closing)
//! ```
//!
//! Transitions only move forward; a session never returns to an earlier
//! state.

pub mod cleanup;
pub mod registry;

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::engine::PeerConnection;
use crate::media::{FrameRelay, MediaSourceBinding, RelayStats};
pub use cleanup::{Cleanup, Teardown};
pub use registry::SessionRegistry;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque session identifier.
///
/// Generated IDs are 16-char upper-case hex strings from a process-wide
/// counter. Sessions only ever get generated IDs; a client-chosen
/// `connection_id` is tracked separately (see
/// [`SessionRegistry::lookup_connection`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let n = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
        Self(format!("{:016X}", n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Offer received, answer not yet returned.
    Negotiating,
    /// Answer returned; media flows once the transport connects.
    Active,
    /// Teardown in progress.
    Closing,
    /// Teardown finished. Terminal.
    Closed,
}

impl SessionState {
    fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Negotiating, Active) | (Negotiating, Closing) | (Active, Closing) | (Closing, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Negotiating => "negotiating",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Media resources owned by a session.
pub struct SessionMedia {
    pub binding: Arc<MediaSourceBinding>,
    pub relay: Arc<FrameRelay>,
}

/// Read-only view of a session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub source_url: String,
    pub state: SessionState,
    pub age_secs: u64,
    pub frames_relayed: u64,
    pub fallback_frames: u64,
}

/// One browser connection bridged to one source.
pub struct Session {
    id: SessionId,
    connection_id: Option<String>,
    source_url: String,
    created_at: Instant,
    peer: Arc<dyn PeerConnection>,
    state: watch::Sender<SessionState>,
    media: Mutex<Option<SessionMedia>>,
    closing: AtomicBool,
    final_stats: Mutex<RelayStats>,
}

impl Session {
    pub fn new(id: SessionId, source_url: &str, peer: Arc<dyn PeerConnection>) -> Self {
        let (state, _) = watch::channel(SessionState::Negotiating);
        Self {
            id,
            connection_id: None,
            source_url: source_url.to_string(),
            created_at: Instant::now(),
            peer,
            state,
            media: Mutex::new(None),
            closing: AtomicBool::new(false),
            final_stats: Mutex::new(RelayStats::default()),
        }
    }

    /// Tie the session to a client-chosen connection name.
    pub fn with_connection_id(mut self, connection_id: Option<String>) -> Self {
        self.connection_id = connection_id;
        self
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Move to `next` if that is a forward transition.
    ///
    /// Returns `false` and leaves the state untouched otherwise.
    pub fn advance(&self, next: SessionState) -> bool {
        let mut from = None;
        let moved = self.state.send_if_modified(|state| {
            if state.can_advance_to(next) {
                from = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            tracing::debug!(
                session_id = %self.id,
                old_state = %from,
                new_state = %next,
                "state transition"
            );
        }
        moved
    }

    /// Hand the media resources to the session.
    ///
    /// Refused once teardown has begun; the caller then still owns them.
    pub fn attach_media(&self, binding: Arc<MediaSourceBinding>, relay: Arc<FrameRelay>) -> bool {
        let mut media = self.media.lock();
        if self.is_closing() {
            return false;
        }
        *media = Some(SessionMedia { binding, relay });
        true
    }

    pub fn has_media(&self) -> bool {
        self.media.lock().is_some()
    }

    /// Detach the media resources so exactly one caller disposes them.
    pub fn take_media(&self) -> Option<SessionMedia> {
        let media = self.media.lock().take();
        if let Some(media) = &media {
            *self.final_stats.lock() = media.relay.stats();
        }
        media
    }

    /// Claim the right to tear this session down. Only the first call wins.
    pub(crate) fn begin_close(&self) -> bool {
        if self.closing.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.advance(SessionState::Closing);
        true
    }

    pub(crate) fn mark_closed(&self) {
        self.advance(SessionState::Closed);
    }

    /// Whether teardown has been claimed.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Wait until teardown of this session has finished.
    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    pub fn info(&self) -> SessionInfo {
        let stats = self
            .media
            .lock()
            .as_ref()
            .map(|media| media.relay.stats())
            .unwrap_or_else(|| *self.final_stats.lock());
        SessionInfo {
            id: self.id.clone(),
            connection_id: self.connection_id.clone(),
            source_url: self.source_url.clone(),
            state: self.state(),
            age_secs: self.age().as_secs(),
            frames_relayed: stats.frames_delivered,
            fallback_frames: stats.fallbacks_served,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("source_url", &self.source_url)
            .field("state", &self.state())
            .finish()
    }
}

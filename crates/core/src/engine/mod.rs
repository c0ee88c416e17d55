//! Negotiation engine seam.
//!
//! The bridge never speaks ICE, DTLS, SRTP or SDP itself. It drives a
//! [`NegotiationEngine`] that hands out [`PeerConnection`]s, and reacts to
//! the connection-state notifications those peers emit.
//!
//! ## Offer/answer flow
//!
//! ```text
//! browser                  bridge                       engine
//!   │ POST /offer {sdp}      │                            │
//!   │───────────────────────►│ new_connection()           │
//!   │                        │───────────────────────────►│
//!   │                        │ on_state_change(observer)  │
//!   │                        │ attach_video(relay)        │
//!   │                        │ negotiate(offer)           │
//!   │                        │───────────────────────────►│ set remote, answer,
//!   │                        │◄───────────────────────────│ gather candidates
//!   │◄───────────────────────│ {sdp, type: "answer"}      │
//!   │        media           │        relay.recv()        │
//!   │◄══════════════════════════════════════════════════════│
//! ```
//!
//! [`webrtc`] implements the seam on top of the `webrtc` crate.

pub mod encoder;
pub mod webrtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::media::FrameRelay;

/// Transport connection state, as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// `failed` and `closed` end the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// SDP message type (the `type` field of a session description).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An SDP offer or answer, opaque to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpType,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SdpType::Offer,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SdpType::Answer,
        }
    }
}

/// Callback invoked for every connection-state change, in detection order.
pub type StateObserver = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// One transport connection to one browser.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Register `observer` for connection-state changes.
    fn on_state_change(&self, observer: StateObserver);

    /// Attach `relay` as the outbound video producer.
    ///
    /// The engine pulls frames by calling [`FrameRelay::recv`] repeatedly.
    /// When `recv` fails with [`StreamFailure`](crate::BridgeError::StreamFailure)
    /// the engine must treat the track as failed and report a terminal state,
    /// which is how source failure reaches session cleanup.
    async fn attach_video(&self, relay: Arc<FrameRelay>) -> Result<()>;

    /// Apply the remote offer and return the local answer.
    async fn negotiate(&self, offer: SessionDescription) -> Result<SessionDescription>;

    /// Stop and detach all outbound and inbound tracks.
    async fn stop_tracks(&self) -> Result<()>;

    /// Close the underlying transport connection.
    async fn close(&self) -> Result<()>;
}

/// Factory for [`PeerConnection`]s.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn new_connection(&self) -> Result<Arc<dyn PeerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
    }

    #[test]
    fn description_wire_format() {
        let answer = SessionDescription::answer("v=0\r\n");
        let json = serde_json::to_value(&answer).unwrap();
        assert_eq!(json, serde_json::json!({"sdp": "v=0\r\n", "type": "answer"}));

        let offer: SessionDescription =
            serde_json::from_str(r#"{"sdp":"v=0","type":"offer"}"#).unwrap();
        assert_eq!(offer.kind, SdpType::Offer);
    }
}

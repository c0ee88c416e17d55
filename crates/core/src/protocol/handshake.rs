use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::runtime::Handle;

use super::offer::OfferRequest;
use crate::engine::{NegotiationEngine, SessionDescription};
use crate::error::{BridgeError, Result};
use crate::media::{DecoderFactory, FrameRelay, MediaSourceBinding, RelayConfig, SourceOptions};
use crate::session::{Cleanup, Session, SessionId, SessionRegistry, SessionState};

/// Turns one offer into one running session.
///
/// Any failure after the session exists runs [`Cleanup`] for it before the
/// error is returned, so a failed offer never leaves a registered session,
/// an open source or a live connection behind.
#[derive(Clone)]
pub struct SignalingHandshake {
    engine: Arc<dyn NegotiationEngine>,
    decoders: Arc<dyn DecoderFactory>,
    registry: SessionRegistry,
    cleanup: Cleanup,
    source: SourceOptions,
    relay: RelayConfig,
}

impl SignalingHandshake {
    pub fn new(
        engine: Arc<dyn NegotiationEngine>,
        decoders: Arc<dyn DecoderFactory>,
        registry: SessionRegistry,
    ) -> Self {
        Self {
            engine,
            decoders,
            cleanup: Cleanup::new(registry.clone()),
            registry,
            source: SourceOptions::default(),
            relay: RelayConfig::default(),
        }
    }

    pub fn source_options(mut self, options: SourceOptions) -> Self {
        self.source = options;
        self
    }

    pub fn relay_config(mut self, config: RelayConfig) -> Self {
        self.relay = config;
        self
    }

    pub fn cleanup(&self) -> &Cleanup {
        &self.cleanup
    }

    pub async fn handle_offer(&self, request: OfferRequest) -> Result<SessionDescription> {
        let offer = request.validate()?;

        if let Some(connection) = &offer.connection_id {
            if let Some(previous) = self.registry.lookup_connection(connection) {
                tracing::info!(
                    session_id = %previous.id(),
                    connection_id = %connection,
                    "replacing existing session"
                );
                self.cleanup.close(&previous).await;
                // another trigger may own that teardown
                previous.wait_closed().await;
            }
        }

        let peer = self.engine.new_connection().await.map_err(as_negotiation)?;
        let session = Session::new(SessionId::generate(), &offer.source_url, peer.clone())
            .with_connection_id(offer.connection_id.clone());
        let session = Arc::new(session);
        self.observe(&session);

        tracing::debug!(session_id = %session.id(), url = %offer.source_url, "negotiating session");

        let opened =
            MediaSourceBinding::open(self.decoders.as_ref(), &offer.source_url, &self.source).await;
        let binding = match opened {
            Ok(binding) => Arc::new(binding),
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id(),
                    url = %offer.source_url,
                    error = %e,
                    "source unavailable"
                );
                self.cleanup.close(&session).await;
                return Err(e);
            }
        };

        let relay = Arc::new(FrameRelay::new(binding.clone(), self.relay.clone()));
        if !session.attach_media(binding, relay.clone()) {
            if let Err(e) = relay.close().await {
                tracing::warn!(session_id = %session.id(), error = %e, "failed to release source");
            }
            return Err(closed_during_setup());
        }

        if let Some(displaced) = self.registry.add(session.clone()) {
            self.cleanup.close(&displaced).await;
        }
        // a teardown that started before registration must not leave us behind
        if session.is_closing() {
            self.registry.remove_session(&session);
            return Err(closed_during_setup());
        }

        let negotiated = match peer.attach_video(relay).await {
            Ok(()) => peer.negotiate(offer.offer).await,
            Err(e) => Err(e),
        };
        let answer = match negotiated {
            Ok(answer) => answer,
            Err(e) => {
                let e = as_negotiation(e);
                tracing::warn!(session_id = %session.id(), error = %e, "negotiation failed");
                self.cleanup.close(&session).await;
                return Err(e);
            }
        };

        if !session.advance(SessionState::Active) {
            return Err(closed_during_setup());
        }

        tracing::info!(
            session_id = %session.id(),
            url = %offer.source_url,
            total_sessions = self.registry.len(),
            "session active"
        );
        Ok(answer)
    }

    /// Run cleanup once the connection reaches a terminal state.
    fn observe(&self, session: &Arc<Session>) {
        let weak = Arc::downgrade(session);
        let cleanup = self.cleanup.clone();
        let fired = AtomicBool::new(false);
        let runtime = Handle::current();

        session.peer().on_state_change(Arc::new(move |state| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            tracing::debug!(session_id = %session.id(), %state, "connection state changed");

            if state.is_terminal() && !fired.swap(true, Ordering::SeqCst) {
                let cleanup = cleanup.clone();
                runtime.spawn(async move {
                    cleanup.close(&session).await;
                });
            }
        }));
    }
}

fn as_negotiation(e: BridgeError) -> BridgeError {
    match e {
        BridgeError::Negotiation(_) => e,
        other => BridgeError::Negotiation(other.to_string()),
    }
}

fn closed_during_setup() -> BridgeError {
    BridgeError::Negotiation("session closed during setup".into())
}

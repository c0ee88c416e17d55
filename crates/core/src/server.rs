use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;

use crate::engine::{NegotiationEngine, SessionDescription};
use crate::error::{BridgeError, Result};
use crate::media::{DecoderFactory, RelayConfig, SourceOptions};
use crate::protocol::{OfferRequest, SignalingHandshake};
use crate::session::{SessionInfo, SessionRegistry, Teardown};

/// Gateway-level configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address.
    pub bind_addr: String,
    /// Connection policy for every source opened by the gateway.
    pub source: SourceOptions,
    /// Retry policy for every session's frame relay.
    pub relay: RelayConfig,
    /// Upper bound for draining sessions on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            source: SourceOptions::default(),
            relay: RelayConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

struct Inner {
    config: ServerConfig,
    registry: SessionRegistry,
    handshake: SignalingHandshake,
}

/// RTSP to WebRTC gateway.
///
/// Owns the session registry and wires the handshake and cleanup to the
/// injected engine and decoder backend. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    pub fn new(
        config: ServerConfig,
        engine: Arc<dyn NegotiationEngine>,
        decoders: Arc<dyn DecoderFactory>,
    ) -> Self {
        let registry = SessionRegistry::new();
        let handshake = SignalingHandshake::new(engine, decoders, registry.clone())
            .source_options(config.source.clone())
            .relay_config(config.relay.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                handshake,
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub async fn handle_offer(&self, request: OfferRequest) -> Result<SessionDescription> {
        self.inner.handshake.handle_offer(request).await
    }

    /// Registered sessions, oldest first.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self
            .inner
            .registry
            .snapshot()
            .iter()
            .map(|s| s.info())
            .collect();
        sessions.sort_by(|a, b| {
            b.age_secs
                .cmp(&a.age_secs)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        sessions
    }

    /// Stop a session on client request.
    pub async fn stop_session(&self, id: &str) -> Result<Teardown> {
        let session = self
            .inner
            .registry
            .lookup(id)
            .ok_or_else(|| BridgeError::SessionNotFound(id.to_string()))?;
        tracing::info!(session_id = %id, "stop requested");
        Ok(self.inner.handshake.cleanup().close(&session).await)
    }

    pub fn router(&self) -> Router {
        crate::http::router(self.clone())
    }

    /// Serve HTTP on `listener` until `shutdown` resolves, then drain sessions.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "gateway listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.shutdown().await;
        Ok(())
    }

    /// Close every session, bounded by the shutdown timeout.
    ///
    /// Returns the number of sessions drained.
    pub async fn shutdown(&self) -> usize {
        let timeout = self.inner.config.shutdown_timeout;
        tracing::info!(sessions = self.inner.registry.len(), "shutting down");

        match tokio::time::timeout(timeout, self.inner.handshake.cleanup().close_all()).await {
            Ok(count) => count,
            Err(_) => {
                let abandoned = self.inner.registry.clear();
                tracing::warn!(
                    abandoned,
                    timeout_ms = timeout.as_millis() as u64,
                    "shutdown drain timed out"
                );
                abandoned
            }
        }
    }
}

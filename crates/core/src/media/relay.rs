//! Outbound video producer for one session.
//!
//! The transport pulls pictures from a [`FrameRelay`] at its own pace. Each
//! pull reads the next picture from the session's [`MediaSourceBinding`],
//! retrying isolated failures:
//!
//! ```text
//! read ──ok──► normalize ──► cache as last good ──► deliver
//!  │
//!  err ──► retries < max ──► sleep(backoff) ──► read
//!           │
//!           exhausted ──► last good frame not yet served? ──► deliver it once
//!                          │
//!                          else ──► StreamFailure
//! ```
//!
//! A successful read resets the retry counter and re-arms the fallback.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Frame, MediaSourceBinding};
use crate::error::{BridgeError, Result};

/// Retry policy for [`FrameRelay::recv`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Consecutive failed reads tolerated before giving up.
    pub max_retries: u32,
    /// Fixed delay between a failed read and the next attempt.
    pub backoff: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Counters exposed for session listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Frames handed to the transport, fallbacks included.
    pub frames_delivered: u64,
    /// Times the cached frame stood in for a failed read.
    pub fallbacks_served: u64,
}

#[derive(Default)]
struct RelayState {
    last_good: Option<Frame>,
    retries: u32,
    fallback_served: bool,
}

pub struct FrameRelay {
    binding: Arc<MediaSourceBinding>,
    config: RelayConfig,
    state: Mutex<RelayState>,
    cancel: CancellationToken,
    frames_delivered: AtomicU64,
    fallbacks_served: AtomicU64,
}

impl FrameRelay {
    pub fn new(binding: Arc<MediaSourceBinding>, config: RelayConfig) -> Self {
        Self {
            binding,
            config: RelayConfig {
                max_retries: config.max_retries.max(1),
                ..config
            },
            state: Mutex::new(RelayState::default()),
            cancel: CancellationToken::new(),
            frames_delivered: AtomicU64::new(0),
            fallbacks_served: AtomicU64::new(0),
        }
    }

    pub fn binding(&self) -> &Arc<MediaSourceBinding> {
        &self.binding
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            fallbacks_served: self.fallbacks_served.load(Ordering::Relaxed),
        }
    }

    /// Produce the next picture for the transport.
    ///
    /// Fails with [`StreamFailure`](BridgeError::StreamFailure) once the
    /// retry budget is spent and no fallback is left, and with
    /// [`RelayClosed`](BridgeError::RelayClosed) if [`close`](Self::close)
    /// runs while this call is pending.
    pub async fn recv(&self) -> Result<Frame> {
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(BridgeError::RelayClosed),
                result = self.binding.read() => result,
            };

            match result {
                Ok(frame) => {
                    let frame = frame.normalized();
                    {
                        let mut state = self.state.lock();
                        state.last_good = Some(frame.clone());
                        state.retries = 0;
                        state.fallback_served = false;
                    }
                    self.frames_delivered.fetch_add(1, Ordering::Relaxed);
                    return Ok(frame);
                }
                Err(e) => {
                    let (attempts, fallback) = {
                        let mut state = self.state.lock();
                        state.retries = state.retries.saturating_add(1);
                        let exhausted = state.retries >= self.config.max_retries;
                        let fallback = if exhausted && !state.fallback_served {
                            state.fallback_served = state.last_good.is_some();
                            state.last_good.clone()
                        } else {
                            None
                        };
                        (exhausted.then_some(state.retries), fallback)
                    };

                    let attempts = match attempts {
                        Some(attempts) => attempts,
                        None => {
                            tracing::debug!(
                                url = %self.binding.url(),
                                error = %e,
                                "read failed, retrying"
                            );
                            tokio::select! {
                                biased;
                                _ = self.cancel.cancelled() => return Err(BridgeError::RelayClosed),
                                _ = tokio::time::sleep(self.config.backoff) => {}
                            }
                            continue;
                        }
                    };

                    if let Some(frame) = fallback {
                        tracing::warn!(
                            url = %self.binding.url(),
                            attempts,
                            "serving last good frame"
                        );
                        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
                        self.fallbacks_served.fetch_add(1, Ordering::Relaxed);
                        return Ok(frame);
                    }

                    tracing::warn!(
                        url = %self.binding.url(),
                        attempts,
                        error = %e,
                        "stream failed"
                    );
                    return Err(BridgeError::StreamFailure {
                        attempts,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Stop producing frames and release the source. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.state.lock().last_good = None;
        self.binding.close().await
    }
}

impl std::fmt::Debug for FrameRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRelay")
            .field("binding", &self.binding)
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

//! Error types for the bridge library.

/// Errors that can occur while bridging a source to a client session.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Signaling**: [`Validation`](Self::Validation) for a malformed offer
///   (nothing allocated), [`Negotiation`](Self::Negotiation) when the engine
///   rejects the offer/answer exchange.
/// - **Source**: [`Connect`](Self::Connect) when the source is unreachable or
///   carries no usable video, [`StreamEnded`](Self::StreamEnded) when a single
///   read fails.
/// - **Relay**: [`StreamFailure`](Self::StreamFailure) once the retry budget is
///   exhausted with no fallback frame, [`RelayClosed`](Self::RelayClosed) when
///   the relay is disposed while a read is pending.
/// - **Teardown**: [`Cleanup`](Self::Cleanup) when one teardown step fails.
///   Always logged, never escalated.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The negotiation request is incomplete or malformed (HTTP 400).
    #[error("{0}")]
    Validation(String),

    /// The source could not be opened or exposes no usable video.
    #[error("failed to open source: {0}")]
    Connect(String),

    /// The negotiation engine rejected the offer/answer exchange.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The source stopped producing frames (EOF, decoder exit, read timeout).
    #[error("stream ended: {0}")]
    StreamEnded(String),

    /// Consecutive reads failed past the retry budget and no fallback frame
    /// was available.
    #[error("stream failed after {attempts} attempts: {reason}")]
    StreamFailure { attempts: u32, reason: String },

    /// The relay (or its binding) was closed; no further frames will follow.
    #[error("relay closed")]
    RelayClosed,

    /// A decoded buffer does not match the size implied by its format.
    #[error("invalid frame: expected {expected} bytes, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },

    /// A single teardown step failed.
    #[error("cleanup step `{step}` failed: {reason}")]
    Cleanup { step: &'static str, reason: String },

    /// No session with the given ID exists in the [`SessionRegistry`](crate::session::SessionRegistry).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Underlying I/O error (subprocess pipes, sockets).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for `Result<T, BridgeError>`.
pub type Result<T> = std::result::Result<T, BridgeError>;

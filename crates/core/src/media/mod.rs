//! Media sources and the per-session frame relay.
//!
//! ## Pipeline
//!
//! ```text
//!  RTSP camera ──► Decoder ──► MediaSourceBinding ──► FrameRelay ──► outbound track
//!                (ffmpeg)     (open / read / close)   (retry, fallback,
//!                                                      pixel normalization)
//! ```
//!
//! - [`Decoder`] / [`DecoderFactory`] are the seam to the external decoding
//!   backend. [`ffmpeg`] provides the default implementation, running
//!   `ffmpeg` as a subprocess that writes raw pictures to stdout.
//! - [`MediaSourceBinding`] owns one decoder instance and enforces the
//!   connect timeout, per-read timeout and idempotent close.
//! - [`FrameRelay`] is what the transport pulls from. It hides isolated
//!   decode hiccups behind a bounded retry and a one-shot fallback frame,
//!   and surfaces sustained failure as [`StreamFailure`](crate::BridgeError::StreamFailure).

pub mod ffmpeg;
pub mod frame;
pub mod relay;
pub mod source;

use async_trait::async_trait;

use crate::error::Result;
pub use frame::{Frame, PixelFormat};
pub use relay::{FrameRelay, RelayConfig, RelayStats};
pub use source::{MediaSourceBinding, RtspTransport, SourceOptions};

/// One running decode session for a single source.
///
/// Implementations are owned by exactly one [`MediaSourceBinding`] and are
/// never read from more than one task at a time.
#[async_trait]
pub trait Decoder: Send {
    /// Wait for the next decoded picture.
    ///
    /// Returns [`StreamEnded`](crate::BridgeError::StreamEnded) when the
    /// stream ends or errors. Must never return an empty frame.
    async fn read_frame(&mut self) -> Result<Frame>;

    /// Release the decoder and its buffers. Called at most once.
    async fn shutdown(&mut self) -> Result<()>;
}

/// Opens [`Decoder`]s for source URLs.
#[async_trait]
pub trait DecoderFactory: Send + Sync {
    /// Start decoding `url` with the given connection policy.
    ///
    /// Fails with [`Connect`](crate::BridgeError::Connect) if the source is
    /// unreachable or carries no usable video. The caller bounds this call
    /// with [`SourceOptions::connect_timeout`].
    async fn open(&self, url: &str, options: &SourceOptions) -> Result<Box<dyn Decoder>>;
}

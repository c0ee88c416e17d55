pub mod engine;
pub mod error;
pub mod http;
pub mod media;
pub mod protocol;
pub mod server;
pub mod session;

#[cfg(test)]
pub(crate) mod testutil;

pub use engine::webrtc::{WebRtcConfig, WebRtcEngine};
pub use engine::{ConnectionState, NegotiationEngine, PeerConnection, SessionDescription};
pub use error::{BridgeError, Result};
pub use media::ffmpeg::FfmpegDecoderFactory;
pub use media::{DecoderFactory, FrameRelay, MediaSourceBinding, RelayConfig, SourceOptions};
pub use protocol::{OfferRequest, SignalingHandshake};
pub use server::{Gateway, ServerConfig};
pub use session::{Cleanup, Session, SessionId, SessionInfo, SessionRegistry, SessionState};

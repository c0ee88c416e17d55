//! Browser-facing signaling.
//!
//! A browser asks for a source by posting a WebRTC offer together with the
//! source URL. The bridge opens the source, negotiates the transport and
//! replies with its answer in the same request, so there is no separate
//! candidate exchange (all ICE candidates are embedded in the answer).
//!
//! ## Offer payload
//!
//! ```text
//! POST /offer
//! {
//!   "source_url": "rtsp://10.0.0.5:554/stream",   (alias: "rtsp_url")
//!   "sdp": "v=0\r\n...",
//!   "type": "offer",
//!   "connection_id": "tab-1"                      (optional)
//! }
//! ```
//!
//! | Field | Required | Meaning |
//! |-------|----------|---------|
//! | `source_url` | yes | RTSP (or any decoder-supported) URL to bridge |
//! | `sdp` | yes | Browser offer |
//! | `type` | yes | Must be `"offer"` |
//! | `connection_id` | no | Client-chosen connection name; a repeat replaces that connection's earlier session |

pub mod handshake;
pub mod offer;

pub use handshake::SignalingHandshake;
pub use offer::{ErrorBody, OfferRequest, ValidOffer};

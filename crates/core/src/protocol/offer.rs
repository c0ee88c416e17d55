use serde::{Deserialize, Serialize};

use crate::engine::SessionDescription;
use crate::error::{BridgeError, Result};

/// Negotiation request as posted by the browser.
///
/// Every field is optional at the wire level so a missing field surfaces as
/// a specific validation message rather than a generic decode error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OfferRequest {
    #[serde(default, alias = "rtsp_url")]
    pub source_url: Option<String>,
    #[serde(default)]
    pub sdp: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
}

/// An [`OfferRequest`] that passed validation.
#[derive(Debug, Clone)]
pub struct ValidOffer {
    pub source_url: String,
    pub offer: SessionDescription,
    /// Client-chosen connection name. Never used as a session ID.
    pub connection_id: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

impl OfferRequest {
    pub fn new(source_url: &str, sdp: &str) -> Self {
        Self {
            source_url: Some(source_url.to_string()),
            sdp: Some(sdp.to_string()),
            kind: Some("offer".to_string()),
            connection_id: None,
        }
    }

    pub fn connection_id(mut self, id: &str) -> Self {
        self.connection_id = Some(id.to_string());
        self
    }

    pub fn validate(self) -> Result<ValidOffer> {
        let source_url = non_blank(self.source_url)
            .ok_or_else(|| BridgeError::Validation("source URL is required".into()))?;

        // the SDP itself is opaque; only its presence is checked
        let sdp = self
            .sdp
            .filter(|sdp| !sdp.trim().is_empty())
            .ok_or_else(|| BridgeError::Validation("offer SDP is required".into()))?;

        match non_blank(self.kind).as_deref() {
            Some("offer") => {}
            Some(other) => {
                return Err(BridgeError::Validation(format!(
                    "expected type \"offer\", got \"{other}\""
                )));
            }
            None => return Err(BridgeError::Validation("offer type is required".into())),
        }

        Ok(ValidOffer {
            source_url,
            offer: SessionDescription::offer(sdp),
            connection_id: non_blank(self.connection_id),
        })
    }
}

/// JSON error body: `{"error": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

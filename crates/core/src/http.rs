//! HTTP surface of the gateway.
//!
//! | Method | Path | Success | Errors |
//! |--------|------|---------|--------|
//! | `POST` | `/offer` | 200 `{sdp, type: "answer"}` | 400 malformed offer, 500 source or negotiation failure |
//! | `GET` | `/sessions` | 200 `[SessionInfo]` | |
//! | `DELETE` | `/sessions/{id}` | 204 | 404 unknown session |
//!
//! Errors are JSON `{"error": "..."}`. CORS is open to any origin.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use bytes::Bytes;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::engine::SessionDescription;
use crate::error::BridgeError;
use crate::protocol::{ErrorBody, OfferRequest};
use crate::server::Gateway;
use crate::session::SessionInfo;

pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/offer", post(offer))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", delete(stop_session))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(gateway)
}

impl BridgeError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// `POST /offer`
async fn offer(
    State(gateway): State<Gateway>,
    body: Bytes,
) -> Result<Json<SessionDescription>, BridgeError> {
    // parsed by hand so every malformed body maps to a 400 with our error shape
    let request: OfferRequest = serde_json::from_slice(&body)
        .map_err(|e| BridgeError::Validation(format!("invalid offer payload: {e}")))?;
    let answer = gateway.handle_offer(request).await?;
    Ok(Json(answer))
}

/// `GET /sessions`
async fn list_sessions(State(gateway): State<Gateway>) -> Json<Vec<SessionInfo>> {
    Json(gateway.sessions())
}

/// `DELETE /sessions/{id}`
async fn stop_session(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> Result<StatusCode, BridgeError> {
    gateway.stop_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            BridgeError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BridgeError::SessionNotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            BridgeError::Connect("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            BridgeError::Negotiation("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

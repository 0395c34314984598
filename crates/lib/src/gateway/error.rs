//! Gateway failure taxonomy and its mapping onto HTTP responses.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no client is connected to tunnel '{0}'; start `backhaul connect` next to your server and retry")]
    ConnectionUnavailable(String),
    #[error("timed out waiting for response headers from the tunnel client")]
    Timeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("tunnel client reported an error: {0}")]
    Remote(String),
    #[error("malformed response from tunnel client: {0}")]
    Malformed(String),
    #[error("tunnel actor is not running")]
    ActorGone,
}

impl GatewayError {
    /// Status used when the failure happens before any response bytes were produced.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::ConnectionUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::ConnectionClosed
            | GatewayError::Remote(_)
            | GatewayError::Malformed(_) => StatusCode::BAD_GATEWAY,
            GatewayError::ActorGone => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (
            self.status(),
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}

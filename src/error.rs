//! Relay error taxonomy and its HTTP mapping.
//!
//! Only the variants raised before the response starts (authentication,
//! access, misconfiguration, invalid input) become status codes. Everything
//! else is reported in-band as a terminal `error` event.

use std::time::Duration;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::relay::RequestId;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Unauthorized")]
    AuthenticationMissing,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Server misconfigured: {0}")]
    UpstreamMisconfigured(String),

    #[error("Bad request: {0}")]
    InvalidRequest(String),

    #[error("Upstream request timed out after {}s", .0.as_secs_f32())]
    UpstreamTimeout(Duration),

    /// Non-success status or unusable body; carries the upstream's own message.
    #[error("{message}")]
    UpstreamProtocol { status: u16, message: String },

    #[error("Upstream connection failed: {0}")]
    UpstreamTransport(#[from] reqwest::Error),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::AuthenticationMissing => StatusCode::UNAUTHORIZED,
            RelayError::AccessDenied(_) => StatusCode::FORBIDDEN,
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::UpstreamMisconfigured(_)
            | RelayError::UpstreamTimeout(_)
            | RelayError::UpstreamProtocol { .. }
            | RelayError::UpstreamTransport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// A relay error bound to the request it ended, so the response carries the
/// correlation header.
#[derive(Debug)]
pub struct RequestFailure {
    pub request_id: RequestId,
    pub error: RelayError,
}

impl IntoResponse for RequestFailure {
    fn into_response(self) -> Response {
        let status = self.error.status();
        // Misconfiguration details stay in the server log.
        let message = match &self.error {
            RelayError::UpstreamMisconfigured(_) => "Server misconfigured".to_string(),
            other => other.to_string(),
        };

        let mut response = (status, axum::Json(ErrorBody { error: message })).into_response();
        if let Ok(value) = HeaderValue::from_str(self.request_id.as_str()) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
}

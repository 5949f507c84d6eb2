use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::hawk::AuthError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("signer {id:?} does not support {capability} signing")]
    CapabilityUnsupported { id: String, capability: &'static str },
    #[error("signer {id:?} failed to produce a signature")]
    Signer {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Trait implementation to convert this error into an axum http response
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            auth_error @ ApiError::Auth(_) => {
                tracing::warn!(error = %auth_error, "request rejected");
                (StatusCode::UNAUTHORIZED, auth_error.to_string()).into_response()
            }
            bad_request_error @ ApiError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, bad_request_error.to_string()).into_response()
            }
            capability_error @ ApiError::CapabilityUnsupported { .. } => {
                (StatusCode::FORBIDDEN, capability_error.to_string()).into_response()
            }
            ApiError::Signer { id, source } => {
                tracing::error!(signer = %id, error = ?source, "signer failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("signer {id:?} failed to produce a signature"),
                )
                    .into_response()
            }
            ApiError::Unexpected(report) => {
                tracing::error!(error = ?report, "unexpected failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Something wrong happened.",
                )
                    .into_response()
            }
        }
    }
}

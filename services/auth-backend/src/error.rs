//! HTTP error responses
//!
//! Request-scoped failures become JSON responses here; no handler panics on
//! them. Credential failures never say why: every one is a bare 401.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorised")]
    Unauthenticated,

    /// A request field the caller can fix (e.g. an unknown provider)
    #[error("{0}")]
    Field(String),

    /// A request that cannot succeed as sent (bad state, provider refusal)
    #[error("{0}")]
    General(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl From<session_manager::Error> for ApiError {
    fn from(err: session_manager::Error) -> Self {
        use thirdparty::Error as SignIn;

        match err {
            session_manager::Error::Unauthenticated => ApiError::Unauthenticated,
            session_manager::Error::SignIn(SignIn::UnknownProvider(id)) => {
                ApiError::Field(format!("unknown provider: {id}"))
            }
            session_manager::Error::SignIn(SignIn::InvalidState(msg)) => {
                ApiError::General(format!("invalid sign-in attempt: {msg}"))
            }
            session_manager::Error::SignIn(SignIn::ProviderRejected(detail)) => {
                info!(error = %detail, "provider rejected sign-in");
                ApiError::General("provider rejected sign-in".into())
            }
            session_manager::Error::SignIn(SignIn::ProviderUnavailable(detail)) => {
                warn!(error = %detail, "provider unavailable");
                ApiError::Unavailable("provider unavailable, try again later".into())
            }
            session_manager::Error::SignIn(other) => ApiError::Internal(other.to_string()),
            session_manager::Error::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                json!({ "message": "unauthorised" }),
            ),
            ApiError::Field(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "status": "FIELD_ERROR", "message": msg }),
            ),
            ApiError::General(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "status": "GENERAL_ERROR", "message": msg }),
            ),
            ApiError::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "status": "GENERAL_ERROR", "message": msg }),
            ),
            ApiError::Internal(detail) => {
                error!(error = %detail, "internal error while handling request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "message": "internal error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

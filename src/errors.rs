use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Crate-wide error taxonomy. Library code returns `Result<T, OrchestratorError>`
/// and propagates with `?`; only the HTTP handlers convert this into a response.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("upstream down: {0}")]
    UpstreamDown(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// Load-time configuration errors. Fatal at startup; never reaches HTTP.
    #[error("config error: {0}")]
    Config(String),

    /// Ledger failures are logged and dropped, never surfaced to clients.
    #[error("ledger error: {0}")]
    Ledger(String),
}

impl OrchestratorError {
    fn status_code(&self) -> StatusCode {
        match self {
            OrchestratorError::BadRequest(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::UpstreamDown(_) => StatusCode::BAD_GATEWAY,
            OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if matches!(status, StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }
        (status, Json(ErrorBody { detail: self.to_string() })).into_response()
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

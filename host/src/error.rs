use axum::{http::StatusCode, response::IntoResponse};
use utoipa::ToSchema;

use oscar_engine::OrchestratorError;
use oscar_lib::BuildError;
use oscar_store::{StoreError, VaultError};

/// The standardized error returned by the oscar host.
#[derive(thiserror::Error, Debug, ToSchema)]
pub enum HostError {
    /// For requests the command builder or classifier refuses.
    #[error("validation failed: {0}")]
    Validation(String),

    /// For executions refused by the safety gate.
    #[error("execution blocked: {0}")]
    Blocked(String),

    /// For lookups of records or connections that do not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// For submissions while the queue is at capacity.
    #[error("execution queue is full, please try again later")]
    QueueFull,

    /// For operations attempted from the wrong lifecycle state.
    #[error("{0}")]
    InvalidState(String),

    /// For requests arriving during shutdown.
    #[error("orchestrator is shutting down")]
    Unavailable,

    /// For credential vault failures.
    #[error("credential error: {0}")]
    #[schema(value_type = Value)]
    Vault(#[from] VaultError),

    /// For I/O errors.
    #[error("there was a I/O error: {0}")]
    #[schema(value_type = Value)]
    Io(#[from] std::io::Error),

    /// For Serde errors.
    #[error("there was a deserialization error: {0}")]
    #[schema(value_type = Value)]
    Serde(#[from] serde_json::Error),

    /// A catch-all error for any other error type.
    #[error("there was an unexpected error: {0}")]
    #[schema(value_type = Value)]
    Anyhow(#[from] anyhow::Error),
}

impl From<BuildError> for HostError {
    fn from(err: BuildError) -> Self {
        HostError::Validation(err.to_string())
    }
}

impl From<StoreError> for HostError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RecordNotFound(id) => HostError::NotFound(format!("execution {id}")),
            StoreError::ConnectionNotFound(id) => HostError::NotFound(format!("connection {id}")),
            other => HostError::Anyhow(anyhow::anyhow!(other)),
        }
    }
}

impl From<OrchestratorError> for HostError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::QueueFull(_) => HostError::QueueFull,
            OrchestratorError::ShuttingDown => HostError::Unavailable,
            OrchestratorError::InvalidState { .. } => HostError::InvalidState(err.to_string()),
            OrchestratorError::Store(store) => store.into(),
            OrchestratorError::ShutdownTimeout => HostError::Anyhow(anyhow::anyhow!(err)),
        }
    }
}

impl IntoResponse for HostError {
    fn into_response(self) -> axum::response::Response {
        let (status, error) = match &self {
            HostError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            HostError::Blocked(_) => (StatusCode::FORBIDDEN, "blocked"),
            HostError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            HostError::QueueFull => (StatusCode::TOO_MANY_REQUESTS, "queue_full"),
            HostError::InvalidState(_) => (StatusCode::CONFLICT, "invalid_state"),
            HostError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            HostError::Vault(_) => (StatusCode::INTERNAL_SERVER_ERROR, "vault_error"),
            HostError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
            HostError::Serde(_) => (StatusCode::BAD_REQUEST, "serde_error"),
            HostError::Anyhow(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let body = axum::Json(serde_json::json!({
            "status": "error",
            "error": error,
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// A type alias for the standardized result type returned by the oscar host.
pub type HostResult<T> = Result<T, HostError>;

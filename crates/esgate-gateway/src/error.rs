//! Gateway runtime error types

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use esgate_kernel::pipeline::{PipelineError, ProcessorError};
use serde_json::json;
use thiserror::Error;

/// Runtime-level errors: listener lifecycle and request processing.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind '{endpoint}': {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connector '{0}' is already running")]
    AlreadyRunning(String),

    #[error("connector '{0}' is not running")]
    NotRunning(String),

    #[error("connector '{0}' did not drain before the shutdown deadline")]
    ShutdownTimeout(String),

    #[error(transparent)]
    Build(#[from] PipelineError),

    #[error(transparent)]
    Processing(#[from] ProcessorError),

    #[error("backend client error: {0}")]
    Client(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            GatewayError::Processing(e) => (
                StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                match e {
                    ProcessorError::InvalidInput { .. } => "INVALID_INPUT",
                    ProcessorError::Backend(_) => "BACKEND_ERROR",
                    ProcessorError::Panicked(_) => "PROCESSING_PANICKED",
                    _ => "PROCESSING_FAILED",
                },
            ),
            GatewayError::NotRunning(_) | GatewayError::ShutdownTimeout(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    /// Status and JSON body returned to a caller whose request failed.
    pub fn to_reply(&self) -> (u16, Vec<u8>) {
        let (status, code) = self.parts();
        let body = json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        });
        (status.as_u16(), body.to_string().into_bytes())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

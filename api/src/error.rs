use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use motorchat_core::error::{self, ApiError};

use crate::backend::GenerationError;

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        docs_hint: Option<String>,
    },
    /// Missing, malformed or unverifiable bearer token (401)
    Unauthorized {
        message: String,
        docs_hint: Option<String>,
    },
    /// Completion backend failed (502). The cause is logged, never returned.
    GenerationFailed(GenerationError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();

        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    message,
                    field,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::Unauthorized { message, docs_hint } => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    error: error::codes::UNAUTHORIZED.to_string(),
                    message,
                    field: None,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::GenerationFailed(err) => {
                tracing::error!(request_id = %request_id, error = %err, "text generation failed");
                (
                    StatusCode::BAD_GATEWAY,
                    ApiError {
                        error: error::codes::GENERATION_FAILED.to_string(),
                        message: "Sorry, the assistant could not produce a reply. Please try again."
                            .to_string(),
                        field: None,
                        request_id,
                        docs_hint: None,
                    },
                )
            }
        };

        (status, Json(api_error)).into_response()
    }
}

impl From<GenerationError> for AppError {
    fn from(err: GenerationError) -> Self {
        AppError::GenerationFailed(err)
    }
}

use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use motorchat_core::chat::{ChatRequest, ChatResponse, QuotaExceededResponse};

use crate::auth::AuthenticatedUser;
use crate::error::AppError;
use crate::extract::AppJson;
use crate::ledger::{ExchangeOutcome, SystemClock};
use crate::state::AppState;

/// Longest accepted user message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/chat", post(chat))
}

/// POST /api/chat — send one message and receive the assistant's reply
#[utoipa::path(
    post,
    path = "/api/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Assistant reply with remaining quota", body = ChatResponse),
        (status = 400, description = "Empty or oversized message", body = motorchat_core::error::ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = motorchat_core::error::ApiError),
        (status = 429, description = "Quota for the current window used up", body = QuotaExceededResponse),
        (status = 502, description = "Completion backend failed", body = motorchat_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "chat"
)]
pub async fn chat(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    AppJson(req): AppJson<ChatRequest>,
) -> Result<Response, AppError> {
    validate_message(&req.message)?;

    let outcome = state
        .ledger
        .exchange(&user.identity_id, req.message, SystemClock)
        .await
        .inspect_err(|err| {
            tracing::warn!(subject = %user.subject(), error = %err, "exchange failed");
        })?;

    Ok(match outcome {
        ExchangeOutcome::Reply {
            message,
            remaining_requests,
            reset_time,
        } => Json(ChatResponse {
            message,
            remaining_requests,
            reset_time,
        })
        .into_response(),
        ExchangeOutcome::QuotaExceeded { reset_time } => {
            quota_exceeded(reset_time, Utc::now(), state.display_tz)
        }
    })
}

fn validate_message(message: &str) -> Result<(), AppError> {
    if message.trim().is_empty() {
        return Err(AppError::Validation {
            message: "message must not be empty".to_string(),
            field: Some("message".to_string()),
            docs_hint: None,
        });
    }
    let chars = message.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(AppError::Validation {
            message: format!("message is {chars} characters long; the limit is {MAX_MESSAGE_CHARS}"),
            field: Some("message".to_string()),
            docs_hint: Some("Split long descriptions into several messages.".to_string()),
        });
    }
    Ok(())
}

fn quota_exceeded(reset_time: DateTime<Utc>, now: DateTime<Utc>, tz: Tz) -> Response {
    let local = reset_time.with_timezone(&tz).format("%d.%m.%Y %H:%M %Z");
    let body = QuotaExceededResponse {
        error: format!("You have reached your usage limit. Please wait until {local}."),
        reset_time,
    };
    let retry_after = (reset_time - now).num_seconds().max(0);

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

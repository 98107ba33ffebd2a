//! JSON extractor that turns axum rejections into structured `AppError` responses.
//!
//! Use `AppJson<T>` instead of `axum::Json<T>` in handler signatures so a bad
//! body yields a JSON 400 rather than axum's plain-text 4xx.

use axum::{
    Json,
    extract::{FromRequest, Request, rejection::JsonRejection},
};

use crate::error::AppError;

pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(map_json_rejection(rejection)),
        }
    }
}

pub fn map_json_rejection(rejection: JsonRejection) -> AppError {
    let body_text = rejection.body_text();
    AppError::Validation {
        field: Some(missing_field(&body_text).unwrap_or_else(|| "body".to_string())),
        message: format!("Invalid request body: {body_text}"),
        docs_hint: Some("Send a JSON body of the form {\"message\": \"...\"}.".to_string()),
    }
}

/// Field name from serde's "missing field `x`" message.
fn missing_field(msg: &str) -> Option<String> {
    let start = msg.find("missing field `")? + "missing field `".len();
    let rest = &msg[start..];
    let end = rest.find('`')?;
    Some(rest[..end].to_string())
}

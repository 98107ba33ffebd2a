//! HTTP client for the chat endpoint.

use motorchat_core::chat::{ChatRequest, ChatResponse, QuotaExceededResponse};
use motorchat_core::error::ApiError;

#[derive(Debug, Clone, PartialEq)]
pub enum ChatOutcome {
    Reply(ChatResponse),
    QuotaExceeded(QuotaExceededResponse),
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("server returned HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unexpected response body: {0}")]
    Decode(String),
}

pub struct ChatClient {
    http: reqwest::Client,
    api_url: String,
}

impl ChatClient {
    pub fn new(http: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
        }
    }

    pub async fn send(&self, token: &str, message: &str) -> Result<ChatOutcome, ChatError> {
        let response = self
            .http
            .post(format!("{}/api/chat", self.api_url.trim_end_matches('/')))
            .bearer_auth(token)
            .json(&ChatRequest {
                message: message.to_string(),
            })
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        interpret_response(status, &body)
    }
}

/// Map a status and body onto an outcome.
///
/// Older servers report an exhausted quota as a 200 carrying `{error, resetTime}`,
/// so a 200 is tried as a reply first and then as a quota notice.
fn interpret_response(status: u16, body: &str) -> Result<ChatOutcome, ChatError> {
    match status {
        200 => {
            if let Ok(reply) = serde_json::from_str::<ChatResponse>(body) {
                return Ok(ChatOutcome::Reply(reply));
            }
            serde_json::from_str::<QuotaExceededResponse>(body)
                .map(ChatOutcome::QuotaExceeded)
                .map_err(|e| ChatError::Decode(e.to_string()))
        }
        429 => match serde_json::from_str::<QuotaExceededResponse>(body) {
            Ok(quota) => Ok(ChatOutcome::QuotaExceeded(quota)),
            Err(_) => Err(ChatError::Api {
                status,
                message: error_message(body),
            }),
        },
        401 => Err(ChatError::Unauthorized(error_message(body))),
        _ => Err(ChatError::Api {
            status,
            message: error_message(body),
        }),
    }
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ApiError>(body) {
        Ok(err) => err.message,
        Err(_) => serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| body.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_body_is_a_reply() {
        let body = r#"{"message":"Check the tyre pressure.","remainingRequests":3,"resetTime":"2026-03-02T10:00:00Z"}"#;
        match interpret_response(200, body).unwrap() {
            ChatOutcome::Reply(reply) => {
                assert_eq!(reply.message, "Check the tyre pressure.");
                assert_eq!(reply.remaining_requests, 3);
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn quota_notice_is_recognised_on_429_and_legacy_200() {
        let body = r#"{"error":"You have reached your usage limit.","resetTime":"2026-03-02T10:00:00Z"}"#;
        for status in [200, 429] {
            assert!(matches!(
                interpret_response(status, body).unwrap(),
                ChatOutcome::QuotaExceeded(ref q) if q.error.starts_with("You have reached")
            ));
        }
    }

    #[test]
    fn unauthorized_is_its_own_error() {
        let body = r#"{"error":"unauthorized","message":"Invalid or expired token","request_id":"r1"}"#;
        let err = interpret_response(401, body).unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized(ref m) if m == "Invalid or expired token"));
    }

    #[test]
    fn per_ip_throttle_is_not_mistaken_for_quota() {
        let body = r#"{"error":"rate_limited","message":"Too many requests","request_id":"r2"}"#;
        let err = interpret_response(429, body).unwrap_err();
        assert!(matches!(err, ChatError::Api { status: 429, ref message } if message == "Too many requests"));
    }

    #[test]
    fn other_failures_keep_status_and_message() {
        let err = interpret_response(502, "bad gateway").unwrap_err();
        assert!(matches!(err, ChatError::Api { status: 502, ref message } if message == "bad gateway"));
        assert!(matches!(
            interpret_response(200, "{}").unwrap_err(),
            ChatError::Decode(_)
        ));
    }
}

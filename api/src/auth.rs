use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use motorchat_core::auth::{parse_bearer, subject_fingerprint};

use crate::error::AppError;
use crate::state::AppState;
use crate::verify::TokenVerifier;

/// Identity proven by the `Authorization: Bearer <token>` header.
///
/// The id always comes from the verified token subject; nothing the client puts
/// in the request body is trusted as an identity.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub identity_id: String,
}

impl AuthenticatedUser {
    pub fn subject(&self) -> String {
        subject_fingerprint(&self.identity_id)
    }
}

/// Resolve the caller from a raw `Authorization` header value.
///
/// Verification details only go to the log; the client sees one generic message.
pub async fn authenticate(
    header: Option<&str>,
    verifier: &dyn TokenVerifier,
) -> Result<AuthenticatedUser, AppError> {
    let header = header.ok_or_else(|| AppError::Unauthorized {
        message: "Missing Authorization header".to_string(),
        docs_hint: Some("Include 'Authorization: Bearer <token>' header.".to_string()),
    })?;

    let token = parse_bearer(header).ok_or_else(|| AppError::Unauthorized {
        message: "Authorization header must use Bearer scheme".to_string(),
        docs_hint: Some("Format: 'Authorization: Bearer <token>'".to_string()),
    })?;

    match verifier.verify(token).await {
        Ok(identity) => Ok(AuthenticatedUser {
            identity_id: identity.uid,
        }),
        Err(err) => {
            tracing::warn!(error = %err, "bearer token verification failed");
            Err(AppError::Unauthorized {
                message: "Invalid or expired token".to_string(),
                docs_hint: Some("Sign in again to obtain a fresh token.".to_string()),
            })
        }
    }
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok());
        authenticate(header, state.verifier.as_ref()).await
    }
}

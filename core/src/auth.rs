use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

const BEARER_PREFIX: &str = "Bearer ";

/// Extract the token from an `Authorization` header value.
///
/// Only the exact `Bearer <token>` form is accepted; the token must be non-empty
/// and free of whitespace.
pub fn parse_bearer(header: &str) -> Option<&str> {
    let token = header.strip_prefix(BEARER_PREFIX)?;
    if token.is_empty() || token.chars().any(char::is_whitespace) {
        return None;
    }
    Some(token)
}

/// Stable, non-reversible label for an identity id, safe to put in logs.
pub fn subject_fingerprint(identity_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Random URL-safe value for the `state` parameter of a redirect-based sign-in.
pub fn generate_state() -> String {
    let bytes: Vec<u8> = (0..32).map(|_| rand::thread_rng().r#gen::<u8>()).collect();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bearer_accepts_well_formed_header() {
        assert_eq!(parse_bearer("Bearer abc.def.ghi"), Some("abc.def.ghi"));
    }

    #[test]
    fn parse_bearer_rejects_other_schemes_and_blank_tokens() {
        assert_eq!(parse_bearer("Basic dXNlcjpwYXNz"), None);
        assert_eq!(parse_bearer("bearer abc"), None);
        assert_eq!(parse_bearer("Bearer "), None);
        assert_eq!(parse_bearer("Bearer  abc"), None);
        assert_eq!(parse_bearer("Bearer abc def"), None);
        assert_eq!(parse_bearer("abc"), None);
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = subject_fingerprint("uid-123");
        assert_eq!(a, subject_fingerprint("uid-123"));
        assert_ne!(a, subject_fingerprint("uid-124"));
        assert_eq!(a.len(), 16);
        assert!(!a.contains("uid"));
    }

    #[test]
    fn generated_state_is_url_safe_and_random() {
        let a = generate_state();
        let b = generate_state();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}

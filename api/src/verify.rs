//! Server-side bearer token verification.
//!
//! Tokens are JWTs minted by a Firebase-compatible identity provider. Production
//! deployments verify RS256 signatures against the provider's published JWKS;
//! local setups can use an HS256 shared secret instead. Either way the same
//! claim checks apply (`exp`, `aud`, `iss`, non-empty `sub`).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};

pub const FIREBASE_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";
const FIREBASE_ISSUER_PREFIX: &str = "https://securetoken.google.com/";
const JWKS_CACHE_TTL: Duration = Duration::from_secs(3600);
/// An unknown `kid` triggers at most one JWKS refetch per interval.
const JWKS_MIN_REFETCH_INTERVAL: Duration = Duration::from_secs(60);
const CLOCK_LEEWAY_SECS: u64 = 30;

/// Principal proven by a verified bearer token. `uid` is the token subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub uid: String,
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("token rejected: {0}")]
    Rejected(#[from] jsonwebtoken::errors::Error),
    #[error("no signing key for kid {0:?}")]
    UnknownKey(Option<String>),
    #[error("token has an empty subject")]
    EmptySubject,
    #[error("failed to fetch signing keys: {0}")]
    KeyFetch(String),
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, VerifyError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

enum KeySource {
    Secret(DecodingKey),
    Jwks {
        url: String,
        http: reqwest::Client,
        cache: RwLock<Option<CachedJwks>>,
        /// Time of the last fetch attempt, successful or not. Holding the lock
        /// serializes refetches so concurrent misses share one request.
        last_attempt: Mutex<Option<Instant>>,
        min_refetch_interval: Duration,
    },
}

enum CacheLookup {
    Hit(DecodingKey),
    /// Keys are fresh and recently fetched; the `kid` is simply not among them.
    Unknown,
    Refetch,
}

pub struct JwtVerifier {
    keys: KeySource,
    validation: Validation,
}

impl JwtVerifier {
    /// RS256 verification against a JWKS endpoint, with Firebase issuer/audience rules.
    pub fn firebase(project_id: &str, jwks_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            keys: KeySource::Jwks {
                url: jwks_url.into(),
                http,
                cache: RwLock::new(None),
                last_attempt: Mutex::new(None),
                min_refetch_interval: JWKS_MIN_REFETCH_INTERVAL,
            },
            validation: claims_validation(Algorithm::RS256, project_id),
        }
    }

    /// HS256 verification with a shared secret. Same claim rules as [`JwtVerifier::firebase`].
    pub fn shared_secret(project_id: &str, secret: &[u8]) -> Self {
        Self {
            keys: KeySource::Secret(DecodingKey::from_secret(secret)),
            validation: claims_validation(Algorithm::HS256, project_id),
        }
    }

    #[cfg(test)]
    fn with_min_refetch_interval(mut self, interval: Duration) -> Self {
        if let KeySource::Jwks {
            min_refetch_interval,
            ..
        } = &mut self.keys
        {
            *min_refetch_interval = interval;
        }
        self
    }

    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, VerifyError> {
        match &self.keys {
            KeySource::Secret(key) => Ok(key.clone()),
            KeySource::Jwks {
                url,
                http,
                cache,
                last_attempt,
                min_refetch_interval,
            } => {
                let kid = kid.ok_or(VerifyError::UnknownKey(None))?;
                let unknown = || VerifyError::UnknownKey(Some(kid.to_string()));

                match lookup(cache, kid, *min_refetch_interval).await? {
                    CacheLookup::Hit(key) => return Ok(key),
                    CacheLookup::Unknown => return Err(unknown()),
                    CacheLookup::Refetch => {}
                }

                let mut last_attempt = last_attempt.lock().await;
                // Another request may have refreshed the keys while we waited.
                match lookup(cache, kid, *min_refetch_interval).await? {
                    CacheLookup::Hit(key) => return Ok(key),
                    CacheLookup::Unknown => return Err(unknown()),
                    CacheLookup::Refetch => {}
                }

                if last_attempt.is_some_and(|at| at.elapsed() < *min_refetch_interval) {
                    // Throttled: fall back to whatever the cache still holds, even past its TTL.
                    let guard = cache.read().await;
                    return match guard.as_ref().and_then(|cached| cached.keys.find(kid)) {
                        Some(jwk) => Ok(DecodingKey::from_jwk(jwk)?),
                        None => Err(unknown()),
                    };
                }
                *last_attempt = Some(Instant::now());

                tracing::debug!(kid, "fetching signing keys");
                let keys = fetch_jwks(http, url).await?;
                let key = keys.find(kid).map(DecodingKey::from_jwk).transpose()?;
                *cache.write().await = Some(CachedJwks {
                    keys,
                    fetched_at: Instant::now(),
                });
                key.ok_or_else(unknown)
            }
        }
    }
}

async fn lookup(
    cache: &RwLock<Option<CachedJwks>>,
    kid: &str,
    min_refetch_interval: Duration,
) -> Result<CacheLookup, VerifyError> {
    let guard = cache.read().await;
    let Some(cached) = guard.as_ref() else {
        return Ok(CacheLookup::Refetch);
    };
    let age = cached.fetched_at.elapsed();
    if age >= JWKS_CACHE_TTL {
        return Ok(CacheLookup::Refetch);
    }
    if let Some(jwk) = cached.keys.find(kid) {
        return Ok(CacheLookup::Hit(DecodingKey::from_jwk(jwk)?));
    }
    if age < min_refetch_interval {
        return Ok(CacheLookup::Unknown);
    }
    Ok(CacheLookup::Refetch)
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, VerifyError> {
        let header = decode_header(token)?;
        let key = self.decoding_key(header.kid.as_deref()).await?;
        let data = decode::<Claims>(token, &key, &self.validation)?;

        if data.claims.sub.trim().is_empty() {
            return Err(VerifyError::EmptySubject);
        }

        Ok(VerifiedIdentity {
            uid: data.claims.sub,
        })
    }
}

fn claims_validation(algorithm: Algorithm, project_id: &str) -> Validation {
    let mut validation = Validation::new(algorithm);
    validation.set_audience(&[project_id]);
    validation.set_issuer(&[format!("{FIREBASE_ISSUER_PREFIX}{project_id}")]);
    validation.set_required_spec_claims(&["exp", "sub", "aud", "iss"]);
    validation.leeway = CLOCK_LEEWAY_SECS;
    validation
}

async fn fetch_jwks(http: &reqwest::Client, url: &str) -> Result<JwkSet, VerifyError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| VerifyError::KeyFetch(e.to_string()))?;

    if !response.status().is_success() {
        return Err(VerifyError::KeyFetch(format!(
            "JWKS endpoint returned {}",
            response.status()
        )));
    }

    response
        .json::<JwkSet>()
        .await
        .map_err(|e| VerifyError::KeyFetch(e.to_string()))
}

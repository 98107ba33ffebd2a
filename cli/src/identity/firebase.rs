//! Identity provider backed by the Firebase Auth REST API (Identity Toolkit v1).
//!
//! Works against the hosted service or the local auth emulator; only the base
//! URLs differ.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::Mutex;

use super::store::{self, StoredSession};
use super::{ChangeCallback, Identity, IdentityEvents, IdentityProvider, ProviderError, Subscription};

pub const DEFAULT_IDENTITY_URL: &str = "https://identitytoolkit.googleapis.com/v1";
pub const DEFAULT_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1/token";

/// Refresh the id token when it is this close to expiry.
const REFRESH_MARGIN_SECS: i64 = 300;
const FEDERATED_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct FirebaseConfig {
    pub api_key: String,
    pub identity_url: String,
    pub token_url: String,
    /// Hosted page that performs the federated sign-in and redirects back with an `id_token`
    pub federated_auth_url: Option<String>,
    pub federated_provider: String,
    pub session_path: PathBuf,
}

pub struct FirebaseIdentityProvider {
    config: FirebaseConfig,
    http: reqwest::Client,
    events: IdentityEvents,
    session: Mutex<Option<StoredSession>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    local_id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    photo_url: Option<String>,
    id_token: String,
    refresh_token: String,
    expires_in: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    expires_in: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, PartialEq, Eq)]
struct FederatedCallback {
    id_token: String,
    state: Option<String>,
}

impl FirebaseIdentityProvider {
    pub fn new(config: FirebaseConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            events: IdentityEvents::new(),
            session: Mutex::new(None),
        }
    }

    /// Load the persisted session and publish the provider's first state.
    pub async fn restore(&self) {
        let restored = store::load(&self.config.session_path);
        let identity = restored.as_ref().map(|s| Arc::new(s.identity.clone()));
        *self.session.lock().await = restored;
        tracing::debug!(restored = identity.is_some(), "identity state resolved");
        self.events.publish(identity);
    }

    async fn post_identity<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<T, ProviderError> {
        let url = format!(
            "{}/{endpoint}?key={}",
            self.config.identity_url.trim_end_matches('/'),
            self.config.api_key
        );
        let response = self.http.post(url).json(&body).send().await?;
        decode_response(response).await
    }

    async fn establish(&self, response: SignInResponse) -> Result<Arc<Identity>, ProviderError> {
        let session = StoredSession {
            identity: Identity {
                uid: response.local_id,
                email: response.email,
                display_name: response.display_name,
                photo_url: response.photo_url,
            },
            id_token: response.id_token,
            refresh_token: response.refresh_token,
            expires_at: expires_at(&response.expires_in),
        };
        store::save(&self.config.session_path, &session)?;

        let identity = Arc::new(session.identity.clone());
        *self.session.lock().await = Some(session);
        self.events.publish(Some(identity.clone()));
        Ok(identity)
    }

    async fn refresh(&self, session: &StoredSession) -> Result<StoredSession, ProviderError> {
        let url = format!("{}?key={}", self.config.token_url, self.config.api_key);
        let response = self
            .http
            .post(url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", session.refresh_token.as_str()),
            ])
            .send()
            .await?;
        let refreshed: RefreshResponse = decode_response(response).await?;

        Ok(StoredSession {
            identity: session.identity.clone(),
            id_token: refreshed.id_token,
            refresh_token: refreshed.refresh_token,
            expires_at: expires_at(&refreshed.expires_in),
        })
    }
}

#[async_trait]
impl IdentityProvider for FirebaseIdentityProvider {
    fn subscribe(&self, on_change: ChangeCallback) -> Subscription {
        self.events.subscribe(on_change)
    }

    fn current_identity(&self) -> Option<Arc<Identity>> {
        self.events.current()
    }

    async fn register(&self, email: &str, secret: &str) -> Result<Arc<Identity>, ProviderError> {
        let response: SignInResponse = self
            .post_identity(
                "accounts:signUp",
                json!({ "email": email, "password": secret, "returnSecureToken": true }),
            )
            .await?;
        self.establish(response).await
    }

    async fn sign_in_with_credential(
        &self,
        email: &str,
        secret: &str,
    ) -> Result<Arc<Identity>, ProviderError> {
        let response: SignInResponse = self
            .post_identity(
                "accounts:signInWithPassword",
                json!({ "email": email, "password": secret, "returnSecureToken": true }),
            )
            .await?;
        self.establish(response).await
    }

    async fn sign_in_with_federated_popup(&self) -> Result<Arc<Identity>, ProviderError> {
        let auth_url = self.config.federated_auth_url.as_deref().ok_or_else(|| {
            ProviderError::Federated("no federated sign-in URL is configured".to_string())
        })?;

        let state = motorchat_core::auth::generate_state();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let redirect_uri = format!("http://127.0.0.1:{}/callback", listener.local_addr()?.port());

        let mut url = url::Url::parse(auth_url)
            .map_err(|e| ProviderError::Federated(format!("invalid sign-in URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("redirect_uri", &redirect_uri)
            .append_pair("state", &state)
            .append_pair("provider_id", &self.config.federated_provider);

        eprintln!("Opening browser for sign-in...");
        eprintln!("If the browser doesn't open, visit: {url}");
        let _ = open::that(url.as_str());

        let callback = tokio::time::timeout(FEDERATED_TIMEOUT, wait_for_callback(listener))
            .await
            .map_err(|_| ProviderError::Federated("sign-in timed out after 5 minutes".to_string()))??;

        if callback.state.as_deref() != Some(state.as_str()) {
            return Err(ProviderError::Federated(
                "state mismatch in sign-in callback".to_string(),
            ));
        }

        let response: SignInResponse = self
            .post_identity(
                "accounts:signInWithIdp",
                json!({
                    "postBody": format!(
                        "id_token={}&providerId={}",
                        callback.id_token, self.config.federated_provider
                    ),
                    "requestUri": redirect_uri,
                    "returnSecureToken": true,
                    "returnIdpCredential": true,
                }),
            )
            .await?;
        self.establish(response).await
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        self.session.lock().await.take();
        self.events.publish(None);
        store::remove(&self.config.session_path)?;
        Ok(())
    }

    async fn mint_token(
        &self,
        identity: &Identity,
        force_refresh: bool,
    ) -> Result<String, ProviderError> {
        let mut guard = self.session.lock().await;
        let session = guard
            .as_ref()
            .filter(|s| s.identity.uid == identity.uid)
            .ok_or(ProviderError::NoSession)?;

        let fresh_enough =
            session.expires_at - chrono::Duration::seconds(REFRESH_MARGIN_SECS) > Utc::now();
        if fresh_enough && !force_refresh {
            return Ok(session.id_token.clone());
        }

        let refreshed = self.refresh(session).await?;
        store::save(&self.config.session_path, &refreshed)?;
        let token = refreshed.id_token.clone();
        *guard = Some(refreshed);
        Ok(token)
    }
}

async fn decode_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ProviderError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ProviderError::Rejected(provider_diagnostic(status.as_u16(), &body)));
    }
    serde_json::from_str(&body)
        .map_err(|e| ProviderError::Rejected(format!("unexpected provider response: {e}")))
}

/// The provider's own error code when the body carries one, else the HTTP status.
fn provider_diagnostic(status: u16, body: &str) -> String {
    serde_json::from_str::<ErrorEnvelope>(body)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| format!("identity provider returned HTTP {status}"))
}

fn expires_at(expires_in: &str) -> chrono::DateTime<Utc> {
    let secs = expires_in.trim().parse::<i64>().unwrap_or(3600);
    Utc::now() + chrono::Duration::seconds(secs)
}

async fn wait_for_callback(
    listener: tokio::net::TcpListener,
) -> Result<FederatedCallback, ProviderError> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (mut stream, _) = listener.accept().await?;
    let mut buf = vec![0u8; 8192];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let parsed = parse_callback(request.lines().next().unwrap_or(""));

    let page = if parsed.is_ok() {
        "<html><body><h1>Signed in!</h1><p>You can close this tab.</p></body></html>"
    } else {
        "<html><body><h1>Sign-in failed</h1><p>Return to the terminal for details.</p></body></html>"
    };
    let response = format!("HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n{page}");
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;

    parsed
}

/// Parse `GET /callback?id_token=...&state=... HTTP/1.1`.
fn parse_callback(request_line: &str) -> Result<FederatedCallback, ProviderError> {
    let path = request_line.split_whitespace().nth(1).unwrap_or("");
    let url = url::Url::parse(&format!("http://localhost{path}"))
        .map_err(|e| ProviderError::Federated(format!("bad callback URL: {e}")))?;

    let param = |name: &str| {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.to_string())
    };

    if let Some(error) = param("error") {
        return Err(ProviderError::Federated(error));
    }
    let id_token = param("id_token")
        .ok_or_else(|| ProviderError::Federated("callback carried no id_token".to_string()))?;

    Ok(FederatedCallback {
        id_token,
        state: param("state"),
    })
}

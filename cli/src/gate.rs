//! The client's single authoritative view of who is signed in.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OnceCell, watch};

use crate::guard::Navigation;
use crate::identity::{Identity, IdentityProvider, ProviderError, Subscription};

/// Snapshot of the client's authentication state.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    pub current_identity: Option<Arc<Identity>>,
    /// Set once the provider has delivered its first notification.
    pub initialized: bool,
    /// True while a login or logout round trip is in flight.
    pub pending: bool,
    in_flight: u32,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        self.current_identity.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routes {
    pub login: String,
    pub home: String,
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            login: "/login".to_string(),
            home: "/".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The provider rejected the attempt; carries its diagnostic unchanged.
    #[error("{0}")]
    AuthFailure(String),
    #[error("not signed in")]
    NotAuthenticated,
}

impl From<ProviderError> for AuthError {
    fn from(err: ProviderError) -> Self {
        AuthError::AuthFailure(err.to_string())
    }
}

pub struct AuthGate {
    provider: Arc<dyn IdentityProvider>,
    routes: Routes,
    state: Arc<watch::Sender<AuthState>>,
    subscription: OnceCell<Subscription>,
}

/// Holds `pending` up for as long as it lives.
struct PendingGuard<'a> {
    state: &'a watch::Sender<AuthState>,
}

impl<'a> PendingGuard<'a> {
    fn begin(state: &'a watch::Sender<AuthState>) -> Self {
        state.send_modify(|s| {
            s.in_flight += 1;
            s.pending = true;
        });
        Self { state }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.state.send_modify(|s| {
            s.in_flight = s.in_flight.saturating_sub(1);
            s.pending = s.in_flight > 0;
        });
    }
}

impl AuthGate {
    pub fn new(provider: Arc<dyn IdentityProvider>, routes: Routes) -> Self {
        let (tx, _) = watch::channel(AuthState::default());
        Self {
            provider,
            routes,
            state: Arc::new(tx),
            subscription: OnceCell::new(),
        }
    }

    pub fn routes(&self) -> &Routes {
        &self.routes
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    #[cfg(test)]
    pub fn watch(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn current_identity(&self) -> Option<Arc<Identity>> {
        self.state.borrow().current_identity.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    /// Resolve the signed-in identity, subscribing to the provider on first use.
    ///
    /// Concurrent first callers share one subscription and are released
    /// together when the provider's first notification lands.
    pub async fn initialize(&self) -> Option<Arc<Identity>> {
        if self.state.borrow().initialized {
            return self.current_identity();
        }

        self.subscription
            .get_or_init(|| async {
                let writer = self.state.clone();
                let on_change = move |identity: Option<Arc<Identity>>| {
                    writer.send_modify(|s| {
                        s.current_identity = identity;
                        s.initialized = true;
                    });
                };
                let subscription = self.provider.subscribe(Arc::new(on_change));

                let mut rx = self.state.subscribe();
                // The sender lives in `self`, so this only returns once initialized.
                let _ = rx.wait_for(|s| s.initialized).await;
                tracing::debug!(
                    authenticated = self.is_authenticated(),
                    "auth state initialized"
                );
                subscription
            })
            .await;

        self.current_identity()
    }

    pub async fn register(&self, email: &str, secret: &str) -> Result<Arc<Identity>, AuthError> {
        self.run_flow(self.provider.register(email, secret)).await
    }

    pub async fn login_with_credential(
        &self,
        email: &str,
        secret: &str,
    ) -> Result<Arc<Identity>, AuthError> {
        self.run_flow(self.provider.sign_in_with_credential(email, secret))
            .await
    }

    pub async fn login_with_federated_popup(&self) -> Result<Arc<Identity>, AuthError> {
        self.run_flow(self.provider.sign_in_with_federated_popup())
            .await
    }

    /// Sign out at the provider, then clear local state whatever the provider said.
    pub async fn sign_out(&self) -> Navigation {
        let _pending = PendingGuard::begin(&self.state);
        if let Err(err) = self.provider.sign_out().await {
            tracing::warn!(error = %err, "provider sign-out failed, clearing local state anyway");
        }
        self.state.send_modify(|s| s.current_identity = None);
        Navigation::Redirect(self.routes.login.clone())
    }

    pub async fn current_token(&self, force_refresh: bool) -> Result<String, AuthError> {
        let identity = self.current_identity().ok_or(AuthError::NotAuthenticated)?;
        let token = self.provider.mint_token(&identity, force_refresh).await?;
        Ok(token)
    }

    async fn run_flow<F>(&self, flow: F) -> Result<Arc<Identity>, AuthError>
    where
        F: Future<Output = Result<Arc<Identity>, ProviderError>>,
    {
        let _pending = PendingGuard::begin(&self.state);
        let returned = flow.await.inspect_err(|err| {
            tracing::debug!(error = %err, "sign-in rejected by identity provider");
        })?;

        let identity = self.provider.current_identity().unwrap_or(returned);
        self.state
            .send_modify(|s| s.current_identity = Some(identity.clone()));
        Ok(identity)
    }
}

//! Client side of the identity provider: who is signed in, and how to prove it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[cfg(test)]
pub mod fake;
pub mod firebase;
pub mod store;

/// A signed-in principal as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider refused the operation; carries its diagnostic (e.g. `INVALID_PASSWORD`).
    #[error("{0}")]
    Rejected(String),
    #[error("identity provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("session storage failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("no stored session for this identity")]
    NoSession,
    #[error("federated sign-in failed: {0}")]
    Federated(String),
}

/// Invoked with the new identity (or `None` when signed out) on every change.
pub type ChangeCallback = Arc<dyn Fn(Option<Arc<Identity>>) + Send + Sync>;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Deliver the current state once it is known, then every change, until the
    /// returned subscription is dropped.
    fn subscribe(&self, on_change: ChangeCallback) -> Subscription;

    /// The provider's own view of the signed-in identity.
    fn current_identity(&self) -> Option<Arc<Identity>>;

    async fn register(&self, email: &str, secret: &str) -> Result<Arc<Identity>, ProviderError>;

    async fn sign_in_with_credential(
        &self,
        email: &str,
        secret: &str,
    ) -> Result<Arc<Identity>, ProviderError>;

    async fn sign_in_with_federated_popup(&self) -> Result<Arc<Identity>, ProviderError>;

    async fn sign_out(&self) -> Result<(), ProviderError>;

    async fn mint_token(
        &self,
        identity: &Identity,
        force_refresh: bool,
    ) -> Result<String, ProviderError>;
}

/// Handle for a live change subscription. Dropping it stops delivery.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    #[cfg(test)]
    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Change-notification hub shared by provider implementations.
///
/// The outer `Option` is `None` until the provider has resolved its initial
/// state; subscribers hear nothing before that.
pub struct IdentityEvents {
    tx: watch::Sender<Option<Option<Arc<Identity>>>>,
}

impl Default for IdentityEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityEvents {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn publish(&self, identity: Option<Arc<Identity>>) {
        self.tx.send_replace(Some(identity));
    }

    pub fn current(&self) -> Option<Arc<Identity>> {
        self.tx.borrow().clone().flatten()
    }

    pub fn subscribe(&self, on_change: ChangeCallback) -> Subscription {
        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                let latest = rx.borrow_and_update().clone();
                if let Some(identity) = latest {
                    on_change(identity);
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
        Subscription { task }
    }
}

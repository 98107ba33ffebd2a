//! In-process identity provider for exercising the gate and guard.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{ChangeCallback, Identity, IdentityEvents, IdentityProvider, ProviderError, Subscription};

pub const GOOD_SECRET: &str = "correct-horse";

#[derive(Default)]
pub struct FakeProvider {
    events: IdentityEvents,
    subscribe_calls: AtomicUsize,
    sign_in_gate: Option<Arc<Notify>>,
    sign_out_fails: AtomicBool,
    token_requests: Mutex<Vec<bool>>,
}

pub fn identity(uid: &str) -> Arc<Identity> {
    Arc::new(Identity {
        uid: uid.to_string(),
        email: Some(format!("{uid}@example.com")),
        display_name: None,
        photo_url: None,
    })
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sign-in flows block until the returned handle is notified.
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let provider = Self {
            sign_in_gate: Some(gate.clone()),
            ..Self::default()
        };
        (provider, gate)
    }

    /// Emit the first notification, as a real provider does once it has resolved.
    pub fn resolve(&self, identity: Option<Arc<Identity>>) {
        self.events.publish(identity);
    }

    pub fn fail_sign_out(&self) {
        self.sign_out_fails.store(true, Ordering::SeqCst);
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn token_requests(&self) -> Vec<bool> {
        self.token_requests.lock().unwrap().clone()
    }

    async fn credential_flow(&self, email: &str, secret: &str) -> Result<Arc<Identity>, ProviderError> {
        if let Some(gate) = &self.sign_in_gate {
            gate.notified().await;
        }
        if secret != GOOD_SECRET {
            return Err(ProviderError::Rejected("INVALID_PASSWORD".to_string()));
        }
        let uid = email.split('@').next().unwrap_or(email);
        let signed_in = identity(uid);
        self.events.publish(Some(signed_in.clone()));
        Ok(signed_in)
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    fn subscribe(&self, on_change: ChangeCallback) -> Subscription {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.events.subscribe(on_change)
    }

    fn current_identity(&self) -> Option<Arc<Identity>> {
        self.events.current()
    }

    async fn register(&self, email: &str, secret: &str) -> Result<Arc<Identity>, ProviderError> {
        self.credential_flow(email, secret).await
    }

    async fn sign_in_with_credential(
        &self,
        email: &str,
        secret: &str,
    ) -> Result<Arc<Identity>, ProviderError> {
        self.credential_flow(email, secret).await
    }

    async fn sign_in_with_federated_popup(&self) -> Result<Arc<Identity>, ProviderError> {
        if let Some(gate) = &self.sign_in_gate {
            gate.notified().await;
        }
        let signed_in = identity("federated");
        self.events.publish(Some(signed_in.clone()));
        Ok(signed_in)
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        if self.sign_out_fails.load(Ordering::SeqCst) {
            return Err(ProviderError::Rejected("NETWORK_REQUEST_FAILED".to_string()));
        }
        self.events.publish(None);
        Ok(())
    }

    async fn mint_token(
        &self,
        identity: &Identity,
        force_refresh: bool,
    ) -> Result<String, ProviderError> {
        self.token_requests.lock().unwrap().push(force_refresh);
        let freshness = if force_refresh { "fresh" } else { "cached" };
        Ok(format!("token-{}-{freshness}", identity.uid))
    }
}

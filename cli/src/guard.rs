//! Pre-navigation hook that keeps routes consistent with the auth state.

use std::sync::Arc;

use tokio::sync::watch;

use crate::gate::AuthGate;

/// Redirect hops followed before a navigation is declared a loop.
pub const MAX_REDIRECTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    Admit,
    Redirect(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardPhase {
    Unresolved,
    Admitted,
    Redirecting(String),
}

#[derive(Debug, thiserror::Error)]
pub enum NavigationError {
    #[error("navigation to {target} kept redirecting (last hop: {last})")]
    RedirectLoop { target: String, last: String },
}

pub struct RouteGuard {
    gate: Arc<AuthGate>,
    phase: watch::Sender<GuardPhase>,
}

impl RouteGuard {
    pub fn new(gate: Arc<AuthGate>) -> Self {
        let (phase, _) = watch::channel(GuardPhase::Unresolved);
        Self { gate, phase }
    }

    pub fn phase(&self) -> GuardPhase {
        self.phase.borrow().clone()
    }

    /// Decide whether `target` may be entered.
    ///
    /// Order matters: resolve the identity first, then defer to any in-flight
    /// login or logout, and only then apply the signed-in/signed-out rules.
    pub async fn before_each(&self, target: &str) -> Navigation {
        if !self.gate.state().initialized {
            self.phase.send_replace(GuardPhase::Unresolved);
            self.gate.initialize().await;
        }

        let state = self.gate.state();
        let routes = self.gate.routes();
        let on_login = route_path(target) == route_path(&routes.login);

        let decision = if state.pending {
            Navigation::Admit
        } else if on_login && state.is_authenticated() {
            Navigation::Redirect(routes.home.clone())
        } else if !on_login && !state.is_authenticated() {
            Navigation::Redirect(routes.login.clone())
        } else {
            Navigation::Admit
        };

        self.phase.send_replace(match &decision {
            Navigation::Admit => GuardPhase::Admitted,
            Navigation::Redirect(to) => GuardPhase::Redirecting(to.clone()),
        });
        decision
    }
}

/// Runs every route change through the guard and follows its redirects.
pub struct Navigator {
    guard: RouteGuard,
}

impl Navigator {
    pub fn new(guard: RouteGuard) -> Self {
        Self { guard }
    }

    pub fn guard(&self) -> &RouteGuard {
        &self.guard
    }

    /// Returns the route finally admitted.
    pub async fn navigate(&self, target: &str) -> Result<String, NavigationError> {
        let mut current = target.to_string();
        for _ in 0..=MAX_REDIRECTS {
            match self.guard.before_each(&current).await {
                Navigation::Admit => return Ok(current),
                Navigation::Redirect(next) => {
                    tracing::debug!(from = %current, to = %next, "route guard redirect");
                    current = next;
                }
            }
        }
        Err(NavigationError::RedirectLoop {
            target: target.to_string(),
            last: current,
        })
    }
}

fn route_path(target: &str) -> &str {
    target.split(['?', '#']).next().unwrap_or(target)
}

//! Route guards over the auth state.
//!
//! SYSTEM CONTEXT
//! ==============
//! Protected pages and the sign-in page apply identical redirect behavior:
//! nothing happens while auth is loading, then exactly one replace-navigation
//! is issued if the route does not fit the current user.

#[cfg(test)]
#[path = "auth_test.rs"]
mod auth_test;

use tokio::sync::watch;

use crate::state::auth::AuthState;

/// Public entry point unauthenticated users are sent to.
pub const PUBLIC_ENTRY: &str = "/auth";

/// Landing page for authenticated users.
pub const AUTHENTICATED_HOME: &str = "/dashboard";

/// Who may see a route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Signed-in users only.
    Protected,
    /// Signed-out users only.
    PublicOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Redirect {
    pub to: &'static str,
    /// Replace the current history entry instead of pushing a new one.
    pub replace: bool,
}

impl Redirect {
    #[must_use]
    pub fn replace(to: &'static str) -> Self {
        Self { to, replace: true }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardDecision {
    /// Auth is still loading; show a neutral placeholder.
    Placeholder,
    Render,
    Redirect(Redirect),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NavigateOptions {
    pub replace: bool,
}

/// Decision for a route that needs a signed-in user.
#[must_use]
pub fn require_authenticated(state: &AuthState) -> GuardDecision {
    if state.loading {
        GuardDecision::Placeholder
    } else if state.user.is_some() {
        GuardDecision::Render
    } else {
        GuardDecision::Redirect(Redirect::replace(PUBLIC_ENTRY))
    }
}

/// Decision for a route only signed-out users should see.
#[must_use]
pub fn require_unauthenticated(state: &AuthState) -> GuardDecision {
    if state.loading {
        GuardDecision::Placeholder
    } else if state.user.is_none() {
        GuardDecision::Render
    } else {
        GuardDecision::Redirect(Redirect::replace(AUTHENTICATED_HOME))
    }
}

#[must_use]
pub fn guard(access: Access, state: &AuthState) -> GuardDecision {
    match access {
        Access::Protected => require_authenticated(state),
        Access::PublicOnly => require_unauthenticated(state),
    }
}

// =============================================================================
// NAVIGATION DRIVER
// =============================================================================

/// Applies guard decisions to a navigator, redirecting once per change.
pub struct RouteGuard<F> {
    access: Access,
    navigate: F,
    last: Option<GuardDecision>,
}

impl<F> RouteGuard<F>
where
    F: Fn(&str, NavigateOptions),
{
    #[must_use]
    pub fn new(access: Access, navigate: F) -> Self {
        Self { access, navigate, last: None }
    }

    /// Decide for `state`, navigating only if the decision differs from the
    /// previous evaluation.
    pub fn evaluate(&mut self, state: &AuthState) -> GuardDecision {
        let decision = guard(self.access, state);
        if self.last == Some(decision) {
            return decision;
        }
        if let GuardDecision::Redirect(redirect) = decision {
            tracing::debug!(to = redirect.to, access = ?self.access, "route guard redirecting");
            (self.navigate)(redirect.to, NavigateOptions { replace: redirect.replace });
        }
        self.last = Some(decision);
        decision
    }

    #[must_use]
    pub fn last_decision(&self) -> Option<GuardDecision> {
        self.last
    }
}

/// Re-evaluate `guard` on every auth state change until the manager goes away.
pub async fn watch_guard<F>(mut states: watch::Receiver<AuthState>, mut guard: RouteGuard<F>)
where
    F: Fn(&str, NavigateOptions),
{
    loop {
        let state = states.borrow_and_update().clone();
        guard.evaluate(&state);
        if states.changed().await.is_err() {
            break;
        }
    }
    tracing::debug!("route guard stopped: auth state closed");
}

//! Auth-session state for the current user.
//!
//! SYSTEM CONTEXT
//! ==============
//! Used by route guards and user-aware views to coordinate login redirects
//! and identity-dependent rendering.

#[cfg(test)]
#[path = "auth_test.rs"]
mod auth_test;

use crate::net::error::AuthError;
use crate::net::types::{AuthEvent, Session, User};

/// Authentication state tracking the current user, session, and loading status.
///
/// `user` is always derived from `session`, so the two are present or absent
/// together.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthState {
    pub user: Option<User>,
    pub session: Option<Session>,
    /// True until the first auth event arrives, and while an operation runs.
    pub loading: bool,
    /// Most recent auth failure, kept for passive display.
    pub last_error: Option<AuthError>,
}

impl Default for AuthState {
    fn default() -> Self {
        Self { user: None, session: None, loading: true, last_error: None }
    }
}

impl AuthState {
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    /// Replace the session/user pair from an event payload.
    ///
    /// Events carrying an error clear credentials regardless of payload.
    pub fn apply_event(&mut self, event: AuthEvent) {
        let session = match event.error {
            Some(error) => {
                self.last_error = Some(error);
                None
            }
            None => event.session,
        };
        self.user = session.as_ref().map(|s| s.user.clone());
        self.session = session;
    }
}

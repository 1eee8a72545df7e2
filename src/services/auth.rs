//! Auth backend seam: the operations the session manager consumes from the
//! hosted backend, plus helpers shared by every implementation.
//!
//! ARCHITECTURE
//! ============
//! Backends publish auth events over per-subscriber unbounded channels. The
//! first message on a fresh subscription is always `INITIAL_SESSION`, queued
//! under the same lock as later publishes, so each subscriber sees events in
//! emission order. Dropping the receiver is the unsubscribe.

#[cfg(test)]
#[path = "auth_test.rs"]
mod auth_test;

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use url::Url;

use crate::net::error::{AuthError, AuthOutcome};
use crate::net::types::{AuthEvent, Provider, SignInOptions};

/// Minimum password length accepted at sign-up.
pub const MIN_PASSWORD_LEN: usize = 6;

/// Receiving half of an auth-event subscription.
pub type AuthSubscription = mpsc::UnboundedReceiver<AuthEvent>;

/// Operations consumed from the hosted auth backend.
///
/// None of these return the new session: successful calls publish an event
/// instead, which is the only path by which local state changes.
#[async_trait::async_trait]
pub trait AuthBackend: Send + Sync {
    /// Register a listener. Dropping the receiver unregisters it.
    fn subscribe(&self) -> AuthSubscription;

    async fn sign_up(&self, email: &str, password: &str, metadata: Map<String, Value>) -> AuthOutcome;

    async fn sign_in_with_password(&self, email: &str, password: &str, options: SignInOptions) -> AuthOutcome;

    /// Prepare a redirect-based federated sign-in and return the URL the user
    /// agent must visit. Completion arrives later as an event.
    async fn sign_in_with_oauth(&self, provider: Provider, redirect_to: &str) -> Result<Url, AuthError>;

    async fn sign_out(&self) -> AuthOutcome;
}

/// Sends the user agent to an OAuth authorize URL.
pub trait RedirectHandler: Send + Sync {
    /// # Errors
    ///
    /// Returns a `provider_error` when the redirect cannot be initiated.
    fn open(&self, url: &Url) -> AuthOutcome;
}

/// Redirect handler that only records the URL in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRedirect;

impl RedirectHandler for LogRedirect {
    fn open(&self, url: &Url) -> AuthOutcome {
        tracing::info!(%url, "open this URL to continue sign-in");
        Ok(())
    }
}

// =============================================================================
// EVENT FAN-OUT
// =============================================================================

/// Ordered fan-out of auth events to every live subscriber.
#[derive(Debug, Default)]
pub struct Subscribers {
    senders: Mutex<Vec<mpsc::UnboundedSender<AuthEvent>>>,
}

impl Subscribers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<AuthEvent>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscriber, optionally queueing its initial event first.
    pub fn add(&self, initial: Option<AuthEvent>) -> AuthSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut senders = self.lock();
        if let Some(event) = initial {
            if tx.send(event).is_err() {
                return rx;
            }
        }
        senders.push(tx);
        tracing::debug!(subscribers = senders.len(), "auth listener registered");
        rx
    }

    /// Deliver an event to all subscribers, pruning the ones that went away.
    pub fn publish(&self, event: &AuthEvent) {
        let mut senders = self.lock();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        tracing::debug!(kind = %event.kind, subscribers = senders.len(), "auth event published");
    }

    /// Number of live subscribers as of the last publish.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut senders = self.lock();
        senders.retain(|tx| !tx.is_closed());
        senders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// SHARED HELPERS
// =============================================================================

/// Local checks run before a sign-up reaches the backend.
///
/// # Errors
///
/// Returns a `validation` error describing the first failed check.
pub fn validate_sign_up(email: &str, password: &str, display_name: &str) -> AuthOutcome {
    validate_email(email)?;
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::validation(format!(
            "Password should be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if display_name.trim().is_empty() {
        return Err(AuthError::validation("Full name is required"));
    }
    Ok(())
}

/// Shape check for an email address: one `@`, non-empty local part, dotted domain.
///
/// # Errors
///
/// Returns a `validation` error when the address is malformed.
pub fn validate_email(email: &str) -> AuthOutcome {
    let invalid = || AuthError::validation(format!("Unable to validate email address: {email}"));
    let trimmed = email.trim();
    let (local, domain) = trimmed.split_once('@').ok_or_else(invalid)?;
    let domain_ok = !domain.contains('@')
        && domain.split('.').count() >= 2
        && domain.split('.').all(|label| !label.is_empty());
    if local.is_empty() || !domain_ok || trimmed.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    Ok(())
}

/// Profile metadata attached to a new account.
#[must_use]
pub fn sign_up_metadata(display_name: &str) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("full_name".to_owned(), Value::String(display_name.trim().to_owned()));
    metadata
}

/// Build the backend's OAuth authorize URL for `provider`.
///
/// # Errors
///
/// Returns a `provider_error` if the base URL cannot be joined.
pub fn authorize_url(base_url: &str, provider: Provider, redirect_to: &str) -> Result<Url, AuthError> {
    let mut url = Url::parse(&format!("{base_url}/auth/v1/authorize"))
        .map_err(|e| AuthError::provider(format!("cannot build authorize URL: {e}")))?;
    url.query_pairs_mut()
        .append_pair("provider", provider.as_str())
        .append_pair("redirect_to", redirect_to);
    Ok(url)
}

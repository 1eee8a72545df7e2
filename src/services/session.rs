//! Session manager: the single source of truth for who is signed in.
//!
//! ARCHITECTURE
//! ============
//! One listener task drains the backend's auth-event subscription and is the
//! only writer of `user`/`session`. Operations never write credentials; they
//! only bracket themselves with an in-flight guard (driving `loading`) and
//! record failures. UI observers read snapshots from a `watch` channel.
//!
//! Lifecycle bookkeeping (liveness, first-event seen, in-flight count) sits
//! behind one mutex that is held across every state write, so teardown and a
//! just-delivered event cannot interleave: once `shutdown` flips liveness,
//! no later event or operation completion touches state.
//!
//! TRADE-OFFS
//! ==========
//! `loading` is derived (`!initialized || in_flight > 0`) rather than toggled,
//! so overlapping operations cannot clear each other's loading window.

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{DEFAULT_SITE_URL, HuddleConfig, OAUTH_LANDING_PATH};
use crate::net::error::{AuthError, AuthOutcome};
use crate::net::types::{AuthEvent, Provider, SignInOptions};
use crate::services::auth::{AuthBackend, RedirectHandler, sign_up_metadata, validate_sign_up};
use crate::state::auth::AuthState;

/// Tunables for a [`SessionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    /// Where OAuth providers send the browser back to.
    pub redirect_to: String,
    /// Upper bound on each operation; `None` waits indefinitely.
    pub op_timeout: Option<Duration>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self { redirect_to: format!("{DEFAULT_SITE_URL}{OAUTH_LANDING_PATH}"), op_timeout: None }
    }
}

impl ManagerOptions {
    #[must_use]
    pub fn from_config(config: &HuddleConfig) -> Self {
        Self { redirect_to: config.oauth_redirect_to(), op_timeout: config.op_timeout() }
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

struct Lifecycle {
    alive: bool,
    initialized: bool,
    in_flight: usize,
}

impl Lifecycle {
    fn loading(&self) -> bool {
        !self.initialized || self.in_flight > 0
    }
}

struct Shared {
    state: watch::Sender<AuthState>,
    lifecycle: Mutex<Lifecycle>,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(AuthState::default());
        Self { state, lifecycle: Mutex::new(Lifecycle { alive: true, initialized: false, in_flight: 0 }) }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one event. Returns `false` once the manager has been torn down.
    fn apply_event(&self, event: AuthEvent) -> bool {
        let mut life = self.lock();
        if !life.alive {
            tracing::debug!(kind = %event.kind, "auth event ignored after teardown");
            return false;
        }
        life.initialized = true;
        let loading = life.loading();
        let kind = event.kind;
        if let Some(error) = &event.error {
            tracing::warn!(%kind, error = %error, "auth event cleared session");
        }
        self.state.send_modify(|state| {
            state.apply_event(event);
            state.loading = loading;
        });
        match self.state.borrow().user.as_ref() {
            Some(user) => tracing::info!(%kind, user_id = %user.id, "auth state updated"),
            None => tracing::info!(%kind, "auth state updated: signed out"),
        }
        true
    }

    fn begin_op(&self) -> bool {
        let mut life = self.lock();
        if !life.alive {
            return false;
        }
        life.in_flight += 1;
        self.state.send_if_modified(|state| !std::mem::replace(&mut state.loading, true));
        true
    }

    fn end_op(&self) {
        let mut life = self.lock();
        life.in_flight = life.in_flight.saturating_sub(1);
        if !life.alive {
            return;
        }
        let loading = life.loading();
        self.state.send_if_modified(|state| std::mem::replace(&mut state.loading, loading) != loading);
    }

    fn record(&self, outcome: &AuthOutcome) {
        let life = self.lock();
        if !life.alive {
            return;
        }
        let last_error = outcome.as_ref().err().cloned();
        self.state.send_if_modified(|state| {
            if state.last_error == last_error {
                return false;
            }
            state.last_error = last_error;
            true
        });
    }
}

/// Scoped in-flight marker; dropping it releases `loading` on every exit path.
struct InFlight<'a> {
    shared: &'a Shared,
}

impl<'a> InFlight<'a> {
    fn begin(shared: &'a Shared) -> Option<Self> {
        shared.begin_op().then_some(Self { shared })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.shared.end_op();
    }
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// Owns auth state and exposes the four auth operations.
///
/// Construct one per application and hand out `Arc<SessionManager>` handles.
pub struct SessionManager {
    shared: Arc<Shared>,
    backend: Arc<dyn AuthBackend>,
    redirect: Arc<dyn RedirectHandler>,
    options: ManagerOptions,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Subscribe to `backend` and start applying its events.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(backend: Arc<dyn AuthBackend>, redirect: Arc<dyn RedirectHandler>, options: ManagerOptions) -> Self {
        let shared = Arc::new(Shared::new());
        let mut events = backend.subscribe();
        let listener_shared = Arc::clone(&shared);
        let listener = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !listener_shared.apply_event(event) {
                    break;
                }
            }
            tracing::debug!("auth event stream closed");
        });
        tracing::info!("auth listener registered");
        Self { shared, backend, redirect, options, listener: Mutex::new(Some(listener)) }
    }

    /// Current state snapshot.
    #[must_use]
    pub fn snapshot(&self) -> AuthState {
        self.shared.state.borrow().clone()
    }

    /// Observe every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.shared.state.subscribe()
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared.lock().alive
    }

    /// Create an account. The session, if the backend issues one right away,
    /// arrives through the event stream.
    pub async fn sign_up(&self, email: &str, password: &str, display_name: &str) -> AuthOutcome {
        self.run("sign_up", async {
            validate_sign_up(email, password, display_name)?;
            self.backend.sign_up(email.trim(), password, sign_up_metadata(display_name)).await
        })
        .await
    }

    /// Password sign-in. `remember_me` asks the backend to persist the session.
    pub async fn sign_in(&self, email: &str, password: &str, remember_me: bool) -> AuthOutcome {
        let options = SignInOptions { persist_session: remember_me };
        self.run("sign_in", self.backend.sign_in_with_password(email.trim(), password, options))
            .await
    }

    /// Start a federated sign-in by redirecting to the provider.
    pub async fn sign_in_with_provider(&self, provider: Provider) -> AuthOutcome {
        self.run("sign_in_with_provider", async {
            let url = self.backend.sign_in_with_oauth(provider, &self.options.redirect_to).await?;
            tracing::info!(%provider, "redirecting to identity provider");
            self.redirect.open(&url)
        })
        .await
    }

    /// Sign out. Local state is cleared only once the backend confirms.
    ///
    /// Always forwarded: the snapshot may not have caught up with a sign-in
    /// that just resolved, and the backend treats "no session" as a no-op.
    pub async fn sign_out(&self) -> AuthOutcome {
        self.run("sign_out", self.backend.sign_out()).await
    }

    /// Unregister from the backend. Safe to call more than once.
    pub fn shutdown(&self) {
        {
            let mut life = self.shared.lock();
            if !life.alive {
                return;
            }
            life.alive = false;
        }
        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = listener {
            handle.abort();
        }
        tracing::info!("auth listener unregistered");
    }

    async fn run<F>(&self, op: &'static str, fut: F) -> AuthOutcome
    where
        F: Future<Output = AuthOutcome>,
    {
        let Some(_in_flight) = InFlight::begin(&self.shared) else {
            return Err(AuthError::transient("session manager has been shut down"));
        };
        let outcome = match self.options.op_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(outcome) => outcome,
                Err(_) => Err(AuthError::transient(format!("{op} timed out after {}s", limit.as_secs_f32()))),
            },
            None => fut.await,
        };
        if let Err(err) = &outcome {
            tracing::warn!(op, kind = %err.kind, error = %err.message, "auth operation failed");
        }
        self.shared.record(&outcome);
        outcome
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

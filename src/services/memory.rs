//! In-process auth backend for tests and offline development.
//!
//! DESIGN
//! ======
//! Accounts live in a `HashMap` keyed by lowercase email. Behavior mirrors the
//! hosted backend closely enough to drive the session manager: successful
//! calls publish events rather than returning sessions, and sign-in errors
//! use the same messages the real service sends. Tests can inject failures,
//! add latency, or push arbitrary events.

#[cfg(test)]
#[path = "memory_test.rs"]
mod memory_test;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value};
use url::Url;
use uuid::Uuid;

use crate::net::error::{AuthError, AuthOutcome};
use crate::net::types::{AuthEvent, Provider, Session, SignInOptions, User, unix_now};
use crate::services::auth::{AuthBackend, AuthSubscription, Subscribers, authorize_url, validate_sign_up};

/// Base URL used for authorize links handed out by the memory backend.
pub const MEMORY_BACKEND_URL: &str = "http://localhost:54321";

const SESSION_TTL_SECS: i64 = 3600;

struct Account {
    password: String,
    user: User,
    locked: bool,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    current: Option<Session>,
    providers: HashSet<Provider>,
    failures: VecDeque<AuthError>,
    latency: Option<Duration>,
    last_sign_in: Option<SignInOptions>,
    sign_out_calls: usize,
}

/// Auth backend backed by an in-memory account table.
pub struct MemoryAuthBackend {
    inner: Mutex<Inner>,
    subscribers: Subscribers,
    /// Whether new subscribers get `INITIAL_SESSION` immediately.
    announce_initial: bool,
    /// Whether sign-up signs the new account in straight away.
    auto_confirm: bool,
}

impl Default for MemoryAuthBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAuthBackend {
    /// Backend that announces the current session to each new subscriber.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            subscribers: Subscribers::new(),
            announce_initial: true,
            auto_confirm: true,
        }
    }

    /// Backend that stays silent until [`MemoryAuthBackend::emit`] is called,
    /// for exercising the window before the first event.
    #[must_use]
    pub fn deferred() -> Self {
        Self { announce_initial: false, ..Self::new() }
    }

    /// Sign-ups leave the account unconfirmed instead of signing it in.
    #[must_use]
    pub fn requiring_confirmation(mut self) -> Self {
        self.auto_confirm = false;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed an account.
    #[must_use]
    pub fn with_account(self, email: &str, password: &str, display_name: &str) -> Self {
        let user = new_user(email, &crate::services::auth::sign_up_metadata(display_name));
        self.lock().accounts.insert(
            email.to_ascii_lowercase(),
            Account { password: password.to_owned(), user, locked: false },
        );
        self
    }

    #[must_use]
    pub fn with_provider(self, provider: Provider) -> Self {
        self.lock().providers.insert(provider);
        self
    }

    /// Start with an already-restored session.
    #[must_use]
    pub fn with_session(self, session: Session) -> Self {
        self.lock().current = Some(session);
        self
    }

    pub fn lock_account(&self, email: &str) {
        if let Some(account) = self.lock().accounts.get_mut(&email.to_ascii_lowercase()) {
            account.locked = true;
        }
    }

    /// Make the next operation fail with `error`. Queued failures are consumed
    /// in order, one per call.
    pub fn fail_next(&self, error: AuthError) {
        self.lock().failures.push_back(error);
    }

    /// Delay every operation by `latency` before it is processed.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Publish an arbitrary event, adopting its session as current.
    pub fn emit(&self, event: AuthEvent) {
        let mut inner = self.lock();
        self.publish_locked(&mut inner, &event);
    }

    /// Adopt and publish while the caller holds `inner`, so a concurrent
    /// subscriber never sees an initial session older than a queued event.
    fn publish_locked(&self, inner: &mut Inner, event: &AuthEvent) {
        inner.current.clone_from(&event.session);
        self.subscribers.publish(event);
    }

    #[must_use]
    pub fn current_session(&self) -> Option<Session> {
        self.lock().current.clone()
    }

    #[must_use]
    pub fn last_sign_in_options(&self) -> Option<SignInOptions> {
        self.lock().last_sign_in
    }

    #[must_use]
    pub fn sign_out_calls(&self) -> usize {
        self.lock().sign_out_calls
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    async fn begin(&self) -> AuthOutcome {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match self.lock().failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn start_session(&self, user: User) {
        let session = issue_session(user);
        tracing::debug!(user_id = %session.user.id, "memory backend issued session");
        self.emit(AuthEvent::signed_in(session));
    }
}

fn new_user(email: &str, metadata: &Map<String, Value>) -> User {
    let mut user = User::new(Uuid::new_v4().to_string()).with_email(email.trim());
    user.user_metadata.clone_from(metadata);
    user.app_metadata.insert("provider".to_owned(), Value::String("email".to_owned()));
    user
}

fn issue_session(user: User) -> Session {
    Session {
        access_token: Uuid::new_v4().simple().to_string(),
        refresh_token: Uuid::new_v4().simple().to_string(),
        token_type: "bearer".to_owned(),
        expires_in: SESSION_TTL_SECS,
        expires_at: Some(unix_now() + SESSION_TTL_SECS),
        user,
    }
}

#[async_trait::async_trait]
impl AuthBackend for MemoryAuthBackend {
    fn subscribe(&self) -> AuthSubscription {
        let inner = self.lock();
        let initial = self.announce_initial.then(|| AuthEvent::initial(inner.current.clone()));
        self.subscribers.add(initial)
    }

    async fn sign_up(&self, email: &str, password: &str, metadata: Map<String, Value>) -> AuthOutcome {
        self.begin().await?;
        let display_name = metadata.get("full_name").and_then(Value::as_str).unwrap_or_default();
        validate_sign_up(email, password, display_name)?;

        let key = email.trim().to_ascii_lowercase();
        let user = {
            let mut inner = self.lock();
            if inner.accounts.contains_key(&key) {
                return Err(AuthError::conflict("User already registered"));
            }
            let user = new_user(email, &metadata);
            inner.accounts.insert(key, Account { password: password.to_owned(), user: user.clone(), locked: false });
            user
        };

        if self.auto_confirm {
            self.start_session(user);
        }
        Ok(())
    }

    async fn sign_in_with_password(&self, email: &str, password: &str, options: SignInOptions) -> AuthOutcome {
        self.begin().await?;
        let user = {
            let mut inner = self.lock();
            inner.last_sign_in = Some(options);
            let account = inner
                .accounts
                .get(&email.trim().to_ascii_lowercase())
                .ok_or_else(|| AuthError::invalid_credentials("Invalid login credentials"))?;
            if account.locked {
                return Err(AuthError::account_locked("User is banned"));
            }
            if account.password != password {
                return Err(AuthError::invalid_credentials("Invalid login credentials"));
            }
            account.user.clone()
        };
        self.start_session(user);
        Ok(())
    }

    async fn sign_in_with_oauth(&self, provider: Provider, redirect_to: &str) -> Result<Url, AuthError> {
        self.begin().await?;
        if !self.lock().providers.contains(&provider) {
            return Err(AuthError::provider(format!("Unsupported provider: {provider} is not enabled")));
        }
        authorize_url(MEMORY_BACKEND_URL, provider, redirect_to)
    }

    async fn sign_out(&self) -> AuthOutcome {
        self.begin().await?;
        let mut inner = self.lock();
        inner.sign_out_calls += 1;
        if inner.current.is_some() {
            self.publish_locked(&mut inner, &AuthEvent::signed_out());
        }
        Ok(())
    }
}

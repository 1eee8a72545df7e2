//! REST client for the hosted backend's auth API (GoTrue-compatible).
//!
//! ARCHITECTURE
//! ============
//! `HttpAuthBackend` plays the part of the vendor SDK: it owns the current
//! tokens, publishes auth events, restores a remembered session at startup,
//! refreshes access tokens ahead of expiry, and finishes OAuth redirects by
//! reading tokens from the redirect URL fragment.
//!
//! Every session change is written to the store and published while one lock
//! is held, so a new subscriber's `INITIAL_SESSION` can never be older than an
//! event it also receives. A refresh only lands if the session it started
//! from is still current; a sign-out or new sign-in that happened meanwhile
//! wins.
//!
//! ERROR HANDLING
//! ==============
//! Every failure is an `AuthError`. Session-store problems are logged and
//! never fail an auth call. A definitive refresh failure signs the user out
//! with an event carrying the error; transient ones are retried with
//! exponential backoff plus jitter.

#[cfg(test)]
#[path = "gotrue_test.rs"]
mod gotrue_test;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::HuddleConfig;
use crate::net::error::{AuthError, AuthFlow, AuthOutcome, ErrorBody, classify, transport_error};
use crate::net::types::{AuthEvent, AuthEventKind, Provider, Session, SignInOptions, User, unix_now};
use crate::services::auth::{AuthBackend, AuthSubscription, Subscribers, authorize_url};
use crate::services::store::SessionStore;

const MAX_REFRESH_ATTEMPTS: u32 = 5;
const MAX_BACKOFF_SECS: u64 = 30;
const BACKOFF_JITTER_MS: u64 = 500;

#[derive(Default)]
struct Current {
    session: Option<Session>,
    /// Whether the current session should be written to the store.
    persist: bool,
}

#[derive(Debug, serde::Deserialize)]
struct Settings {
    #[serde(default)]
    external: Map<String, Value>,
}

/// Auth backend speaking the hosted service's REST API.
pub struct HttpAuthBackend {
    base_url: String,
    anon_key: String,
    refresh_margin: i64,
    http: reqwest::Client,
    current: Mutex<Current>,
    store: Arc<dyn SessionStore>,
    subscribers: Subscribers,
    changed: Arc<Notify>,
}

impl HttpAuthBackend {
    /// Build a backend with no session loaded.
    ///
    /// # Errors
    ///
    /// Returns a `transient` error if the HTTP client cannot be constructed.
    pub fn new(config: &HuddleConfig, store: Arc<dyn SessionStore>) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.request_secs))
            .connect_timeout(Duration::from_secs(config.timeouts.connect_secs))
            .build()
            .map_err(|e| AuthError::transient(format!("cannot build http client: {e}")))?;
        Ok(Self {
            base_url: config.backend_url.clone(),
            anon_key: config.anon_key.clone(),
            refresh_margin: i64::try_from(config.refresh_margin_secs).unwrap_or(i64::MAX),
            http,
            current: Mutex::new(Current::default()),
            store,
            subscribers: Subscribers::new(),
            changed: Arc::new(Notify::new()),
        })
    }

    /// Build a backend and restore any remembered session before the first
    /// subscriber is announced.
    ///
    /// # Errors
    ///
    /// Returns a `transient` error if the HTTP client cannot be constructed.
    pub async fn connect(config: &HuddleConfig, store: Arc<dyn SessionStore>) -> Result<Arc<Self>, AuthError> {
        let backend = Arc::new(Self::new(config, store)?);
        backend.restore().await;
        Ok(backend)
    }

    fn lock(&self) -> MutexGuard<'_, Current> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/auth/v1/{path}", self.base_url)
    }

    #[must_use]
    pub fn current_session(&self) -> Option<Session> {
        self.lock().session.clone()
    }

    // =========================================================================
    // STATE + STORE
    // =========================================================================

    /// Swap the current session, sync the store and publish `event` atomically.
    fn commit(&self, session: Option<Session>, persist: Option<bool>, event: &AuthEvent) {
        self.commit_where(None, session, persist, event);
    }

    /// Like `commit`, but only while the current session still carries
    /// `refresh_token`. Returns whether the commit happened.
    fn commit_if_current(
        &self,
        refresh_token: &str,
        session: Option<Session>,
        persist: Option<bool>,
        event: &AuthEvent,
    ) -> bool {
        self.commit_where(Some(refresh_token), session, persist, event)
    }

    /// The store follows the session: a persisted session is saved, a
    /// non-persisted one or a sign-out clears it. A refresh (`persist` unset)
    /// of a non-persisted session leaves the store alone.
    fn commit_where(
        &self,
        expected: Option<&str>,
        session: Option<Session>,
        persist: Option<bool>,
        event: &AuthEvent,
    ) -> bool {
        {
            let mut current = self.lock();
            if let Some(expected) = expected
                && !current.session.as_ref().is_some_and(|s| s.refresh_token == expected)
            {
                return false;
            }
            if let Some(persist) = persist {
                current.persist = persist;
            }
            match &session {
                Some(session) if current.persist => self.save_store(session),
                Some(_) if persist.is_none() => {}
                _ => self.clear_store(),
            }
            current.session = session;
            self.subscribers.publish(event);
        }
        self.changed.notify_one();
        true
    }

    fn adopt(&self, session: Session, persist: bool, kind: AuthEventKind) {
        let session = session.with_expiry_from(unix_now());
        tracing::info!(user_id = %session.user.id, %kind, persist, "session established");
        let event = AuthEvent::new(kind, Some(session.clone()));
        self.commit(Some(session), Some(persist), &event);
    }

    fn invalidate(&self, error: AuthError) {
        tracing::warn!(error = %error, "session invalidated");
        self.commit(None, Some(false), &AuthEvent::invalidated(error));
    }

    fn save_store(&self, session: &Session) {
        if let Err(e) = self.store.save(session) {
            tracing::warn!(error = %e, "failed to persist session");
        }
    }

    fn clear_store(&self) {
        if let Err(e) = self.store.clear() {
            tracing::warn!(error = %e, "failed to clear stored session");
        }
    }

    /// Load a remembered session, refreshing it first if it has expired.
    pub async fn restore(&self) {
        let stored = match self.store.load() {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable stored session");
                self.clear_store();
                None
            }
        };
        let Some(session) = stored else {
            tracing::debug!("no stored session");
            return;
        };

        if !session.is_expired(unix_now(), self.refresh_margin) {
            tracing::info!(user_id = %session.user.id, "restored stored session");
            let mut current = self.lock();
            current.session = Some(session);
            current.persist = true;
            return;
        }

        match self.request_refresh(&session.refresh_token).await {
            Ok(fresh) => {
                tracing::info!(user_id = %fresh.user.id, "restored and refreshed stored session");
                self.save_store(&fresh);
                let mut current = self.lock();
                current.session = Some(fresh);
                current.persist = true;
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "could not refresh stored session; starting signed out");
            }
            Err(e) => {
                tracing::warn!(error = %e, "stored session rejected; clearing it");
                self.clear_store();
            }
        }
    }

    // =========================================================================
    // HTTP
    // =========================================================================

    async fn execute(&self, flow: AuthFlow, request: reqwest::RequestBuilder) -> Result<reqwest::Response, AuthError> {
        let response = request
            .header("apikey", &self.anon_key)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.json::<ErrorBody>().await.unwrap_or_default();
        Err(classify(flow, status.as_u16(), &body))
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        flow: AuthFlow,
        request: reqwest::RequestBuilder,
    ) -> Result<T, AuthError> {
        self.execute(flow, request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| transport_error(&e))
    }

    async fn request_refresh(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let request = self
            .http
            .post(self.endpoint("token?grant_type=refresh_token"))
            .json(&json!({ "refresh_token": refresh_token }));
        let session: Session = self.execute_json(AuthFlow::RefreshGrant, request).await?;
        Ok(session.with_expiry_from(unix_now()))
    }

    /// Fetch the user that owns `access_token`.
    ///
    /// # Errors
    ///
    /// Returns `invalid_credentials` for a rejected token, `transient` otherwise.
    pub async fn fetch_user(&self, access_token: &str) -> Result<User, AuthError> {
        let request = self.http.get(self.endpoint("user")).bearer_auth(access_token);
        self.execute_json(AuthFlow::FetchUser, request).await
    }

    async fn check_provider(&self, provider: Provider) -> AuthOutcome {
        let settings: Settings = self
            .execute_json(AuthFlow::OAuth, self.http.get(self.endpoint("settings")))
            .await?;
        let enabled = settings
            .external
            .get(provider.as_str())
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if enabled {
            Ok(())
        } else {
            Err(AuthError::provider(format!("Unsupported provider: {provider} is not enabled")))
        }
    }

    // =========================================================================
    // SESSION MAINTENANCE
    // =========================================================================

    /// Exchange the refresh token for a new session and publish it.
    ///
    /// # Errors
    ///
    /// Transient failures are returned as-is. Any other failure also clears
    /// the session and publishes a `SIGNED_OUT` event carrying the error.
    ///
    /// If the session was replaced or signed out while the request was in
    /// flight, the outcome is discarded and a `conflict` error returned.
    pub async fn refresh_session(&self) -> Result<Session, AuthError> {
        let Some(current) = self.current_session() else {
            return Err(AuthError::invalid_credentials("no session to refresh"));
        };
        let used = current.refresh_token.as_str();
        let superseded = || {
            tracing::debug!(user_id = %current.user.id, "session changed during refresh; discarding result");
            AuthError::conflict("session changed during refresh")
        };
        match self.request_refresh(used).await {
            Ok(session) => {
                let event = AuthEvent::token_refreshed(session.clone());
                if !self.commit_if_current(used, Some(session.clone()), None, &event) {
                    return Err(superseded());
                }
                tracing::debug!(user_id = %session.user.id, "access token refreshed");
                Ok(session)
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                if !self.commit_if_current(used, None, Some(false), &AuthEvent::invalidated(e.clone())) {
                    return Err(superseded());
                }
                tracing::warn!(error = %e, "session invalidated");
                Err(e)
            }
        }
    }

    async fn refresh_with_retry(&self) {
        for attempt in 0..MAX_REFRESH_ATTEMPTS {
            match self.refresh_session().await {
                Ok(_) => return,
                Err(e) if e.is_transient() => {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(attempt, error = %e, retry_in_secs = delay.as_secs_f64(), "token refresh failed");
                    tokio::time::sleep(delay).await;
                }
                Err(_) => return,
            }
        }
        self.invalidate(AuthError::transient("token refresh kept failing"));
    }

    fn refresh_delay(&self) -> Option<Duration> {
        let current = self.lock();
        current
            .session
            .as_ref()
            .map(|s| Duration::from_secs(s.refresh_in(unix_now(), self.refresh_margin)))
    }

    /// Keep the access token fresh in the background.
    ///
    /// The task sleeps until `refresh_margin` before expiry, wakes early when
    /// the session changes, and exits once the backend is dropped.
    #[must_use]
    pub fn spawn_auto_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let changed = Arc::clone(&self.changed);
        tokio::spawn(async move {
            loop {
                let delay = match weak.upgrade() {
                    Some(backend) => backend.refresh_delay(),
                    None => break,
                };
                match delay {
                    None => changed.notified().await,
                    Some(delay) => {
                        tracing::debug!(refresh_in_secs = delay.as_secs(), "token refresh scheduled");
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {
                                let Some(backend) = weak.upgrade() else { break };
                                backend.refresh_with_retry().await;
                            }
                            () = changed.notified() => {}
                        }
                    }
                }
            }
            tracing::debug!("auto-refresh stopped");
        })
    }

    /// Finish an OAuth sign-in from the URL the provider redirected to.
    ///
    /// # Errors
    ///
    /// Returns `provider_error` when the redirect reports an error or lacks
    /// tokens, and the `fetch_user` error if the token is rejected.
    pub async fn complete_redirect(&self, redirect: &Url) -> AuthOutcome {
        let params = redirect_params(redirect);
        if let Some(error) = params.get("error") {
            let description = params.get("error_description").unwrap_or(error);
            return Err(AuthError::provider(description.clone()));
        }
        let access_token = params
            .get("access_token")
            .ok_or_else(|| AuthError::provider("redirect URL carries no access token"))?;
        let refresh_token = params
            .get("refresh_token")
            .ok_or_else(|| AuthError::provider("redirect URL carries no refresh token"))?;

        let user = self.fetch_user(access_token).await?;
        let session = Session {
            access_token: access_token.clone(),
            refresh_token: refresh_token.clone(),
            token_type: params.get("token_type").cloned().unwrap_or_else(|| "bearer".to_owned()),
            expires_in: params.get("expires_in").and_then(|v| parse_i64(v)).unwrap_or(3600),
            expires_at: params.get("expires_at").and_then(|v| parse_i64(v)),
            user,
        };
        self.adopt(session, true, AuthEventKind::SignedIn);
        Ok(())
    }
}

impl Drop for HttpAuthBackend {
    fn drop(&mut self) {
        // Wake the auto-refresh task so it notices the backend is gone.
        self.changed.notify_one();
    }
}

/// Query and fragment parameters of a redirect URL; fragment values win.
pub(crate) fn redirect_params(url: &Url) -> HashMap<String, String> {
    let mut params: HashMap<String, String> = url.query_pairs().into_owned().collect();
    if let Some(fragment) = url.fragment() {
        params.extend(url::form_urlencoded::parse(fragment.as_bytes()).into_owned());
    }
    params
}

fn parse_i64(raw: &str) -> Option<i64> {
    match raw.parse::<i64>() {
        Ok(value) => Some(value),
        Err(_) => None,
    }
}

/// Exponential backoff capped at `MAX_BACKOFF_SECS`, plus up to half a second
/// of jitter.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let base = 2_u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS);
    let jitter = rand::rng().random_range(0..BACKOFF_JITTER_MS);
    Duration::from_secs(base) + Duration::from_millis(jitter)
}

#[async_trait::async_trait]
impl AuthBackend for HttpAuthBackend {
    fn subscribe(&self) -> AuthSubscription {
        let current = self.lock();
        self.subscribers.add(Some(AuthEvent::initial(current.session.clone())))
    }

    async fn sign_up(&self, email: &str, password: &str, metadata: Map<String, Value>) -> AuthOutcome {
        let request = self
            .http
            .post(self.endpoint("signup"))
            .json(&json!({ "email": email, "password": password, "data": metadata }));
        let body: Value = self.execute_json(AuthFlow::SignUp, request).await?;
        if body.get("access_token").is_some() {
            let session: Session = serde_json::from_value(body)
                .map_err(|e| AuthError::transient(format!("unexpected sign-up response: {e}")))?;
            self.adopt(session, true, AuthEventKind::SignedIn);
        } else {
            tracing::info!("account created; email confirmation required");
        }
        Ok(())
    }

    async fn sign_in_with_password(&self, email: &str, password: &str, options: SignInOptions) -> AuthOutcome {
        let request = self
            .http
            .post(self.endpoint("token?grant_type=password"))
            .json(&json!({ "email": email, "password": password }));
        let session: Session = self.execute_json(AuthFlow::PasswordGrant, request).await?;
        self.adopt(session, options.persist_session, AuthEventKind::SignedIn);
        Ok(())
    }

    async fn sign_in_with_oauth(&self, provider: Provider, redirect_to: &str) -> Result<Url, AuthError> {
        self.check_provider(provider).await?;
        authorize_url(&self.base_url, provider, redirect_to)
    }

    async fn sign_out(&self) -> AuthOutcome {
        let Some(session) = self.current_session() else {
            return Ok(());
        };
        let response = self
            .http
            .post(self.endpoint("logout"))
            .bearer_auth(&session.access_token)
            .header("apikey", &self.anon_key)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        let status = response.status();
        // The server forgetting the session first still counts as signed out.
        if !status.is_success() && !matches!(status.as_u16(), 401 | 403 | 404) {
            let body = response.json::<ErrorBody>().await.unwrap_or_default();
            return Err(classify(AuthFlow::SignOut, status.as_u16(), &body));
        }
        tracing::info!(user_id = %session.user.id, "signed out");
        self.commit(None, Some(false), &AuthEvent::signed_out());
        Ok(())
    }
}

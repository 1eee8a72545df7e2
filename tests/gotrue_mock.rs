//! End-to-end tests of the HTTP backend and session manager against an
//! in-process mock of the hosted auth API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use huddle::config::HuddleConfig;
use huddle::net::error::AuthErrorKind;
use huddle::net::gotrue::HttpAuthBackend;
use huddle::net::types::{Provider, Session, User, unix_now};
use huddle::services::auth::RedirectHandler;
use huddle::services::session::{ManagerOptions, SessionManager};
use huddle::services::store::{MemorySessionStore, SessionStore};
use huddle::state::auth::AuthState;
use serde_json::{Value, json};
use url::Url;

const ANON_KEY: &str = "anon-test-key";

// =============================================================================
// MOCK SERVER
// =============================================================================

#[derive(Default)]
struct MockState {
    /// email -> (password, user json, banned)
    accounts: HashMap<String, (String, Value, bool)>,
    access_tokens: HashMap<String, Value>,
    refresh_tokens: HashMap<String, Value>,
    providers: HashMap<String, bool>,
    issued: usize,
    logout_status: Option<StatusCode>,
    logouts: usize,
    confirm_sign_ups: bool,
    /// Holds refresh grants this long before answering.
    refresh_delay: Option<Duration>,
}

type Mock = Arc<Mutex<MockState>>;

fn user_json(id: &str, email: &str, name: &str) -> Value {
    json!({
        "id": id,
        "email": email,
        "user_metadata": { "full_name": name },
        "app_metadata": { "provider": "email" },
        "created_at": "2024-01-01T00:00:00Z"
    })
}

impl MockState {
    fn issue(&mut self, user: &Value, expires_in: i64) -> Value {
        self.issued += 1;
        let access = format!("at-{}", self.issued);
        let refresh = format!("rt-{}", self.issued);
        self.access_tokens.insert(access.clone(), user.clone());
        self.refresh_tokens.insert(refresh.clone(), user.clone());
        json!({
            "access_token": access,
            "refresh_token": refresh,
            "token_type": "bearer",
            "expires_in": expires_in,
            "expires_at": unix_now() + expires_in,
            "user": user
        })
    }
}

fn mock() -> Mock {
    let mut state = MockState::default();
    state.accounts.insert(
        "alice@example.com".to_owned(),
        ("password1".to_owned(), user_json("u-alice", "alice@example.com", "Alice"), false),
    );
    state.accounts.insert(
        "banned@example.com".to_owned(),
        ("password1".to_owned(), user_json("u-banned", "banned@example.com", "Bob"), true),
    );
    state.providers.insert("github".to_owned(), true);
    state.providers.insert("google".to_owned(), false);
    Arc::new(Mutex::new(state))
}

fn reply(status: StatusCode, body: Value) -> (StatusCode, Json<Value>) {
    (status, Json(body))
}

fn has_api_key(headers: &HeaderMap) -> bool {
    headers.get("apikey").and_then(|v| v.to_str().ok()) == Some(ANON_KEY)
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

async fn token(
    State(mock): State<Mock>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if !has_api_key(&headers) {
        return reply(StatusCode::UNAUTHORIZED, json!({ "message": "Invalid API key" }));
    }
    let grant = query.get("grant_type").map(String::as_str);
    let delay = mock.lock().unwrap().refresh_delay;
    if let (Some("refresh_token"), Some(delay)) = (grant, delay) {
        tokio::time::sleep(delay).await;
    }
    let mut state = mock.lock().unwrap();
    match grant {
        Some("password") => {
            let email = body["email"].as_str().unwrap_or_default();
            let password = body["password"].as_str().unwrap_or_default();
            let Some((expected, user, banned)) = state.accounts.get(email).cloned() else {
                return reply(
                    StatusCode::BAD_REQUEST,
                    json!({ "error": "invalid_grant", "error_description": "Invalid login credentials" }),
                );
            };
            if banned {
                return reply(
                    StatusCode::BAD_REQUEST,
                    json!({ "code": 400, "error_code": "user_banned", "msg": "User is banned" }),
                );
            }
            if expected != password {
                return reply(
                    StatusCode::BAD_REQUEST,
                    json!({ "error": "invalid_grant", "error_description": "Invalid login credentials" }),
                );
            }
            reply(StatusCode::OK, state.issue(&user, 3600))
        }
        Some("refresh_token") => {
            let refresh = body["refresh_token"].as_str().unwrap_or_default();
            match state.refresh_tokens.remove(refresh) {
                Some(user) => reply(StatusCode::OK, state.issue(&user, 3600)),
                None => reply(
                    StatusCode::BAD_REQUEST,
                    json!({
                        "error": "invalid_grant",
                        "error_description": "Invalid Refresh Token: Refresh Token Not Found"
                    }),
                ),
            }
        }
        _ => reply(StatusCode::BAD_REQUEST, json!({ "error": "unsupported_grant_type" })),
    }
}

async fn signup(State(mock): State<Mock>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let mut state = mock.lock().unwrap();
    let email = body["email"].as_str().unwrap_or_default().to_owned();
    if state.accounts.contains_key(&email) {
        return reply(
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({ "code": 422, "error_code": "user_already_exists", "msg": "User already registered" }),
        );
    }
    let name = body["data"]["full_name"].as_str().unwrap_or_default().to_owned();
    let user = user_json(&format!("u-{}", state.accounts.len() + 1), &email, &name);
    let password = body["password"].as_str().unwrap_or_default().to_owned();
    state.accounts.insert(email, (password, user.clone(), false));
    if state.confirm_sign_ups {
        reply(StatusCode::OK, user)
    } else {
        reply(StatusCode::OK, state.issue(&user, 3600))
    }
}

async fn logout(State(mock): State<Mock>, headers: HeaderMap) -> StatusCode {
    let mut state = mock.lock().unwrap();
    state.logouts += 1;
    if let Some(status) = state.logout_status {
        return status;
    }
    match bearer(&headers) {
        Some(token) if state.access_tokens.remove(&token).is_some() => StatusCode::NO_CONTENT,
        _ => StatusCode::UNAUTHORIZED,
    }
}

async fn user(State(mock): State<Mock>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    let state = mock.lock().unwrap();
    match bearer(&headers).and_then(|token| state.access_tokens.get(&token).cloned()) {
        Some(user) => reply(StatusCode::OK, user),
        None => reply(StatusCode::UNAUTHORIZED, json!({ "msg": "invalid JWT" })),
    }
}

async fn settings(State(mock): State<Mock>) -> Json<Value> {
    let state = mock.lock().unwrap();
    let mut external = state.providers.clone();
    external.insert("email".to_owned(), true);
    Json(json!({ "external": external, "disable_signup": false }))
}

async fn serve(mock: Mock) -> String {
    let app = Router::new()
        .route("/auth/v1/token", post(token))
        .route("/auth/v1/signup", post(signup))
        .route("/auth/v1/logout", post(logout))
        .route("/auth/v1/user", get(user))
        .route("/auth/v1/settings", get(settings))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

// =============================================================================
// HARNESS
// =============================================================================

#[derive(Default)]
struct RecordingRedirect {
    opened: Mutex<Vec<Url>>,
}

impl RedirectHandler for RecordingRedirect {
    fn open(&self, url: &Url) -> Result<(), huddle::net::error::AuthError> {
        self.opened.lock().unwrap().push(url.clone());
        Ok(())
    }
}

struct Harness {
    mock: Mock,
    store: Arc<MemorySessionStore>,
    backend: Arc<HttpAuthBackend>,
    redirect: Arc<RecordingRedirect>,
    manager: SessionManager,
}

async fn harness_with(mock: Mock, store: MemorySessionStore) -> Harness {
    harness_configured(mock, store, |_| {}).await
}

async fn harness_configured(mock: Mock, store: MemorySessionStore, configure: impl FnOnce(&mut HuddleConfig)) -> Harness {
    let base = serve(Arc::clone(&mock)).await;
    let mut config = HuddleConfig::new(&base, ANON_KEY).unwrap();
    configure(&mut config);
    let store = Arc::new(store);
    let backend = HttpAuthBackend::connect(&config, store.clone()).await.unwrap();
    let redirect = Arc::new(RecordingRedirect::default());
    let manager = SessionManager::new(backend.clone(), redirect.clone(), ManagerOptions::from_config(&config));
    wait_until(&manager, |s| !s.loading).await;
    Harness { mock, store, backend, redirect, manager }
}

async fn harness() -> Harness {
    harness_with(mock(), MemorySessionStore::new()).await
}

async fn wait_until(manager: &SessionManager, ready: impl Fn(&AuthState) -> bool) -> AuthState {
    let mut states = manager.subscribe();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| ready(s)))
        .await
        .expect("state did not settle")
        .expect("state channel closed")
        .clone()
}

fn stored_session(access: &str, refresh: &str, expires_at: i64) -> Session {
    Session {
        access_token: access.to_owned(),
        refresh_token: refresh.to_owned(),
        token_type: "bearer".to_owned(),
        expires_in: 3600,
        expires_at: Some(expires_at),
        user: User::new("u-alice").with_email("alice@example.com"),
    }
}

// =============================================================================
// PASSWORD SIGN-IN
// =============================================================================

#[tokio::test]
async fn password_sign_in_populates_state_without_persisting() {
    let h = harness().await;
    assert!(h.manager.snapshot().user.is_none());

    h.manager.sign_in("alice@example.com", "password1", false).await.unwrap();
    let state = wait_until(&h.manager, |s| s.user.is_some()).await;

    let user = state.user.unwrap();
    assert_eq!(user.id, "u-alice");
    assert_eq!(user.display_name(), "Alice");
    assert!(!state.loading);
    assert_eq!(h.store.save_count(), 0);
    assert!(h.store.stored().is_none());
}

#[tokio::test]
async fn remember_me_persists_session() {
    let h = harness().await;
    h.manager.sign_in("alice@example.com", "password1", true).await.unwrap();
    wait_until(&h.manager, |s| s.user.is_some()).await;

    let stored = h.store.stored().unwrap();
    assert_eq!(stored.user.id, "u-alice");
    assert!(stored.expires_at.is_some());
    assert_eq!(h.store.save_count(), 1);
}

#[tokio::test]
async fn wrong_password_is_invalid_credentials() {
    let h = harness().await;
    let err = h.manager.sign_in("alice@example.com", "wrong", false).await.unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::InvalidCredentials);
    assert_eq!(err.message, "Invalid login credentials");

    let state = h.manager.snapshot();
    assert!(state.user.is_none());
    assert_eq!(state.last_error, Some(err));
}

#[tokio::test]
async fn banned_account_is_locked() {
    let h = harness().await;
    let err = h.manager.sign_in("banned@example.com", "password1", false).await.unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::AccountLocked);
}

#[tokio::test]
async fn wrong_api_key_is_rejected() {
    let mock = mock();
    let base = serve(Arc::clone(&mock)).await;
    let config = HuddleConfig::new(&base, "not-the-key").unwrap();
    let backend = HttpAuthBackend::connect(&config, Arc::new(MemorySessionStore::new())).await.unwrap();
    let manager = SessionManager::new(backend, Arc::new(RecordingRedirect::default()), ManagerOptions::default());
    wait_until(&manager, |s| !s.loading).await;

    let err = manager.sign_in("alice@example.com", "password1", false).await.unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::InvalidCredentials);
    assert!(manager.snapshot().user.is_none());
}

// =============================================================================
// SIGN-UP
// =============================================================================

#[tokio::test]
async fn sign_up_signs_in_new_account() {
    let h = harness().await;
    h.manager.sign_up("carol@example.com", "secret123", "Carol").await.unwrap();
    let state = wait_until(&h.manager, |s| s.user.is_some()).await;
    assert_eq!(state.user.unwrap().display_name(), "Carol");
}

#[tokio::test]
async fn sign_up_awaiting_confirmation_leaves_user_signed_out() {
    let mock = mock();
    mock.lock().unwrap().confirm_sign_ups = true;
    let h = harness_with(mock, MemorySessionStore::new()).await;

    h.manager.sign_up("dave@example.com", "secret123", "Dave").await.unwrap();
    assert!(h.backend.current_session().is_none());
    assert!(h.manager.snapshot().user.is_none());
    assert!(h.manager.snapshot().last_error.is_none());
}

#[tokio::test]
async fn duplicate_sign_up_is_conflict() {
    let h = harness().await;
    let err = h.manager.sign_up("alice@example.com", "secret123", "Alice").await.unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::Conflict);
    assert_eq!(err.message, "User already registered");
}

#[tokio::test]
async fn invalid_sign_up_never_reaches_server() {
    let h = harness().await;
    let err = h.manager.sign_up("carol@example.com", "123", "Carol").await.unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::Validation);
    assert!(!h.mock.lock().unwrap().accounts.contains_key("carol@example.com"));
}

// =============================================================================
// SIGN-OUT
// =============================================================================

#[tokio::test]
async fn sign_out_clears_state_and_store() {
    let h = harness().await;
    h.manager.sign_in("alice@example.com", "password1", true).await.unwrap();
    wait_until(&h.manager, |s| s.user.is_some()).await;

    h.manager.sign_out().await.unwrap();
    let state = wait_until(&h.manager, |s| s.user.is_none()).await;
    assert!(state.session.is_none());
    assert!(h.store.stored().is_none());
    assert_eq!(h.mock.lock().unwrap().logouts, 1);
}

#[tokio::test]
async fn sign_out_treats_expired_server_session_as_success() {
    let h = harness().await;
    h.manager.sign_in("alice@example.com", "password1", false).await.unwrap();
    wait_until(&h.manager, |s| s.user.is_some()).await;
    h.mock.lock().unwrap().logout_status = Some(StatusCode::NOT_FOUND);

    h.manager.sign_out().await.unwrap();
    wait_until(&h.manager, |s| s.user.is_none()).await;
}

#[tokio::test]
async fn failed_sign_out_keeps_session() {
    let h = harness().await;
    h.manager.sign_in("alice@example.com", "password1", false).await.unwrap();
    wait_until(&h.manager, |s| s.user.is_some()).await;
    h.mock.lock().unwrap().logout_status = Some(StatusCode::SERVICE_UNAVAILABLE);

    let err = h.manager.sign_out().await.unwrap_err();
    assert!(err.is_transient());
    assert!(h.manager.snapshot().user.is_some());
    assert!(h.backend.current_session().is_some());
}

#[tokio::test]
async fn sign_out_when_signed_out_skips_server() {
    let h = harness().await;
    h.manager.sign_out().await.unwrap();
    assert_eq!(h.mock.lock().unwrap().logouts, 0);
}

// =============================================================================
// OAUTH
// =============================================================================

#[tokio::test]
async fn enabled_provider_redirects_to_authorize_url() {
    let h = harness().await;
    h.manager.sign_in_with_provider(Provider::Github).await.unwrap();

    let opened = h.redirect.opened.lock().unwrap().clone();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].path(), "/auth/v1/authorize");
    let query: HashMap<String, String> = opened[0].query_pairs().into_owned().collect();
    assert_eq!(query["provider"], "github");
    assert_eq!(query["redirect_to"], "http://localhost:8080/dashboard");
}

#[tokio::test]
async fn disabled_provider_is_provider_error() {
    let h = harness().await;
    let err = h.manager.sign_in_with_provider(Provider::Google).await.unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::ProviderError);
    assert!(h.redirect.opened.lock().unwrap().is_empty());
}

#[tokio::test]
async fn completed_redirect_signs_in_and_persists() {
    let h = harness().await;
    let access = {
        let mut state = h.mock.lock().unwrap();
        let user = user_json("u-gh", "gh@example.com", "Octo Cat");
        state.issue(&user, 3600)["access_token"].as_str().unwrap().to_owned()
    };
    let url = Url::parse(&format!(
        "http://localhost:8080/dashboard#access_token={access}&refresh_token=rt-x&expires_in=3600&token_type=bearer"
    ))
    .unwrap();

    h.backend.complete_redirect(&url).await.unwrap();
    let state = wait_until(&h.manager, |s| s.user.is_some()).await;
    assert_eq!(state.user.unwrap().id, "u-gh");
    assert_eq!(h.store.stored().unwrap().access_token, access);
}

#[tokio::test]
async fn redirect_with_unknown_token_is_rejected() {
    let h = harness().await;
    let url = Url::parse("http://localhost:8080/dashboard#access_token=forged&refresh_token=rt").unwrap();
    let err = h.backend.complete_redirect(&url).await.unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::InvalidCredentials);
    assert!(h.manager.snapshot().user.is_none());
}

// =============================================================================
// RESTORE + REFRESH
// =============================================================================

#[tokio::test]
async fn valid_stored_session_is_restored_as_initial_session() {
    let session = stored_session("at-stored", "rt-stored", unix_now() + 3600);
    let h = harness_with(mock(), MemorySessionStore::with_session(session)).await;

    let state = h.manager.snapshot();
    assert_eq!(state.user.unwrap().id, "u-alice");
    assert_eq!(state.session.unwrap().access_token, "at-stored");
}

#[tokio::test]
async fn expired_stored_session_is_refreshed_before_announcing() {
    let mock = mock();
    let alice = user_json("u-alice", "alice@example.com", "Alice");
    mock.lock().unwrap().refresh_tokens.insert("rt-stored".to_owned(), alice);
    let session = stored_session("at-stale", "rt-stored", unix_now() - 10);
    let h = harness_with(mock, MemorySessionStore::with_session(session)).await;

    let state = h.manager.snapshot();
    let restored = state.session.unwrap();
    assert_ne!(restored.access_token, "at-stale");
    assert_eq!(restored.user.id, "u-alice");
    assert_eq!(h.store.stored().unwrap().access_token, restored.access_token);
}

#[tokio::test]
async fn rejected_stored_session_starts_signed_out_and_clears_store() {
    let session = stored_session("at-stale", "rt-unknown", unix_now() - 10);
    let h = harness_with(mock(), MemorySessionStore::with_session(session)).await;

    assert!(h.manager.snapshot().user.is_none());
    assert!(h.store.stored().is_none());
    assert!(h.store.load().unwrap().is_none());
}

#[tokio::test]
async fn revoked_refresh_token_signs_out_with_error() {
    let h = harness().await;
    h.manager.sign_in("alice@example.com", "password1", true).await.unwrap();
    wait_until(&h.manager, |s| s.user.is_some()).await;
    h.mock.lock().unwrap().refresh_tokens.clear();

    let err = h.backend.refresh_session().await.unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::InvalidCredentials);

    let state = wait_until(&h.manager, |s| s.user.is_none()).await;
    assert!(state.session.is_none());
    assert_eq!(state.last_error.unwrap().kind, AuthErrorKind::InvalidCredentials);
    assert!(h.store.stored().is_none());
}

#[tokio::test]
async fn refresh_finishing_after_sign_out_is_discarded() {
    let h = harness().await;
    h.manager.sign_in("alice@example.com", "password1", true).await.unwrap();
    wait_until(&h.manager, |s| s.user.is_some()).await;
    h.mock.lock().unwrap().refresh_delay = Some(Duration::from_millis(300));

    let backend = Arc::clone(&h.backend);
    let refresh = tokio::spawn(async move { backend.refresh_session().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.manager.sign_out().await.unwrap();
    wait_until(&h.manager, |s| s.user.is_none()).await;

    let err = refresh.await.unwrap().unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::Conflict);
    assert_eq!(h.mock.lock().unwrap().issued, 2, "the server did answer the refresh");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let state = h.manager.snapshot();
    assert!(state.user.is_none());
    assert!(state.session.is_none());
    assert!(h.backend.current_session().is_none());
    assert!(h.store.stored().is_none());
}

#[tokio::test]
async fn auto_refresh_renews_token_before_expiry() {
    // A margin just under the token lifetime schedules the refresh about a
    // second after sign-in.
    let h = harness_configured(mock(), MemorySessionStore::new(), |config| config.refresh_margin_secs = 3599).await;
    h.manager.sign_in("alice@example.com", "password1", false).await.unwrap();
    let first = wait_until(&h.manager, |s| s.session.is_some()).await.session.unwrap();

    let refresher = h.backend.spawn_auto_refresh();
    let state = wait_until(&h.manager, |s| {
        s.session.as_ref().is_some_and(|session| session.access_token != first.access_token)
    })
    .await;
    refresher.abort();

    assert_eq!(state.user.unwrap().id, "u-alice");
    assert!(state.last_error.is_none());
    assert_eq!(h.store.save_count(), 0);
}

#[tokio::test]
async fn auto_refresh_stops_when_backend_is_dropped() {
    let h = harness().await;
    let refresher = h.backend.spawn_auto_refresh();
    drop(h);
    tokio::time::timeout(Duration::from_secs(5), refresher).await.unwrap().unwrap();
}

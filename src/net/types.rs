//! Shared DTOs for the hosted auth backend boundary.
//!
//! DESIGN
//! ======
//! `User` and `Session` mirror the backend's JSON shapes so token responses
//! deserialize straight into them. Metadata stays an open JSON map because
//! the backend lets each provider contribute arbitrary attributes.

#[cfg(test)]
#[path = "types_test.rs"]
mod types_test;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::net::error::AuthError;

/// Current wall-clock time in unix seconds.
#[must_use]
pub fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

// =============================================================================
// USER
// =============================================================================

/// An authenticated account as reported by the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Unique user identifier.
    pub id: String,
    /// Primary email address, absent for some federated accounts.
    #[serde(default)]
    pub email: Option<String>,
    /// Profile attributes (`full_name`, `avatar_url`, arbitrary keys).
    #[serde(default)]
    pub user_metadata: Map<String, Value>,
    /// Backend-managed attributes such as the sign-in `provider`.
    #[serde(default)]
    pub app_metadata: Map<String, Value>,
    /// Account creation timestamp (RFC 3339), if reported.
    #[serde(default)]
    pub created_at: Option<String>,
}

impl User {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            user_metadata: Map::new(),
            app_metadata: Map::new(),
            created_at: None,
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.user_metadata.insert(key.to_owned(), value.into());
        self
    }

    fn metadata_str(&self, key: &str) -> Option<&str> {
        self.user_metadata
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Name shown in headers and cards.
    ///
    /// Falls back from `full_name` to `name`, then to the email local part,
    /// and finally to the user id.
    #[must_use]
    pub fn display_name(&self) -> String {
        if let Some(name) = self.metadata_str("full_name").or_else(|| self.metadata_str("name")) {
            return name.to_owned();
        }
        match self.email.as_deref().and_then(|e| e.split('@').next()) {
            Some(local) if !local.is_empty() => local.to_owned(),
            _ => self.id.clone(),
        }
    }

    #[must_use]
    pub fn avatar_url(&self) -> Option<&str> {
        self.metadata_str("avatar_url")
    }

    /// Provider that created the current identity (`email`, `github`, ...).
    #[must_use]
    pub fn provider(&self) -> Option<&str> {
        self.app_metadata.get("provider").and_then(Value::as_str)
    }
}

// =============================================================================
// SESSION
// =============================================================================

fn default_token_type() -> String {
    "bearer".to_owned()
}

fn default_expires_in() -> i64 {
    3600
}

/// Backend-issued proof of authentication.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime of the access token in seconds.
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    /// Absolute expiry in unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: User,
}

impl Session {
    /// Fill in `expires_at` from `expires_in` when the backend omitted it.
    ///
    /// Backend-supplied lifetimes are untrusted, so the sum saturates.
    #[must_use]
    pub fn with_expiry_from(mut self, now: i64) -> Self {
        if self.expires_at.is_none() {
            self.expires_at = Some(now.saturating_add(self.expires_in));
        }
        self
    }

    /// Whether the access token is expired, or will be within `margin` seconds.
    ///
    /// A session without a known expiry is treated as expired so it gets
    /// refreshed before use.
    #[must_use]
    pub fn is_expired(&self, now: i64, margin: i64) -> bool {
        match self.expires_at {
            Some(at) => at.saturating_sub(margin) <= now,
            None => true,
        }
    }

    /// Seconds until the token should be refreshed; zero when already due.
    #[must_use]
    pub fn refresh_in(&self, now: i64, margin: i64) -> u64 {
        match self.expires_at {
            Some(at) => u64::try_from(at.saturating_sub(margin).saturating_sub(now)).unwrap_or(0),
            None => 0,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("user", &self.user.id)
            .finish()
    }
}

// =============================================================================
// AUTH EVENTS
// =============================================================================

/// Kind of authentication change reported by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEventKind {
    /// First event for a new subscriber: the restored session, if any.
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

impl AuthEventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitialSession => "INITIAL_SESSION",
            Self::SignedIn => "SIGNED_IN",
            Self::SignedOut => "SIGNED_OUT",
            Self::TokenRefreshed => "TOKEN_REFRESHED",
            Self::UserUpdated => "USER_UPDATED",
        }
    }
}

impl fmt::Display for AuthEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification published on every authentication state change.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    /// The session now in effect; `None` means signed out.
    pub session: Option<Session>,
    /// Set when the change was caused by a failure (e.g. refresh rejected).
    pub error: Option<AuthError>,
}

impl AuthEvent {
    #[must_use]
    pub fn new(kind: AuthEventKind, session: Option<Session>) -> Self {
        Self { kind, session, error: None }
    }

    #[must_use]
    pub fn initial(session: Option<Session>) -> Self {
        Self::new(AuthEventKind::InitialSession, session)
    }

    #[must_use]
    pub fn signed_in(session: Session) -> Self {
        Self::new(AuthEventKind::SignedIn, Some(session))
    }

    #[must_use]
    pub fn signed_out() -> Self {
        Self::new(AuthEventKind::SignedOut, None)
    }

    #[must_use]
    pub fn token_refreshed(session: Session) -> Self {
        Self::new(AuthEventKind::TokenRefreshed, Some(session))
    }

    /// Sign-out forced by the backend, e.g. an invalidated refresh token.
    #[must_use]
    pub fn invalidated(error: AuthError) -> Self {
        Self { kind: AuthEventKind::SignedOut, session: None, error: Some(error) }
    }
}

// =============================================================================
// PROVIDERS
// =============================================================================

/// Federated identity providers the app offers on its sign-in page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Github,
    Twitter,
    Facebook,
    Apple,
    Discord,
}

impl Provider {
    pub const ALL: [Self; 6] = [
        Self::Google,
        Self::Github,
        Self::Twitter,
        Self::Facebook,
        Self::Apple,
        Self::Discord,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Github => "github",
            Self::Twitter => "twitter",
            Self::Facebook => "facebook",
            Self::Apple => "apple",
            Self::Discord => "discord",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = AuthError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| AuthError::provider(format!("unsupported provider: {raw}")))
    }
}

/// Options for password sign-in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SignInOptions {
    /// "Remember me": ask the backend to keep the session across restarts.
    pub persist_session: bool,
}

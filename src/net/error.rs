//! Auth error taxonomy and backend failure classification.
//!
//! ERROR HANDLING
//! ==============
//! Every auth failure reaching the UI is an `AuthError` with a closed `kind`
//! plus a display message. Transport problems and backend rejections are
//! mapped into that taxonomy here so callers never branch on HTTP details.

#[cfg(test)]
#[path = "error_test.rs"]
mod error_test;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Machine-readable classification of an auth failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    InvalidCredentials,
    Validation,
    Conflict,
    AccountLocked,
    ProviderError,
    /// Network or service failure; retrying may succeed.
    Transient,
}

impl AuthErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::AccountLocked => "account_locked",
            Self::ProviderError => "provider_error",
            Self::Transient => "transient",
        }
    }
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of an auth operation, surfaced verbatim by sign-in forms.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AuthError {
    pub kind: AuthErrorKind,
    pub message: String,
}

impl AuthError {
    #[must_use]
    pub fn new(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    #[must_use]
    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::InvalidCredentials, message)
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Validation, message)
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Conflict, message)
    }

    #[must_use]
    pub fn account_locked(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::AccountLocked, message)
    }

    #[must_use]
    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::ProviderError, message)
    }

    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Transient, message)
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == AuthErrorKind::Transient
    }
}

/// Result of any auth operation. Success carries nothing.
pub type AuthOutcome = Result<(), AuthError>;

// =============================================================================
// BACKEND CLASSIFICATION
// =============================================================================

/// Which backend call produced a failure; status codes mean different things
/// per endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AuthFlow {
    SignUp,
    PasswordGrant,
    RefreshGrant,
    SignOut,
    OAuth,
    FetchUser,
}

/// Error body shapes returned by the auth API across versions.
///
/// Older deployments send `{"code": 400, "msg": ...}`, newer ones add
/// `error_code`, and the token endpoint uses OAuth-style `error` /
/// `error_description`.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub code: Option<Value>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorBody {
    fn code(&self) -> Option<String> {
        self.error_code
            .clone()
            .or_else(|| self.code.as_ref().and_then(Value::as_str).map(str::to_owned))
            .or_else(|| self.error.clone())
            .map(|c| c.to_ascii_lowercase())
    }

    fn description(&self, status: u16) -> String {
        [&self.error_description, &self.msg, &self.message, &self.error]
            .into_iter()
            .flatten()
            .find(|s| !s.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| format!("request failed with status {status}"))
    }
}

/// Map a non-success backend response onto the auth taxonomy.
pub(crate) fn classify(flow: AuthFlow, status: u16, body: &ErrorBody) -> AuthError {
    let message = description_for(flow, status, body);
    if status == 429 || status >= 500 {
        return AuthError::transient(message);
    }

    if let Some(code) = body.code() {
        if let Some(kind) = kind_for_code(&code) {
            return AuthError::new(kind, message);
        }
    }

    let lowered = message.to_ascii_lowercase();
    if lowered.contains("locked") || lowered.contains("banned") {
        return AuthError::account_locked(message);
    }
    if lowered.contains("already registered") || lowered.contains("already exists") || status == 409 {
        return AuthError::conflict(message);
    }

    let kind = match (flow, status) {
        (AuthFlow::PasswordGrant | AuthFlow::RefreshGrant, 400 | 401) => AuthErrorKind::InvalidCredentials,
        (AuthFlow::PasswordGrant, 403) => AuthErrorKind::AccountLocked,
        (AuthFlow::SignUp, 400 | 422) => AuthErrorKind::Validation,
        (AuthFlow::OAuth, _) => AuthErrorKind::ProviderError,
        (AuthFlow::FetchUser | AuthFlow::SignOut, 401 | 403) => AuthErrorKind::InvalidCredentials,
        _ => AuthErrorKind::Transient,
    };
    AuthError::new(kind, message)
}

fn description_for(flow: AuthFlow, status: u16, body: &ErrorBody) -> String {
    let description = body.description(status);
    match flow {
        AuthFlow::RefreshGrant => format!("session expired: {description}"),
        _ => description,
    }
}

fn kind_for_code(code: &str) -> Option<AuthErrorKind> {
    let kind = match code {
        "invalid_credentials" | "invalid_grant" | "refresh_token_not_found" | "refresh_token_already_used"
        | "session_not_found" | "session_expired" => AuthErrorKind::InvalidCredentials,
        "user_already_exists" | "email_exists" | "phone_exists" | "identity_already_exists" => {
            AuthErrorKind::Conflict
        }
        "user_banned" => AuthErrorKind::AccountLocked,
        "weak_password" | "validation_failed" | "email_address_invalid" | "email_address_not_authorized"
        | "signup_disabled" | "email_provider_disabled" => AuthErrorKind::Validation,
        "provider_disabled" | "bad_oauth_callback" | "bad_oauth_state" | "oauth_provider_not_supported"
        | "access_denied" => AuthErrorKind::ProviderError,
        "over_request_rate_limit" | "over_email_send_rate_limit" | "request_timeout" => AuthErrorKind::Transient,
        _ => return None,
    };
    Some(kind)
}

/// Transport, timeout, or decode failure talking to the backend.
pub(crate) fn transport_error(err: &reqwest::Error) -> AuthError {
    if err.is_timeout() {
        AuthError::transient("auth service timed out")
    } else if err.is_decode() {
        AuthError::transient(format!("unexpected auth service response: {err}"))
    } else {
        AuthError::transient(format!("auth service unreachable: {err}"))
    }
}

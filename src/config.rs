//! Runtime configuration parsed from environment variables.

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SITE_URL: &str = "http://localhost:8080";
pub const DEFAULT_SESSION_FILE: &str = ".huddle/session.json";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_REFRESH_MARGIN_SECS: u64 = 60;

/// Path the OAuth provider sends the browser back to after sign-in.
pub const OAUTH_LANDING_PATH: &str = "/dashboard";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {var}")]
    Missing { var: &'static str },
    #[error("{var} is not a valid URL: {value}")]
    InvalidUrl { var: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self { request_secs: DEFAULT_REQUEST_TIMEOUT_SECS, connect_secs: DEFAULT_CONNECT_TIMEOUT_SECS }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HuddleConfig {
    /// Hosted backend base URL, without trailing slash.
    pub backend_url: String,
    /// Public API key sent as `apikey` on every auth request.
    pub anon_key: String,
    /// App origin, without trailing slash.
    pub site_url: String,
    pub session_file: PathBuf,
    pub timeouts: HttpTimeouts,
    /// Upper bound on any single session-manager operation.
    pub op_timeout_secs: Option<u64>,
    pub refresh_margin_secs: u64,
}

impl HuddleConfig {
    /// Config with defaults for everything but the backend coordinates.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidUrl` if `backend_url` does not parse.
    pub fn new(backend_url: &str, anon_key: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            backend_url: parse_url("HUDDLE_BACKEND_URL", backend_url)?,
            anon_key: anon_key.to_owned(),
            site_url: DEFAULT_SITE_URL.to_owned(),
            session_file: PathBuf::from(DEFAULT_SESSION_FILE),
            timeouts: HttpTimeouts::default(),
            op_timeout_secs: None,
            refresh_margin_secs: DEFAULT_REFRESH_MARGIN_SECS,
        })
    }

    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `HUDDLE_BACKEND_URL`
    /// - `HUDDLE_ANON_KEY`
    ///
    /// Optional: see [`HuddleConfig::from_env_with`].
    ///
    /// # Errors
    ///
    /// Returns an error when a required variable is missing or a URL is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend_url = required("HUDDLE_BACKEND_URL")?;
        let anon_key = required("HUDDLE_ANON_KEY")?;
        Self::from_env_with(&backend_url, &anon_key)
    }

    /// Build config from explicit backend coordinates plus optional env vars.
    ///
    /// Optional:
    /// - `HUDDLE_SITE_URL`: default `http://localhost:8080`
    /// - `HUDDLE_SESSION_FILE`: default `.huddle/session.json`
    /// - `HUDDLE_REQUEST_TIMEOUT_SECS`: default 30
    /// - `HUDDLE_CONNECT_TIMEOUT_SECS`: default 10
    /// - `HUDDLE_OP_TIMEOUT_SECS`: unset means no timeout
    /// - `HUDDLE_REFRESH_MARGIN_SECS`: default 60
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidUrl` if a URL does not parse.
    pub fn from_env_with(backend_url: &str, anon_key: &str) -> Result<Self, ConfigError> {
        let mut config = Self::new(backend_url, anon_key)?;
        if let Some(site) = optional("HUDDLE_SITE_URL") {
            config.site_url = parse_url("HUDDLE_SITE_URL", &site)?;
        }
        if let Some(path) = optional("HUDDLE_SESSION_FILE") {
            config.session_file = PathBuf::from(path);
        }
        config.timeouts = HttpTimeouts {
            request_secs: env_parse_u64("HUDDLE_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_secs: env_parse_u64("HUDDLE_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
        };
        config.op_timeout_secs = optional("HUDDLE_OP_TIMEOUT_SECS").as_deref().and_then(parse_u64);
        config.refresh_margin_secs = env_parse_u64("HUDDLE_REFRESH_MARGIN_SECS", DEFAULT_REFRESH_MARGIN_SECS);
        Ok(config)
    }

    /// Where OAuth providers should land the browser after sign-in.
    #[must_use]
    pub fn oauth_redirect_to(&self) -> String {
        format!("{}{OAUTH_LANDING_PATH}", self.site_url)
    }

    #[must_use]
    pub fn op_timeout(&self) -> Option<Duration> {
        self.op_timeout_secs.map(Duration::from_secs)
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    optional(var).ok_or(ConfigError::Missing { var })
}

fn optional(var: &str) -> Option<String> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_owned()),
        _ => None,
    }
}

fn env_parse_u64(key: &str, default: u64) -> u64 {
    optional(key).as_deref().and_then(parse_u64).unwrap_or(default)
}

fn parse_u64(raw: &str) -> Option<u64> {
    match raw.parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => None,
    }
}

fn parse_url(var: &'static str, raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    match url::Url::parse(trimmed) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(trimmed.to_owned()),
        _ => Err(ConfigError::InvalidUrl { var, value: raw.to_owned() }),
    }
}

//! Application route table.
//!
//! DESIGN
//! ======
//! Every path the app serves maps to one `AppRoute`. Each route declares how
//! it is reached: guarded by auth, an unconditional redirect, or open to all.
//! `resolve` turns a raw path plus the current auth snapshot into the route
//! and the decision the router should act on.

#[cfg(test)]
#[path = "routes_test.rs"]
mod routes_test;

use std::fmt;

use crate::state::auth::AuthState;
use crate::util::auth::{AUTHENTICATED_HOME, Access, GuardDecision, PUBLIC_ENTRY, Redirect, guard};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppRoute {
    /// `/`: always forwards to the dashboard.
    Root,
    Auth,
    Dashboard,
    Groups,
    NewGroup,
    Group(String),
    Events,
    NewEvent,
    Messages,
    Friends,
    Settings,
    Profile,
    NotFound(String),
}

/// How a route is reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteKind {
    Guarded(Access),
    RedirectOnly(&'static str),
    Open,
}

impl AppRoute {
    /// Match a request path. Query strings, fragments and a trailing slash
    /// are ignored.
    #[must_use]
    pub fn parse(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        if !path.starts_with('/') {
            return Self::NotFound(path.to_owned());
        }
        let trimmed = path.trim_end_matches('/');
        let segments: Vec<&str> = trimmed.split('/').skip(1).collect();
        match segments.as_slice() {
            [] => Self::Root,
            ["auth"] => Self::Auth,
            ["dashboard"] => Self::Dashboard,
            ["groups"] => Self::Groups,
            ["groups", "new"] => Self::NewGroup,
            ["groups", id] if !id.is_empty() => Self::Group((*id).to_owned()),
            ["events"] => Self::Events,
            ["events", "new"] => Self::NewEvent,
            ["messages"] => Self::Messages,
            ["friends"] => Self::Friends,
            ["settings"] => Self::Settings,
            ["profile"] => Self::Profile,
            _ => Self::NotFound(path.to_owned()),
        }
    }

    /// Canonical path for this route.
    #[must_use]
    pub fn path(&self) -> String {
        match self {
            Self::Root => "/".to_owned(),
            Self::Auth => PUBLIC_ENTRY.to_owned(),
            Self::Dashboard => AUTHENTICATED_HOME.to_owned(),
            Self::Groups => "/groups".to_owned(),
            Self::NewGroup => "/groups/new".to_owned(),
            Self::Group(id) => format!("/groups/{id}"),
            Self::Events => "/events".to_owned(),
            Self::NewEvent => "/events/new".to_owned(),
            Self::Messages => "/messages".to_owned(),
            Self::Friends => "/friends".to_owned(),
            Self::Settings => "/settings".to_owned(),
            Self::Profile => "/profile".to_owned(),
            Self::NotFound(path) => path.clone(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> RouteKind {
        match self {
            Self::Root => RouteKind::RedirectOnly(AUTHENTICATED_HOME),
            Self::Auth => RouteKind::Guarded(Access::PublicOnly),
            Self::NotFound(_) => RouteKind::Open,
            _ => RouteKind::Guarded(Access::Protected),
        }
    }

    /// Decision for this route given the current auth state.
    #[must_use]
    pub fn decide(&self, state: &AuthState) -> GuardDecision {
        match self.kind() {
            RouteKind::Guarded(access) => guard(access, state),
            RouteKind::RedirectOnly(to) => GuardDecision::Redirect(Redirect::replace(to)),
            RouteKind::Open => GuardDecision::Render,
        }
    }
}

impl fmt::Display for AppRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Parse `path` and decide it against `state`.
#[must_use]
pub fn resolve(path: &str, state: &AuthState) -> (AppRoute, GuardDecision) {
    let route = AppRoute::parse(path);
    let decision = route.decide(state);
    (route, decision)
}

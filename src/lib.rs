//! Huddle Up authentication core.
//!
//! SYSTEM CONTEXT
//! ==============
//! Owns "who is signed in" for the app: a session manager that mirrors the
//! hosted backend's auth events into an observable state snapshot, route
//! guards that turn that snapshot into render/redirect decisions, and a
//! REST client for the backend's auth API.
//!
//! ARCHITECTURE
//! ============
//! - `net`: wire types, error taxonomy, and the HTTP backend.
//! - `services`: backend seam, in-memory backend, session stores, manager.
//! - `state`: the auth state snapshot.
//! - `util` / `routes`: guards and the route table.
//! - `config`: environment-driven settings.

pub mod config;
pub mod net;
pub mod routes;
pub mod services;
pub mod state;
pub mod util;

//! Wire-level types for the hosted auth backend.
//!
//! SYSTEM CONTEXT
//! ==============
//! `types` defines the user/session/event schema, `error` the auth failure
//! taxonomy, and `gotrue` the REST client that speaks the backend's auth API.

pub mod error;
pub mod gotrue;
pub mod types;
